//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default cratetorrent client id.
pub const CRATETORRENT_CLIENT_ID: &PeerId = b"cbt-0000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default cratetorrent client id,
    /// [`CRATETORRENT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *CRATETORRENT_CLIENT_ID,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    /// This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every 30 seconds.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,

    // --- piece picker ---
    /// When the number of unfinished blocks in the torrent falls below this
    /// count, the picker enters endgame mode and permits a second,
    /// duplicate request for any still-outstanding block.
    pub endgame_unfinished_block_threshold: usize,

    /// The maximum number of simultaneous requesters a single block may
    /// have, counting both the original and any `busy`/endgame duplicates
    /// (invariant 2 in the testable properties).
    pub max_parallel_block_requests: usize,

    /// A piece is considered "stalled" (eligible for busy-mode duplicate
    /// requests) if no request has arrived for it in longer than the
    /// torrent's observed average piece download time times this factor.
    pub stalled_piece_factor: f64,

    // --- peer list ---
    /// Capacity of the known-peer directory while the torrent is active.
    pub max_known_peers: usize,

    /// Capacity of the known-peer directory while the torrent is paused;
    /// smaller, since we don't need many connect candidates immediately.
    pub max_known_peers_paused: usize,

    /// Minimum time to wait before attempting to reconnect to a peer that
    /// previously failed, before exponential backoff (`2^min(failcount,6)`)
    /// is applied.
    pub min_reconnect_time: Duration,

    // --- choke controller ---
    /// How often the choke controller re-evaluates the unchoke set.
    pub unchoke_interval: Duration,

    /// How often the optimistic unchoke slot is rotated.
    pub optimistic_unchoke_interval: Duration,

    /// Maximum number of simultaneously unchoked peers (includes the
    /// optimistic slot).
    pub max_uploads: usize,

    /// In super-seeding mode, how long to wait after revealing a piece to a
    /// peer before considering revealing the next one to them, absent
    /// other signals that they've started distributing it.
    pub super_seeding_reveal_timeout: Duration,

    // --- peer session / request pipelining ---
    /// The smallest request queue depth a session will maintain once
    /// unchoked.
    pub min_request_queue_depth: usize,

    /// The largest request queue depth a session will maintain.
    pub max_request_queue_depth: usize,

    /// Target time, in flight, that the request queue should represent
    /// (used to derive the queue depth from the observed download rate).
    pub target_request_queue_time: Duration,

    /// The minimum per-request timeout, used when there isn't yet enough
    /// data to estimate round-trip time.
    pub min_request_timeout: Duration,

    // --- tracker controller ---
    /// Ceiling for the exponential tracker retry backoff.
    pub tracker_retry_delay_max: Duration,

    /// The smallest interval allowed between announces to the same
    /// tracker, regardless of what the tracker requests.
    pub min_announce_interval: Duration,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            // needs teting
            announce_interval: Duration::from_secs(60 * 60),
            // needs testing
            tracker_error_threshold: 15,

            endgame_unfinished_block_threshold: 20,
            max_parallel_block_requests: 2,
            stalled_piece_factor: 1.0,

            max_known_peers: 1000,
            max_known_peers_paused: 200,
            min_reconnect_time: Duration::from_secs(60),

            unchoke_interval: Duration::from_secs(10),
            optimistic_unchoke_interval: Duration::from_secs(30),
            max_uploads: 4,
            super_seeding_reveal_timeout: Duration::from_secs(30),

            min_request_queue_depth: 2,
            max_request_queue_depth: 500,
            target_request_queue_time: Duration::from_secs(3),
            min_request_timeout: Duration::from_secs(3),

            tracker_retry_delay_max: Duration::from_secs(600),
            min_announce_interval: Duration::from_secs(60 * 30),
        }
    }
}
