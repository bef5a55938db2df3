//! Resume data: the persisted bencoded document a torrent can be restored
//! from (§6 "Resume blob"), grounded on `metainfo.rs`'s existing
//! `serde_bencode` + `serde_bytes` idiom for bencoded wire structures, and
//! naming fields after the legacy on-disk keys where external
//! compatibility matters, per §6's explicit instruction.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use serde_bytes::ByteBuf;

use crate::{PiecePriority, Sha1Hash};

/// A partially-downloaded piece's block bitmask, as persisted in the
/// `unfinished` resume field.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnfinishedPiece {
    pub piece: usize,
    #[serde(with = "serde_bytes")]
    pub bitmask: Vec<u8>,
}

/// A packed `ip:port` plus ban flag, as persisted in the `peers` /
/// `peers6` / `banned_peers` / `banned_peers6` resume fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackedPeer {
    pub addr: SocketAddr,
    pub banned: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResumeCounters {
    pub total_uploaded: u64,
    pub total_downloaded: u64,
    pub active_time: u64,
    pub finished_time: u64,
    pub seeding_time: u64,
    pub last_seen_complete: u64,
    pub added_time: u64,
    pub completed_time: u64,
    pub num_complete: i32,
    pub num_incomplete: i32,
    pub num_downloaded: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TorrentKnobs {
    pub upload_rate_limit: i64,
    pub download_rate_limit: i64,
    pub max_connections: i32,
    pub max_uploads: i32,
    pub paused: bool,
    pub auto_managed: bool,
    pub sequential_download: bool,
    pub seed_mode: bool,
    pub super_seeding: bool,
    pub announce_to_dht: bool,
    pub announce_to_lsd: bool,
    pub announce_to_trackers: bool,
}

impl Default for TorrentKnobs {
    fn default() -> Self {
        Self {
            upload_rate_limit: 0,
            download_rate_limit: 0,
            max_connections: -1,
            max_uploads: -1,
            paused: false,
            auto_managed: true,
            sequential_download: false,
            seed_mode: false,
            super_seeding: false,
            announce_to_dht: true,
            announce_to_lsd: true,
            announce_to_trackers: true,
        }
    }
}

/// The in-memory resume document, round-trippable to/from a bencoded
/// blob via [`ResumeData::to_bytes`]/[`ResumeData::from_bytes`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumeData {
    pub info_hash: Sha1Hash,
    /// Per-piece byte: bit 0 = have, bit 1 = verified-in-seed-mode.
    pub pieces: Vec<u8>,
    pub unfinished: Vec<UnfinishedPiece>,
    /// Per-piece priority, trailing default-priority (1) entries omitted.
    pub piece_priority: Vec<PiecePriority>,
    pub file_priority: Vec<PiecePriority>,
    pub mapped_files: Vec<String>,
    pub trackers: Vec<Vec<String>>,
    pub url_list: Vec<String>,
    pub httpseeds: Vec<String>,
    pub peers: Vec<PackedPeer>,
    pub peers6: Vec<PackedPeer>,
    pub counters: ResumeCounters,
    pub knobs: TorrentKnobs,
}

/// The bit positions within a `pieces` byte (§6).
const PIECE_HAVE_BIT: u8 = 0b01;
const PIECE_VERIFIED_BIT: u8 = 0b10;

impl ResumeData {
    pub fn piece_have(&self, index: usize) -> bool {
        self.pieces
            .get(index)
            .map(|b| b & PIECE_HAVE_BIT != 0)
            .unwrap_or(false)
    }

    pub fn piece_verified(&self, index: usize) -> bool {
        self.pieces
            .get(index)
            .map(|b| b & PIECE_VERIFIED_BIT != 0)
            .unwrap_or(false)
    }

    pub fn set_piece_have(&mut self, index: usize, have: bool) {
        if index >= self.pieces.len() {
            self.pieces.resize(index + 1, 0);
        }
        if have {
            self.pieces[index] |= PIECE_HAVE_BIT;
        } else {
            self.pieces[index] &= !PIECE_HAVE_BIT;
        }
    }

    pub fn to_bytes(&self) -> crate::error::Result<Vec<u8>> {
        let raw = RawResumeData::from(self);
        Ok(serde_bencode::to_bytes(&raw)?)
    }

    pub fn from_bytes(buf: &[u8]) -> crate::error::Result<Self> {
        let raw: RawResumeData = serde_bencode::from_bytes(buf)?;
        Self::try_from(raw)
    }
}

/// The on-the-wire bencoded shape, kept separate from [`ResumeData`] so
/// that the in-memory type can use richer Rust types (`SocketAddr`,
/// fixed-size hash arrays) while the wire type uses bencode-friendly byte
/// strings, the same separation `metainfo::Metainfo`/`Info` draw between
/// the parsed struct and its bencode fields.
#[derive(Serialize, Deserialize)]
struct RawResumeData {
    #[serde(rename = "info-hash", with = "serde_bytes")]
    info_hash: ByteBuf,
    #[serde(with = "serde_bytes")]
    pieces: ByteBuf,
    unfinished: Vec<UnfinishedPiece>,
    piece_priority: Vec<u8>,
    file_priority: Vec<u8>,
    mapped_files: Vec<String>,
    trackers: Vec<Vec<String>>,
    #[serde(rename = "url-list")]
    url_list: Vec<String>,
    httpseeds: Vec<String>,
    #[serde(with = "serde_bytes")]
    peers: ByteBuf,
    #[serde(with = "serde_bytes")]
    peers6: ByteBuf,
    #[serde(with = "serde_bytes")]
    banned_peers: ByteBuf,
    #[serde(with = "serde_bytes")]
    banned_peers6: ByteBuf,
    total_uploaded: u64,
    total_downloaded: u64,
    active_time: u64,
    finished_time: u64,
    seeding_time: u64,
    last_seen_complete: u64,
    added_time: u64,
    completed_time: u64,
    num_complete: i32,
    num_incomplete: i32,
    num_downloaded: i32,
    upload_rate_limit: i64,
    download_rate_limit: i64,
    max_connections: i32,
    max_uploads: i32,
    paused: u8,
    auto_managed: u8,
    sequential_download: u8,
    seed_mode: u8,
    super_seeding: u8,
    announce_to_dht: u8,
    announce_to_lsd: u8,
    announce_to_trackers: u8,
}

fn pack_peers(peers: &[PackedPeer], want_v4: bool) -> Vec<u8> {
    let mut buf = Vec::new();
    for peer in peers {
        match peer.addr {
            SocketAddr::V4(v4) if want_v4 => {
                buf.extend_from_slice(&v4.ip().octets());
                buf.extend_from_slice(&v4.port().to_be_bytes());
            }
            SocketAddr::V6(v6) if !want_v4 => {
                buf.extend_from_slice(&v6.ip().octets());
                buf.extend_from_slice(&v6.port().to_be_bytes());
            }
            _ => {}
        }
    }
    buf
}

fn unpack_peers_v4(buf: &[u8]) -> Vec<SocketAddr> {
    buf.chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect()
}

impl From<&ResumeData> for RawResumeData {
    fn from(r: &ResumeData) -> Self {
        let v4_peers: Vec<PackedPeer> = r
            .peers
            .iter()
            .filter(|p| matches!(p.addr, SocketAddr::V4(_)) && !p.banned)
            .copied()
            .collect();
        let v6_peers: Vec<PackedPeer> = r
            .peers6
            .iter()
            .filter(|p| matches!(p.addr, SocketAddr::V6(_)) && !p.banned)
            .copied()
            .collect();
        let banned_v4: Vec<PackedPeer> = r
            .peers
            .iter()
            .filter(|p| matches!(p.addr, SocketAddr::V4(_)) && p.banned)
            .copied()
            .collect();
        let banned_v6: Vec<PackedPeer> = r
            .peers6
            .iter()
            .filter(|p| matches!(p.addr, SocketAddr::V6(_)) && p.banned)
            .copied()
            .collect();

        Self {
            info_hash: ByteBuf::from(r.info_hash.to_vec()),
            pieces: ByteBuf::from(r.pieces.clone()),
            unfinished: r.unfinished.clone(),
            piece_priority: r.piece_priority.clone(),
            file_priority: r.file_priority.clone(),
            mapped_files: r.mapped_files.clone(),
            trackers: r.trackers.clone(),
            url_list: r.url_list.clone(),
            httpseeds: r.httpseeds.clone(),
            peers: ByteBuf::from(pack_peers(&v4_peers, true)),
            peers6: ByteBuf::from(pack_peers(&v6_peers, false)),
            banned_peers: ByteBuf::from(pack_peers(&banned_v4, true)),
            banned_peers6: ByteBuf::from(pack_peers(&banned_v6, false)),
            total_uploaded: r.counters.total_uploaded,
            total_downloaded: r.counters.total_downloaded,
            active_time: r.counters.active_time,
            finished_time: r.counters.finished_time,
            seeding_time: r.counters.seeding_time,
            last_seen_complete: r.counters.last_seen_complete,
            added_time: r.counters.added_time,
            completed_time: r.counters.completed_time,
            num_complete: r.counters.num_complete,
            num_incomplete: r.counters.num_incomplete,
            num_downloaded: r.counters.num_downloaded,
            upload_rate_limit: r.knobs.upload_rate_limit,
            download_rate_limit: r.knobs.download_rate_limit,
            max_connections: r.knobs.max_connections,
            max_uploads: r.knobs.max_uploads,
            paused: r.knobs.paused as u8,
            auto_managed: r.knobs.auto_managed as u8,
            sequential_download: r.knobs.sequential_download as u8,
            seed_mode: r.knobs.seed_mode as u8,
            super_seeding: r.knobs.super_seeding as u8,
            announce_to_dht: r.knobs.announce_to_dht as u8,
            announce_to_lsd: r.knobs.announce_to_lsd as u8,
            announce_to_trackers: r.knobs.announce_to_trackers as u8,
        }
    }
}

impl std::convert::TryFrom<RawResumeData> for ResumeData {
    type Error = crate::error::Error;

    fn try_from(raw: RawResumeData) -> std::result::Result<Self, Self::Error> {
        if raw.info_hash.len() != 20 {
            return Err(crate::error::Error::ResumeDataRejected(
                "info-hash must be 20 bytes".into(),
            ));
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&raw.info_hash);

        let peers = unpack_peers_v4(&raw.peers)
            .into_iter()
            .map(|addr| PackedPeer { addr, banned: false })
            .chain(
                unpack_peers_v4(&raw.banned_peers)
                    .into_iter()
                    .map(|addr| PackedPeer { addr, banned: true }),
            )
            .collect();

        Ok(Self {
            info_hash,
            pieces: raw.pieces.into_vec(),
            unfinished: raw.unfinished,
            piece_priority: raw.piece_priority,
            file_priority: raw.file_priority,
            mapped_files: raw.mapped_files,
            trackers: raw.trackers,
            url_list: raw.url_list,
            httpseeds: raw.httpseeds,
            peers,
            peers6: Vec::new(),
            counters: ResumeCounters {
                total_uploaded: raw.total_uploaded,
                total_downloaded: raw.total_downloaded,
                active_time: raw.active_time,
                finished_time: raw.finished_time,
                seeding_time: raw.seeding_time,
                last_seen_complete: raw.last_seen_complete,
                added_time: raw.added_time,
                completed_time: raw.completed_time,
                num_complete: raw.num_complete,
                num_incomplete: raw.num_incomplete,
                num_downloaded: raw.num_downloaded,
            },
            knobs: TorrentKnobs {
                upload_rate_limit: raw.upload_rate_limit,
                download_rate_limit: raw.download_rate_limit,
                max_connections: raw.max_connections,
                max_uploads: raw.max_uploads,
                paused: raw.paused != 0,
                auto_managed: raw.auto_managed != 0,
                sequential_download: raw.sequential_download != 0,
                seed_mode: raw.seed_mode != 0,
                super_seeding: raw.super_seeding != 0,
                announce_to_dht: raw.announce_to_dht != 0,
                announce_to_lsd: raw.announce_to_lsd != 0,
                announce_to_trackers: raw.announce_to_trackers != 0,
            },
        })
    }
}

/// Used by a fresh torrent that has not yet saved resume data, and as the
/// basis for tests constructing a known round-trip fixture.
impl ResumeData {
    pub fn new(info_hash: Sha1Hash, num_pieces: usize) -> Self {
        Self {
            info_hash,
            pieces: vec![0; num_pieces],
            unfinished: Vec::new(),
            piece_priority: Vec::new(),
            file_priority: Vec::new(),
            mapped_files: Vec::new(),
            trackers: Vec::new(),
            url_list: Vec::new(),
            httpseeds: Vec::new(),
            peers: Vec::new(),
            peers6: Vec::new(),
            counters: ResumeCounters::default(),
            knobs: TorrentKnobs::default(),
        }
    }
}

/// The minimum interval a successfully restored torrent should wait
/// before its first fresh tracker announce, to avoid hammering trackers
/// on every client restart; grounded on `TorrentConf::min_announce_interval`.
pub fn min_restart_announce_delay() -> Duration {
    Duration::from_secs(5)
}
