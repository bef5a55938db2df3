//! The alert bus (§4.9, §6 "Alert bus"): the engine never throws an
//! error across a component boundary (§7 "Propagation policy") -- every
//! user-visible event, success or failure, is instead pushed onto an
//! unbounded channel the embedder drains at its own pace. Modeled after
//! the teacher's `disk::io` actor pattern of posting results back to the
//! owning loop via an `mpsc` channel rather than returning them directly.

use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::Error;
use crate::{PieceIndex, Sha1Hash, TorrentId};

/// Why a peer was blocked before a connection was even attempted, as
/// opposed to [`Alert::PeerBanned`] which covers post-connection bans.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockReason {
    IpFilter,
    PortFilter,
    SelfConnection,
}

/// A non-fatal condition worth surfacing to the embedder without being an
/// [`Error`] in its own right (§6 "performance warnings").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PerformanceWarning {
    /// The torrent's outstanding request pipeline is shallower than its
    /// computed target because too few peers are unchoked.
    TooFewUnchokedPeers,
    /// A piece has been stalled (no new bytes) long enough to be
    /// considered for duplicate/busy-mode requesting.
    PieceStalled(PieceIndex),
    /// The disk write queue is backing up relative to network throughput.
    DiskWriteBacklog,
}

/// Every user-visible event the swarm engine can emit.
#[derive(Clone, Debug)]
pub enum Alert {
    MetadataReceived {
        torrent: TorrentId,
    },
    PieceFinished {
        torrent: TorrentId,
        piece: PieceIndex,
    },
    PieceFailed {
        torrent: TorrentId,
        piece: PieceIndex,
    },
    TrackerAnnounce {
        torrent: TorrentId,
        url: String,
    },
    TrackerError {
        torrent: TorrentId,
        url: String,
        message: String,
    },
    TrackerReply {
        torrent: TorrentId,
        url: String,
        num_peers: usize,
    },
    FileError {
        torrent: TorrentId,
        file: crate::FileIndex,
        message: String,
    },
    StorageMoved {
        torrent: TorrentId,
        new_path: String,
    },
    SaveResumeData {
        torrent: TorrentId,
        result: Result<Vec<u8>, String>,
    },
    PeerBlocked {
        torrent: TorrentId,
        addr: std::net::SocketAddr,
        reason: BlockReason,
    },
    PeerBanned {
        torrent: TorrentId,
        addr: std::net::SocketAddr,
    },
    ReadPiece {
        torrent: TorrentId,
        piece: PieceIndex,
        result: Result<Vec<u8>, String>,
    },
    FileCompleted {
        torrent: TorrentId,
        file: crate::FileIndex,
    },
    TorrentFinished {
        torrent: TorrentId,
    },
    TorrentPaused {
        torrent: TorrentId,
    },
    TorrentResumed {
        torrent: TorrentId,
    },
    TorrentDeleted {
        torrent: TorrentId,
        info_hash: Sha1Hash,
    },
    HashFailed {
        torrent: TorrentId,
        piece: PieceIndex,
    },
    PerformanceWarning {
        torrent: TorrentId,
        warning: PerformanceWarning,
    },
}

impl Alert {
    pub fn torrent(&self) -> TorrentId {
        match self {
            Alert::MetadataReceived { torrent }
            | Alert::PieceFinished { torrent, .. }
            | Alert::PieceFailed { torrent, .. }
            | Alert::TrackerAnnounce { torrent, .. }
            | Alert::TrackerError { torrent, .. }
            | Alert::TrackerReply { torrent, .. }
            | Alert::FileError { torrent, .. }
            | Alert::StorageMoved { torrent, .. }
            | Alert::SaveResumeData { torrent, .. }
            | Alert::PeerBlocked { torrent, .. }
            | Alert::PeerBanned { torrent, .. }
            | Alert::ReadPiece { torrent, .. }
            | Alert::FileCompleted { torrent, .. }
            | Alert::TorrentFinished { torrent }
            | Alert::TorrentPaused { torrent }
            | Alert::TorrentResumed { torrent }
            | Alert::TorrentDeleted { torrent, .. }
            | Alert::HashFailed { torrent, .. }
            | Alert::PerformanceWarning { torrent, .. } => *torrent,
        }
    }
}

/// Converts an internal [`Error`] into the alert that should be emitted
/// for it, per the propagation policy in §7 ("errors are always reported
/// through the alert bus"). Errors with no natural per-torrent alert
/// (e.g. `InvalidTorrentId`) return `None`; the caller logs those instead.
pub fn alert_for_error(torrent: TorrentId, piece: Option<PieceIndex>, err: &Error) -> Option<Alert> {
    match err {
        Error::HashMismatch(piece) => Some(Alert::HashFailed {
            torrent,
            piece: *piece,
        }),
        Error::TrackerError(msg) => Some(Alert::TrackerError {
            torrent,
            url: String::new(),
            message: msg.clone(),
        }),
        Error::DiskFull | Error::PermissionDenied | Error::FatalDisk(_) => {
            piece.map(|piece| Alert::PieceFailed { torrent, piece })
        }
        _ => None,
    }
}

/// The sending half held by the engine internals.
pub type AlertSender = UnboundedSender<Alert>;
/// The receiving half handed to the embedder.
pub type AlertReceiver = UnboundedReceiver<Alert>;

pub fn channel() -> (AlertSender, AlertReceiver) {
    mpsc::unbounded_channel()
}

/// How long a full drain of the alert channel should be allowed to block
/// during graceful shutdown before the caller gives up waiting (§5
/// "Cancellation": "a short drain period is required before the object
/// is released").
pub fn shutdown_drain_timeout() -> Duration {
    Duration::from_secs(2)
}
