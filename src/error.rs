//! Crate-wide error types.
//!
//! Following the conventions already established in the disk and peer
//! session code, errors are plain enums rather than a `thiserror`-derived
//! type: each variant implements [`std::fmt::Display`] by hand and the
//! top-level [`Error`] implements [`std::error::Error`]. Propagation is
//! local to the component that detected it unless §7 of the design
//! mandates a state transition; nothing in this crate panics its way
//! across a component boundary.

use std::fmt;
use std::io;

use crate::PieceIndex;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The top-level error kinds the swarm engine can produce, per the error
/// handling design (§7): each is handled differently by [`crate::torrent`].
#[derive(Debug)]
pub enum Error {
    /// A temporary read/write failure, or an EOF on an unfinished read.
    /// Recovered by retry or by marking affected blocks for re-request;
    /// does not change torrent state.
    TransientIo(io::Error),
    /// The disk is full. Transitions the torrent to upload-mode; seeding
    /// continues with what's already downloaded.
    DiskFull,
    /// The storage backend denied access. Transitions the torrent to
    /// upload-mode, same as `DiskFull`.
    PermissionDenied,
    /// An unrecoverable disk error. Transitions the torrent to `Error`.
    FatalDisk(io::Error),
    /// A downloaded piece's hash did not match the expected hash.
    HashMismatch(PieceIndex),
    /// A peer sent a malformed or out-of-protocol frame. The peer is
    /// disconnected; this is never fatal to the torrent.
    ProtocolError(String),
    /// A tracker request failed (non-2xx HTTP, parseable error body, or
    /// network failure). Never fatal to the torrent.
    TrackerError(String),
    /// Resume data failed validation and was rejected; the torrent proceeds
    /// as though started fresh.
    ResumeDataRejected(String),
    /// A peer was rejected by the IP/port filter. Not an error state; the
    /// peer is silently dropped (an alert is still emitted).
    FilterBlocked,
    /// The given piece index does not exist in this torrent.
    InvalidPieceIndex(PieceIndex),
    /// The given torrent id is not known to this engine instance.
    InvalidTorrentId,
    /// A peer claimed an info hash that doesn't match ours.
    InvalidPeerInfoHash,
    /// We expect to only download from seeds (no piece availability
    /// exchange support yet) and the peer isn't one.
    PeerNotSeed,
    /// Peer sent a bitfield message outside of the availability-exchange
    /// phase of the connection.
    BitfieldNotAfterHandshake,
    /// Bencode (de)serialization failure.
    Bencode(serde_bencode::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TransientIo(e) => write!(f, "transient io error: {}", e),
            Error::DiskFull => write!(f, "disk full"),
            Error::PermissionDenied => write!(f, "permission denied"),
            Error::FatalDisk(e) => write!(f, "fatal disk error: {}", e),
            Error::HashMismatch(index) => {
                write!(f, "piece {} failed hash check", index)
            }
            Error::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            Error::TrackerError(msg) => write!(f, "tracker error: {}", msg),
            Error::ResumeDataRejected(msg) => {
                write!(f, "resume data rejected: {}", msg)
            }
            Error::FilterBlocked => write!(f, "peer blocked by filter"),
            Error::InvalidPieceIndex(index) => {
                write!(f, "invalid piece index: {}", index)
            }
            Error::InvalidTorrentId => write!(f, "invalid torrent id"),
            Error::InvalidPeerInfoHash => {
                write!(f, "peer announced a mismatching info hash")
            }
            Error::PeerNotSeed => write!(f, "peer is not a seed"),
            Error::BitfieldNotAfterHandshake => {
                write!(f, "peer sent bitfield outside of availability exchange")
            }
            Error::Bencode(e) => write!(f, "bencode error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::TransientIo(e) | Error::FatalDisk(e) => Some(e),
            Error::Bencode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        // Callers that can distinguish transient from fatal disk errors
        // should construct the right variant directly; this conversion is
        // the conservative default used at the edges (e.g. `?` in code that
        // hasn't classified the error yet).
        Error::TransientIo(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::Bencode(e)
    }
}

/// Errors that can occur while allocating storage for a new torrent.
///
/// Kept distinct from [`Error`] because the disk actor needs to report it
/// over its own alert channel without torrent-level context.
#[derive(Debug)]
pub enum NewTorrentError {
    AlreadyExists,
    Io(io::Error),
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NewTorrentError::AlreadyExists => {
                write!(f, "torrent already allocated")
            }
            NewTorrentError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for NewTorrentError {}

impl From<io::Error> for NewTorrentError {
    fn from(e: io::Error) -> Self {
        NewTorrentError::Io(e)
    }
}

/// Errors that can occur while writing a block to the storage backend.
#[derive(Debug)]
pub enum WriteError {
    InvalidPieceIndex,
    Io(io::Error),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::InvalidPieceIndex => write!(f, "invalid piece index"),
            WriteError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for WriteError {}

impl From<io::Error> for WriteError {
    fn from(e: io::Error) -> Self {
        WriteError::Io(e)
    }
}
