//! The storage/transport trait boundary (§4.8, §6 "Storage backend").
//!
//! Disk and network I/O are explicitly out of scope for this crate: it
//! drives a [`StorageHandle`] the embedder supplies rather than owning
//! file descriptors itself. This mirrors the teacher's `disk::io::Disk`
//! actor in spirit (an isolated worker reached via commands/alerts) while
//! narrowing the surface to exactly the operations §6 lists, expressed as
//! an `async_trait` since this crate targets a pre-async-fn-in-traits
//! tokio generation.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::{FileIndex, PieceIndex, Sha1Hash};

/// Flags accompanying an [`StorageHandle::hash`] request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HashFlags {
    /// Hint that the piece will be read once, sequentially; backends may
    /// use this to skip populating a page cache.
    pub sequential_access: bool,
    /// Hint that the underlying pages may be evicted as soon as hashing
    /// completes (e.g. after a successful verification in volatile
    /// seed-mode storage).
    pub volatile: bool,
}

/// The outcome of [`StorageHandle::check_fastresume`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FastresumeOutcome {
    /// The resume data matches on-disk state; no re-hashing is needed.
    NoError,
    /// The resume data is unusable (missing, corrupt, or stale); every
    /// piece must be re-hashed.
    NeedFullCheck,
    /// A disk error occurred while validating resume data.
    FatalDiskError,
}

/// A policy for [`StorageHandle::move_storage`] when the destination
/// already contains files that would be overwritten.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveStoragePolicy {
    AlwaysReplace,
    FailIfExist,
    DontReplace,
}

/// The outcome of a move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveStorageOutcome {
    Ok,
    NeedFullCheck,
}

/// The async boundary between the swarm engine and a concrete disk
/// implementation. Every method corresponds 1:1 to an external interface
/// named in §6; the engine calls these and awaits the result inline in
/// its single-threaded per-torrent loop rather than modeling its own
/// actor, leaving backpressure and batching to the implementation.
#[async_trait]
pub trait StorageHandle: Send + Sync {
    async fn read(&self, piece: PieceIndex, offset: u32, len: u32) -> Result<Vec<u8>>;

    async fn write(&self, piece: PieceIndex, offset: u32, buf: Vec<u8>) -> Result<()>;

    async fn hash(&self, piece: PieceIndex, flags: HashFlags) -> Result<Sha1Hash>;

    /// Clears a piece's data after a hash failure. Must serialize with any
    /// outstanding writes to the same piece (§4.2 "restore_piece").
    async fn clear_piece(&self, piece: PieceIndex) -> Result<()>;

    async fn release_files(&self) -> Result<()>;

    async fn stop_torrent(&self) -> Result<()>;

    async fn delete_files(&self) -> Result<()>;

    async fn rename_file(&self, index: FileIndex, new_name: String) -> Result<()>;

    async fn move_storage(
        &self,
        new_path: String,
        policy: MoveStoragePolicy,
    ) -> Result<MoveStorageOutcome>;

    async fn save_resume_data(&self) -> Result<Vec<u8>>;

    async fn check_fastresume(&self, blob: Option<&[u8]>) -> Result<FastresumeOutcome>;
}

#[cfg(test)]
pub mod test_support {
    //! An in-memory [`StorageHandle`] for unit and integration tests,
    //! analogous in purpose to the teacher's disk actor but without any
    //! real file I/O, matching this crate's "do not exercise the real
    //! filesystem in unit tests" convention.

    use super::*;
    use sha1::{Digest, Sha1};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryStorage {
        pieces: Mutex<HashMap<PieceIndex, Vec<u8>>>,
    }

    impl MemoryStorage {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed_piece(&self, piece: PieceIndex, data: Vec<u8>) {
            self.pieces.lock().unwrap().insert(piece, data);
        }
    }

    #[async_trait]
    impl StorageHandle for MemoryStorage {
        async fn read(&self, piece: PieceIndex, offset: u32, len: u32) -> Result<Vec<u8>> {
            let pieces = self.pieces.lock().unwrap();
            let data = pieces
                .get(&piece)
                .ok_or(Error::InvalidPieceIndex(piece))?;
            let start = offset as usize;
            let end = (start + len as usize).min(data.len());
            Ok(data[start..end].to_vec())
        }

        async fn write(&self, piece: PieceIndex, offset: u32, buf: Vec<u8>) -> Result<()> {
            let mut pieces = self.pieces.lock().unwrap();
            let entry = pieces.entry(piece).or_default();
            let end = offset as usize + buf.len();
            if entry.len() < end {
                entry.resize(end, 0);
            }
            entry[offset as usize..end].copy_from_slice(&buf);
            Ok(())
        }

        async fn hash(&self, piece: PieceIndex, _flags: HashFlags) -> Result<Sha1Hash> {
            let pieces = self.pieces.lock().unwrap();
            let data = pieces
                .get(&piece)
                .ok_or(Error::InvalidPieceIndex(piece))?;
            let digest = Sha1::digest(data);
            let mut hash = [0; 20];
            hash.copy_from_slice(&digest);
            Ok(hash)
        }

        async fn clear_piece(&self, piece: PieceIndex) -> Result<()> {
            self.pieces.lock().unwrap().remove(&piece);
            Ok(())
        }

        async fn release_files(&self) -> Result<()> {
            Ok(())
        }

        async fn stop_torrent(&self) -> Result<()> {
            Ok(())
        }

        async fn delete_files(&self) -> Result<()> {
            self.pieces.lock().unwrap().clear();
            Ok(())
        }

        async fn rename_file(&self, _index: FileIndex, _new_name: String) -> Result<()> {
            Ok(())
        }

        async fn move_storage(
            &self,
            _new_path: String,
            _policy: MoveStoragePolicy,
        ) -> Result<MoveStorageOutcome> {
            Ok(MoveStorageOutcome::Ok)
        }

        async fn save_resume_data(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn check_fastresume(&self, blob: Option<&[u8]>) -> Result<FastresumeOutcome> {
            Ok(if blob.is_some() {
                FastresumeOutcome::NoError
            } else {
                FastresumeOutcome::NeedFullCheck
            })
        }
    }

    #[tokio::test]
    async fn test_memory_storage_write_then_read_roundtrip() {
        let storage = MemoryStorage::new();
        storage.write(0, 0, vec![1, 2, 3, 4]).await.unwrap();
        let data = storage.read(0, 1, 2).await.unwrap();
        assert_eq!(data, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_memory_storage_hash_matches_written_bytes() {
        let storage = MemoryStorage::new();
        storage.write(0, 0, vec![b'a'; 16]).await.unwrap();
        let expected = {
            let digest = Sha1::digest(&[b'a'; 16]);
            let mut hash = [0; 20];
            hash.copy_from_slice(&digest);
            hash
        };
        assert_eq!(storage.hash(0, HashFlags::default()).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_memory_storage_clear_piece_removes_data() {
        let storage = MemoryStorage::new();
        storage.write(0, 0, vec![1, 2, 3]).await.unwrap();
        storage.clear_piece(0).await.unwrap();
        assert!(storage.read(0, 0, 1).await.is_err());
    }
}
