//! The torrent's piece bitset (§4.1).
//!
//! `PieceMap` is the ground truth for "what do we have": it tracks which
//! pieces have been durably written to storage (`have`) and which have
//! passed hash verification but not necessarily been flushed yet
//! (`passed`). It does not decide what to request next -- that's
//! [`crate::piece_picker::PiecePicker`] -- it only answers "do we have
//! piece `i`" and "how many bytes of block `(piece, offset, len)` are
//! actually wanted", accounting for padding files.

use crate::error::{Error, Result};
use crate::storage_info::StorageInfo;
use crate::{Bitfield, PieceIndex};

/// The torrent's piece bitset and piece-size derivation.
pub struct PieceMap {
    /// Pieces durably written to storage.
    have: Bitfield,
    /// Pieces that passed hash verification, whether or not the write has
    /// been confirmed durable yet. Invariant: `have ⊆ passed`.
    passed: Bitfield,
    storage: StorageInfo,
}

impl PieceMap {
    pub fn new(storage: StorageInfo) -> Self {
        let num_pieces = storage.piece_count;
        Self {
            have: Bitfield::repeat(false, num_pieces),
            passed: Bitfield::repeat(false, num_pieces),
            storage,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.storage.piece_count
    }

    /// The number of pieces durably written to storage.
    pub fn num_have(&self) -> usize {
        self.have.count_ones()
    }

    /// The number of pieces that passed hash verification.
    pub fn num_passed(&self) -> usize {
        self.passed.count_ones()
    }

    pub fn have(&self, index: PieceIndex) -> bool {
        self.have.get(index).map(|b| *b).unwrap_or(false)
    }

    pub fn passed(&self, index: PieceIndex) -> bool {
        self.passed.get(index).map(|b| *b).unwrap_or(false)
    }

    /// Returns a read-only view of the have-bitfield, e.g. for sending a
    /// `Bitfield` message to a newly connected peer.
    pub fn have_bitfield(&self) -> &Bitfield {
        &self.have
    }

    /// Marks a piece as having passed hash verification. Does not yet mark
    /// it `have`: that only happens once storage confirms the write is
    /// durable, via [`Self::mark_have`].
    pub fn mark_passed(&mut self, index: PieceIndex) {
        self.passed.set(index, true);
    }

    /// Marks a piece as durably written. Requires the piece to have already
    /// passed verification (`have ⊆ passed`).
    pub fn mark_have(&mut self, index: PieceIndex) {
        debug_assert!(
            self.passed(index),
            "a piece must pass verification before it can be marked have"
        );
        self.have.set(index, true);
    }

    /// Reverses a hash failure: clears both the `have` and `passed` bits for
    /// the piece. Per §4.2, this must complete before the piece is unlocked
    /// for re-picking, and should only be called once the corresponding
    /// on-disk clear has completed.
    pub fn clear(&mut self, index: PieceIndex) {
        self.have.set(index, false);
        self.passed.set(index, false);
    }

    /// Returns the length of the piece at `index`, accounting for the
    /// (possibly shorter) last piece.
    pub fn piece_size(&self, index: PieceIndex) -> Result<u32> {
        self.storage.piece_len(index)
    }

    /// Returns the number of bytes within the given block range that
    /// belong to non-padding files -- the quantity actually worth
    /// requesting/writing. A block wholly inside a padding file returns 0.
    pub fn block_bytes_wanted(
        &self,
        piece: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Result<u64> {
        if piece >= self.num_pieces() {
            return Err(Error::InvalidPieceIndex(piece));
        }
        self.storage.block_bytes_wanted(piece, offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::{FileInfo, FsStructure};
    use std::path::PathBuf;

    fn single_file_map(piece_count: usize, piece_len: u32, last_piece_len: u32) -> PieceMap {
        let download_len =
            (piece_count as u64 - 1) * piece_len as u64 + last_piece_len as u64;
        let storage = StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir: PathBuf::from("/tmp"),
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("/tmp/f"),
                len: download_len,
                torrent_offset: 0,
                is_padding: false,
            }),
        };
        PieceMap::new(storage)
    }

    #[test]
    fn test_have_implies_passed_invariant_is_enforced_by_api() {
        let mut map = single_file_map(3, 16384, 16384);
        map.mark_passed(0);
        map.mark_have(0);
        assert!(map.have(0));
        assert!(map.passed(0));
        assert_eq!(map.num_have(), 1);
        assert_eq!(map.num_passed(), 1);
    }

    #[test]
    fn test_clear_resets_both_bits() {
        let mut map = single_file_map(2, 16384, 16384);
        map.mark_passed(1);
        map.mark_have(1);
        map.clear(1);
        assert!(!map.have(1));
        assert!(!map.passed(1));
        assert_eq!(map.num_have(), 0);
    }

    #[test]
    fn test_block_bytes_wanted_invalid_piece() {
        let map = single_file_map(2, 16384, 16384);
        assert!(map.block_bytes_wanted(5, 0, 100).is_err());
    }
}
