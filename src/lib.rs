// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

pub mod alert;
pub mod choke;
mod counter;
pub mod error;
pub mod metainfo;
pub mod peer_list;
pub mod peer_session;
pub mod piece_map;
pub mod piece_picker;
pub mod resume;
pub mod storage;
pub mod storage_info;
pub mod torrent;
pub mod tracker;

use bitvec::prelude::{BitVec, Msb0};

pub use storage_info::FileInfo;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// The type of a file's index.
pub type FileIndex = usize;

/// Each torrent gets a randomly assigned ID that is unique within the
/// application.
pub type TorrentId = u32;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least significants
/// bits, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001` would
/// mean that we have pieces 0, 1, and 7). A truthy boolean value of a piece's
/// position in this vector means that the peer has the piece, while a falsy
/// value means it doesn't have the piece.
pub type Bitfield = BitVec<Msb0, u8>;

/// A piece's download/upload priority, in `0..=7`.
///
/// `0` means not-wanted: the piece is excluded from totals and from interest
/// computation. `1` is normal priority. `7` is reserved for deadline-forced
/// (time-critical) pieces; priorities `6` and `7` are also used transiently by
/// the anti-sparse ("prioritize adjacent to owned") boost.
pub type PiecePriority = u8;

/// The highest value a [`PiecePriority`] may take.
pub const MAX_PIECE_PRIORITY: PiecePriority = 7;

/// The default block length, used unless the torrent's piece length forces a
/// different size (see [`derive_block_size`]). It is the widely used and
/// accepted 16 KiB.
pub const DEFAULT_BLOCK_LEN: u32 = 0x4000;

/// Derives the block length to use for a torrent with the given piece
/// length.
///
/// The result is always a power of two. It starts from
/// [`DEFAULT_BLOCK_LEN`], is reduced if `piece_len` is smaller than that (so
/// that a piece always contains at least one block), and is raised if more
/// than 256 blocks would otherwise be needed to cover a single piece (so
/// that the per-piece block bookkeeping stays bounded).
pub fn derive_block_size(piece_len: u32) -> u32 {
    debug_assert!(piece_len > 0);
    let mut block_len = DEFAULT_BLOCK_LEN;
    if piece_len < block_len {
        block_len = prev_pow2(piece_len);
    }
    while block_len > 0 && piece_len / block_len > 256 {
        block_len *= 2;
    }
    block_len
}

/// Returns the largest power of two that is less than or equal to `n`.
fn prev_pow2(n: u32) -> u32 {
    if n <= 1 {
        1
    } else {
        1u32 << (31 - n.leading_zeros())
    }
}

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading torrents happen at this block level
/// granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes.
    pub len: u32,
}

impl BlockInfo {
    /// Returns the index of the block within its piece, given the torrent's
    /// block size.
    pub fn index_in_piece(&self, block_len: u32) -> usize {
        debug_assert!(self.len <= block_len);
        debug_assert!(self.len > 0);
        (self.offset / block_len) as usize
    }
}

/// A `(piece_index, block_index)` pair identifying a block without carrying
/// its length, used as the picker/session's bookkeeping key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockKey {
    pub piece_index: PieceIndex,
    pub block_index: usize,
}

/// Returns the length of the block at the index in piece, given `block_len`.
///
/// If the piece is not a multiple of `block_len`, the returned value is
/// smaller for the last block in the piece.
///
/// # Panics
///
/// Panics if the index multiplied by `block_len` would exceed the piece
/// length.
pub fn block_len_at(piece_len: u32, block_len: u32, index: usize) -> u32 {
    let index = index as u32;
    let block_offset = index * block_len;
    assert!(piece_len > block_offset, "block index out of bounds for piece");
    std::cmp::min(piece_len - block_offset, block_len)
}

/// Returns the number of blocks in a piece of the given length, given
/// `block_len`.
pub fn block_count_for(piece_len: u32, block_len: u32) -> usize {
    (piece_len as usize + (block_len as usize - 1)) / block_len as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_LEN: u32 = DEFAULT_BLOCK_LEN;

    // An arbitrary piece length that is an exact multiple of the canonical
    // block length (16 KiB).
    const BLOCK_LEN_MULTIPLE_PIECE_LEN: u32 = 2 * BLOCK_LEN;

    // An arbitrary piece length that is _not_ a multiple of the canonical block
    // length and the amount with which it overlaps the nearest exact multiple
    // value.
    const OVERLAP: u32 = 234;
    const UNEVEN_PIECE_LEN: u32 = 2 * BLOCK_LEN + OVERLAP;

    #[test]
    fn test_block_len() {
        assert_eq!(
            block_len_at(BLOCK_LEN_MULTIPLE_PIECE_LEN, BLOCK_LEN, 0),
            BLOCK_LEN
        );
        assert_eq!(
            block_len_at(BLOCK_LEN_MULTIPLE_PIECE_LEN, BLOCK_LEN, 1),
            BLOCK_LEN
        );

        assert_eq!(block_len_at(UNEVEN_PIECE_LEN, BLOCK_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len_at(UNEVEN_PIECE_LEN, BLOCK_LEN, 1), BLOCK_LEN);
        assert_eq!(block_len_at(UNEVEN_PIECE_LEN, BLOCK_LEN, 2), OVERLAP);
    }

    #[test]
    #[should_panic]
    fn test_block_len_invalid_index_panic() {
        block_len_at(BLOCK_LEN_MULTIPLE_PIECE_LEN, BLOCK_LEN, 2);
    }

    #[test]
    fn test_block_count() {
        assert_eq!(
            block_count_for(BLOCK_LEN_MULTIPLE_PIECE_LEN, BLOCK_LEN),
            2
        );
        assert_eq!(block_count_for(UNEVEN_PIECE_LEN, BLOCK_LEN), 3);
    }

    #[test]
    fn test_derive_block_size_default() {
        // a piece length that comfortably fits the default block size keeps it
        assert_eq!(derive_block_size(1 << 20), DEFAULT_BLOCK_LEN);
    }

    #[test]
    fn test_derive_block_size_reduced_for_small_piece() {
        // a piece smaller than the default block length reduces the block
        // length to fit (rounded down to a power of two)
        assert_eq!(derive_block_size(1000), 512);
        assert_eq!(derive_block_size(1), 1);
    }

    #[test]
    fn test_derive_block_size_raised_for_huge_piece() {
        // a piece so large that more than 256 default-sized blocks would be
        // needed raises the block length
        let piece_len = DEFAULT_BLOCK_LEN * 1024;
        let block_len = derive_block_size(piece_len);
        assert!(block_len > DEFAULT_BLOCK_LEN);
        assert!(piece_len / block_len <= 256);
    }
}
