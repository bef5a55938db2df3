//! Decides which block to request next for a given peer (§4.2).
//!
//! `PiecePicker` is a pure data structure: it has no knowledge of sockets,
//! no async boundaries, and performs no retries. It is driven entirely by
//! calls from [`crate::peer_session`] and [`crate::torrent`]. All mutation
//! happens synchronously so that the single-threaded event loop's ordering
//! guarantees (§5) hold without extra locking at this layer (callers are
//! still free to wrap it in an `RwLock` when shared across tasks, as the
//! teacher's `peer.rs` already does for the pre-swarm-engine picker).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use rand::Rng;

use crate::counter::SpeedBucket;
use crate::error::{Error, Result};
use crate::{BlockInfo, BlockKey, PieceIndex, PiecePriority};

/// Opaque identifier for a peer session, assigned by the torrent. The
/// picker never dereferences it; it's only used to track which sessions
/// are already pursuing a given block, and to prefer round-robin spread
/// under tie-breaks.
pub type SessionId = u64;

/// Per-block download state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockState {
    None,
    Requested,
    Writing,
    Finished,
}

/// A single outstanding (possibly duplicate, in endgame/busy mode) request
/// for a block.
#[derive(Clone, Debug)]
struct Requester {
    session: SessionId,
    /// True if this is an intentional duplicate (busy mode or endgame),
    /// as opposed to the original request.
    busy: bool,
}

#[derive(Debug)]
struct PieceState {
    priority: PiecePriority,
    availability: u32,
    block_states: Vec<BlockState>,
    /// Requesters per block, supporting up to `max_parallel_block_requests`
    /// concurrent (duplicate) requests per invariant 2.
    requesters: Vec<Vec<Requester>>,
    locked: bool,
    /// Set when the first block of the piece was requested; used to detect
    /// "stalled" pieces (§4.2 step 6) and to order the time-critical queue.
    first_requested_at: Option<Instant>,
    deadline: Option<Instant>,
}

impl PieceState {
    fn new(num_blocks: usize, priority: PiecePriority) -> Self {
        Self {
            priority,
            availability: 0,
            block_states: vec![BlockState::None; num_blocks],
            requesters: vec![Vec::new(); num_blocks],
            locked: false,
            first_requested_at: None,
            deadline: None,
        }
    }

    fn is_wanted(&self) -> bool {
        self.priority > 0
    }

    fn has_none_block(&self) -> bool {
        self.block_states.iter().any(|s| *s == BlockState::None)
    }

    fn is_complete(&self) -> bool {
        self.block_states
            .iter()
            .all(|s| *s == BlockState::Finished)
    }
}

/// Options that affect a single `pick_blocks` call, supplied by the
/// requesting [`crate::peer_session::PeerSession`].
#[derive(Clone, Copy, Debug)]
pub struct PickOptions {
    pub session: SessionId,
    pub speed: SpeedBucket,
}

/// Picks the next blocks to request for a session, implementing the
/// selection algorithm of §4.2: time-critical pieces first, then
/// sequential-or-rarest-first, preferring pieces already in progress,
/// then busy-mode and endgame duplicate requests once the piece or the
/// whole torrent is close to done.
pub struct PiecePicker {
    pieces: Vec<PieceState>,
    block_counts: Vec<usize>,
    piece_len: u32,
    last_piece_len: u32,
    block_len: u32,
    sequential: bool,
    /// Anti-sparse mode: pieces adjacent to owned pieces get a temporary
    /// priority boost.
    anti_sparse: bool,
    endgame_unfinished_block_threshold: usize,
    max_parallel_block_requests: usize,
    stalled_piece_factor: f64,
    /// A running average of time-to-complete-a-piece, used to detect
    /// stalled pieces.
    avg_piece_download_secs: f64,
    rng_seed: u64,
}

impl PiecePicker {
    pub fn new(
        num_pieces: usize,
        piece_len: u32,
        last_piece_len: u32,
        block_len: u32,
        endgame_unfinished_block_threshold: usize,
        max_parallel_block_requests: usize,
        stalled_piece_factor: f64,
    ) -> Self {
        let block_counts: Vec<usize> = (0..num_pieces)
            .map(|i| {
                let len = if i == num_pieces - 1 {
                    last_piece_len
                } else {
                    piece_len
                };
                crate::block_count_for(len, block_len)
            })
            .collect();
        let pieces = block_counts
            .iter()
            .map(|&n| PieceState::new(n, 1))
            .collect();
        Self {
            pieces,
            block_counts,
            piece_len,
            last_piece_len,
            block_len,
            sequential: false,
            anti_sparse: false,
            endgame_unfinished_block_threshold,
            max_parallel_block_requests,
            stalled_piece_factor,
            avg_piece_download_secs: 30.0,
            rng_seed: rand::thread_rng().gen(),
        }
    }

    fn check_index(&self, index: PieceIndex) -> Result<()> {
        if index >= self.pieces.len() {
            Err(Error::InvalidPieceIndex(index))
        } else {
            Ok(())
        }
    }

    /// The number of blocks in piece `index`.
    pub fn block_count(&self, index: PieceIndex) -> usize {
        self.block_counts[index]
    }

    fn piece_len_at(&self, index: PieceIndex) -> u32 {
        if index == self.pieces.len() - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }


    // --- availability & priority ---

    /// Registers that a peer has announced piece `index` (via `have` or the
    /// initial bitfield). Increments the piece's availability count.
    pub fn has_piece(&mut self, index: PieceIndex) {
        if self.check_index(index).is_ok() {
            self.pieces[index].availability += 1;
        }
    }

    /// The inverse of [`Self::has_piece`], called when a peer disconnects
    /// or loses a piece it previously advertised.
    pub fn lost_piece(&mut self, index: PieceIndex) {
        if self.check_index(index).is_ok() {
            let piece = &mut self.pieces[index];
            piece.availability = piece.availability.saturating_sub(1);
        }
    }

    pub fn set_piece_priority(&mut self, index: PieceIndex, priority: PiecePriority) -> Result<()> {
        self.check_index(index)?;
        let piece = &mut self.pieces[index];
        if piece.priority == priority {
            // idempotence law: a repeated call with the same value is a
            // no-op
            return Ok(());
        }
        // dropping to 0 with outstanding blocks: leave them in place, but
        // stop offering new blocks from this piece and drop it from any
        // deadline queue (handled by clearing `deadline` below)
        piece.priority = priority;
        if priority == 0 {
            piece.deadline = None;
        }
        Ok(())
    }

    pub fn priority(&self, index: PieceIndex) -> Result<PiecePriority> {
        self.check_index(index)?;
        Ok(self.pieces[index].priority)
    }

    /// Marks piece `index` as a time-critical piece with the given
    /// deadline. The picker will prefer it over rarest-first/sequential
    /// selection as long as the deadline hasn't passed.
    pub fn set_deadline(&mut self, index: PieceIndex, deadline: Instant) -> Result<()> {
        self.check_index(index)?;
        self.pieces[index].deadline = Some(deadline);
        Ok(())
    }

    pub fn clear_deadline(&mut self, index: PieceIndex) {
        if self.check_index(index).is_ok() {
            self.pieces[index].deadline = None;
        }
    }

    pub fn set_sequential(&mut self, sequential: bool) {
        self.sequential = sequential;
    }

    pub fn set_anti_sparse(&mut self, anti_sparse: bool) {
        self.anti_sparse = anti_sparse;
    }

    /// The priority `candidate_piece_order` should actually rank piece
    /// `index` by: its stored priority, boosted to 6 (one owned neighbor)
    /// or 7 (both neighbors owned) while anti-sparse mode is on, so that
    /// sparse regions close up instead of leaving rarely-useful isolated
    /// pieces scattered across the swarm. Pieces already at the deadline
    /// priority (7) or excluded (0) are never boosted.
    fn effective_priority(&self, index: PieceIndex) -> PiecePriority {
        let piece = &self.pieces[index];
        if !self.anti_sparse || piece.priority == 0 || piece.priority >= 6 {
            return piece.priority;
        }
        let left_owned = index
            .checked_sub(1)
            .map(|i| self.pieces[i].is_complete())
            .unwrap_or(false);
        let right_owned = self
            .pieces
            .get(index + 1)
            .map(|p| p.is_complete())
            .unwrap_or(false);
        match (left_owned, right_owned) {
            (true, true) => 7,
            (true, false) | (false, true) => 6,
            (false, false) => piece.priority,
        }
    }

    // --- lifecycle ---

    /// Marks piece `index` as fully owned (e.g. on resume-data load or
    /// after the `have` broadcast decision has been made). Removes it from
    /// active picking.
    pub fn we_have(&mut self, index: PieceIndex) -> Result<()> {
        self.check_index(index)?;
        let piece = &mut self.pieces[index];
        for state in piece.block_states.iter_mut() {
            *state = BlockState::Finished;
        }
        piece.deadline = None;
        Ok(())
    }

    /// Reverses a piece after a hash-verification failure: every block of
    /// the piece returns to `None` and any requesters are forgotten. Per
    /// §4.2, the on-disk clear must complete before the piece is unlocked;
    /// callers should keep the piece locked (via [`Self::lock_piece`])
    /// across that window and call [`Self::unlock_piece`] once it's done.
    pub fn restore_piece(&mut self, index: PieceIndex) -> Result<()> {
        self.check_index(index)?;
        let piece = &mut self.pieces[index];
        for state in piece.block_states.iter_mut() {
            *state = BlockState::None;
        }
        for reqs in piece.requesters.iter_mut() {
            reqs.clear();
        }
        piece.first_requested_at = None;
        Ok(())
    }

    /// Prevents further picks from piece `index` until [`Self::unlock_piece`]
    /// is called. Used while storage clears a failed piece.
    pub fn lock_piece(&mut self, index: PieceIndex) -> Result<()> {
        self.check_index(index)?;
        self.pieces[index].locked = true;
        Ok(())
    }

    pub fn unlock_piece(&mut self, index: PieceIndex) -> Result<()> {
        self.check_index(index)?;
        self.pieces[index].locked = false;
        Ok(())
    }

    pub fn is_locked(&self, index: PieceIndex) -> bool {
        self.pieces.get(index).map(|p| p.locked).unwrap_or(false)
    }

    // --- block transitions ---

    pub fn mark_as_downloading(&mut self, block: BlockKey, session: SessionId, busy: bool) -> Result<()> {
        self.check_index(block.piece_index)?;
        let piece = &mut self.pieces[block.piece_index];
        if piece.locked {
            return Err(Error::ProtocolError(format!(
                "piece {} is locked",
                block.piece_index
            )));
        }
        if piece.first_requested_at.is_none() {
            piece.first_requested_at = Some(Instant::now());
        }
        piece.block_states[block.block_index] = BlockState::Requested;
        piece.requesters[block.block_index].push(Requester { session, busy });
        Ok(())
    }

    pub fn mark_as_writing(&mut self, block: BlockKey) -> Result<()> {
        self.check_index(block.piece_index)?;
        self.pieces[block.piece_index].block_states[block.block_index] =
            BlockState::Writing;
        Ok(())
    }

    pub fn mark_as_finished(&mut self, block: BlockKey) -> Result<()> {
        self.check_index(block.piece_index)?;
        let piece = &mut self.pieces[block.piece_index];
        piece.block_states[block.block_index] = BlockState::Finished;
        if piece.is_complete() {
            if let Some(started) = piece.first_requested_at {
                let secs = started.elapsed().as_secs_f64();
                // simple exponential moving average
                self.avg_piece_download_secs =
                    0.8 * self.avg_piece_download_secs + 0.2 * secs;
            }
        }
        Ok(())
    }

    /// Returns true once every block of piece `index` is `Finished`.
    pub fn is_piece_complete(&self, index: PieceIndex) -> Result<bool> {
        self.check_index(index)?;
        Ok(self.pieces[index].is_complete())
    }

    /// Returns true once every *wanted* (priority > 0) piece is complete;
    /// pieces the caller has deprioritized to 0 don't block this.
    pub fn all_wanted_complete(&self) -> bool {
        self.pieces.iter().all(|p| !p.is_wanted() || p.is_complete())
    }

    /// Returns the distinct sessions that contributed at least one block
    /// to piece `index`, for hash-failure trust bookkeeping. Only
    /// meaningful before [`Self::restore_piece`] clears the requester
    /// lists.
    pub fn contributors(&self, index: PieceIndex) -> Vec<SessionId> {
        let mut sessions: Vec<SessionId> = self.pieces[index]
            .requesters
            .iter()
            .flat_map(|reqs| reqs.iter().map(|r| r.session))
            .collect();
        sessions.sort_unstable();
        sessions.dedup();
        sessions
    }

    /// Aborts a session's claim on a block, e.g. on disconnect or a second
    /// timeout. If no other session holds the block, its state reverts to
    /// `None` so it becomes pickable again.
    pub fn abort_download(&mut self, block: BlockKey, session: SessionId) -> Result<()> {
        self.check_index(block.piece_index)?;
        let piece = &mut self.pieces[block.piece_index];
        let reqs = &mut piece.requesters[block.block_index];
        reqs.retain(|r| r.session != session);
        if reqs.is_empty() {
            piece.block_states[block.block_index] = BlockState::None;
        }
        Ok(())
    }

    /// Returns true if the number of not-yet-finished wanted blocks across
    /// the whole torrent has fallen below the endgame threshold.
    pub fn is_endgame(&self) -> bool {
        self.unfinished_block_count() < self.endgame_unfinished_block_threshold
    }

    fn unfinished_block_count(&self) -> usize {
        self.pieces
            .iter()
            .filter(|p| p.is_wanted())
            .map(|p| {
                p.block_states
                    .iter()
                    .filter(|s| **s != BlockState::Finished)
                    .count()
            })
            .sum()
    }

    fn piece_is_stalled(&self, piece: &PieceState) -> bool {
        match piece.first_requested_at {
            Some(t) => {
                t.elapsed().as_secs_f64()
                    > self.avg_piece_download_secs * self.stalled_piece_factor
            }
            None => false,
        }
    }

    /// Selects up to `want_n` blocks to request from `peer_has`, the
    /// peer's bitfield of available pieces, per the algorithm in §4.2.
    pub fn pick_blocks(
        &mut self,
        peer_has: &crate::Bitfield,
        want_n: usize,
        already_requested: impl Fn(BlockKey) -> bool,
        opts: PickOptions,
    ) -> Vec<BlockInfo> {
        let mut picked = Vec::with_capacity(want_n);
        if want_n == 0 {
            return picked;
        }

        // step 1: time-critical pieces first
        let mut deadline_candidates: Vec<(PieceIndex, Instant)> = self
            .pieces
            .iter()
            .enumerate()
            .filter_map(|(i, p)| {
                if p.locked || !p.is_wanted() || p.is_complete() {
                    return None;
                }
                let has = peer_has.get(i).map(|b| *b).unwrap_or(false);
                if !has {
                    return None;
                }
                p.deadline.map(|d| (i, d))
            })
            .collect();
        deadline_candidates.sort_by_key(|(_, d)| *d);

        for (index, _) in deadline_candidates {
            if picked.len() >= want_n {
                return picked;
            }
            self.pick_from_piece(
                index,
                want_n - picked.len(),
                &already_requested,
                opts,
                &mut picked,
            );
        }
        if picked.len() >= want_n {
            return picked;
        }

        // step 2/3: sequential or rarest-first, preferring in-progress
        // pieces (step 4)
        let endgame = self.is_endgame();
        let candidate_order = self.candidate_piece_order(peer_has, opts.speed);
        for index in candidate_order {
            if picked.len() >= want_n {
                break;
            }
            self.pick_from_piece(
                index,
                want_n - picked.len(),
                &already_requested,
                opts,
                &mut picked,
            );
        }

        // step 6/7: busy mode / endgame duplicate requests
        if picked.len() < want_n {
            let dup_candidates = self.duplicate_candidate_order(peer_has, endgame);
            for index in dup_candidates {
                if picked.len() >= want_n {
                    break;
                }
                self.pick_duplicate_from_piece(
                    index,
                    want_n - picked.len(),
                    opts,
                    &mut picked,
                );
            }
        }

        picked
    }

    /// Returns the order in which wanted, peer-available, non-locked,
    /// non-complete pieces should be tried: sequential order if the
    /// torrent is in sequential mode, else by effective priority (plain
    /// priority, boosted by anti-sparse adjacency per
    /// [`Self::effective_priority`]) first, then rarest-first with a
    /// deterministic-but-spread tie-break, with in-progress pieces
    /// (partially downloaded) preferred unless they're stalled-and-slow
    /// while this peer is fast.
    fn candidate_piece_order(
        &self,
        peer_has: &crate::Bitfield,
        peer_speed: SpeedBucket,
    ) -> Vec<PieceIndex> {
        let mut candidates: Vec<PieceIndex> = (0..self.pieces.len())
            .filter(|&i| {
                let p = &self.pieces[i];
                !p.locked
                    && p.is_wanted()
                    && !p.is_complete()
                    && peer_has.get(i).map(|b| *b).unwrap_or(false)
            })
            .collect();

        if self.sequential {
            candidates.sort_unstable();
            return candidates;
        }

        #[derive(PartialEq, Eq)]
        struct Candidate {
            priority: PiecePriority,
            in_progress: bool,
            availability: u32,
            tie: u64,
            index: PieceIndex,
        }
        impl Ord for Candidate {
            fn cmp(&self, other: &Self) -> Ordering {
                // BinaryHeap is a max-heap, and the entry we want popped
                // first (highest priority, in progress, rarest) must
                // compare as the greatest, so availability is inverted
                // (lower is more preferable) while priority/in_progress
                // compare directly (higher/true is more preferable).
                self.priority
                    .cmp(&other.priority)
                    .then(self.in_progress.cmp(&other.in_progress))
                    .then(other.availability.cmp(&self.availability))
                    .then(other.tie.cmp(&self.tie))
            }
        }
        impl PartialOrd for Candidate {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap = BinaryHeap::new();
        for index in candidates {
            let piece = &self.pieces[index];
            let in_progress = piece
                .block_states
                .iter()
                .any(|s| *s != BlockState::None);
            // a slow-marked piece should not be preferred to a fast peer;
            // approximate "slow" as in-progress-but-stalled
            let in_progress = in_progress
                && !(self.piece_is_stalled(piece) && peer_speed == SpeedBucket::Fast);
            let tie = Self::spread_hash(self.rng_seed, index as u64);
            heap.push(Candidate {
                priority: self.effective_priority(index),
                in_progress,
                availability: piece.availability,
                tie,
                index,
            });
        }
        // `Candidate::cmp` is defined so that the most preferable entry
        // compares as the max; popping the heap in order gives us the
        // preference order directly.
        let mut order = Vec::with_capacity(heap.len());
        while let Some(c) = heap.pop() {
            order.push(c.index);
        }
        order
    }

    /// Pieces eligible for busy-mode (stalled, within-piece duplicate) or
    /// endgame (any wanted piece, torrent-wide duplicate) requests.
    fn duplicate_candidate_order(
        &self,
        peer_has: &crate::Bitfield,
        endgame: bool,
    ) -> Vec<PieceIndex> {
        (0..self.pieces.len())
            .filter(|&i| {
                let p = &self.pieces[i];
                if p.locked || !p.is_wanted() || p.is_complete() {
                    return false;
                }
                if !peer_has.get(i).map(|b| *b).unwrap_or(false) {
                    return false;
                }
                endgame || self.piece_is_stalled(p)
            })
            .collect()
    }

    fn pick_from_piece(
        &mut self,
        index: PieceIndex,
        want_n: usize,
        already_requested: &impl Fn(BlockKey) -> bool,
        opts: PickOptions,
        out: &mut Vec<BlockInfo>,
    ) {
        let piece_len = self.piece_len_at(index);
        let block_len = self.block_len;
        let piece = &mut self.pieces[index];
        if piece.locked {
            return;
        }
        let mut taken = 0;
        for (block_index, state) in piece.block_states.iter_mut().enumerate() {
            if taken >= want_n {
                break;
            }
            if *state != BlockState::None {
                continue;
            }
            let key = BlockKey {
                piece_index: index,
                block_index,
            };
            if already_requested(key) {
                continue;
            }
            *state = BlockState::Requested;
            piece.requesters[block_index].push(Requester {
                session: opts.session,
                busy: false,
            });
            if piece.first_requested_at.is_none() {
                piece.first_requested_at = Some(Instant::now());
            }
            out.push(BlockInfo {
                piece_index: index,
                offset: block_index as u32 * block_len,
                len: crate::block_len_at(piece_len, block_len, block_index),
            });
            taken += 1;
        }
    }

    fn pick_duplicate_from_piece(
        &mut self,
        index: PieceIndex,
        want_n: usize,
        opts: PickOptions,
        out: &mut Vec<BlockInfo>,
    ) {
        let piece_len = self.piece_len_at(index);
        let block_len = self.block_len;
        let max_parallel = self.max_parallel_block_requests;
        let piece = &mut self.pieces[index];
        if piece.locked {
            return;
        }
        // among not-finished blocks, prefer the block with fewest existing
        // requesters, and never exceed max_parallel_block_requests
        let mut candidates: Vec<usize> = piece
            .block_states
            .iter()
            .enumerate()
            .filter(|(i, s)| {
                **s != BlockState::Finished
                    && piece.requesters[*i].len() < max_parallel
                    && !piece.requesters[*i]
                        .iter()
                        .any(|r| r.session == opts.session)
            })
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by_key(|&i| piece.requesters[i].len());

        let mut taken = 0;
        for block_index in candidates {
            if taken >= want_n {
                break;
            }
            piece.requesters[block_index].push(Requester {
                session: opts.session,
                busy: true,
            });
            out.push(BlockInfo {
                piece_index: index,
                offset: block_index as u32 * block_len,
                len: crate::block_len_at(piece_len, block_len, block_index),
            });
            taken += 1;
        }
    }

    /// A cheap, deterministic hash used to spread rarest-first tie-breaks
    /// across a per-torrent random seed, rather than always favoring the
    /// lowest piece index (which would concentrate load on piece 0 across
    /// many torrents started at the same time).
    fn spread_hash(seed: u64, index: u64) -> u64 {
        let mut x = seed ^ index.wrapping_mul(0x9E3779B97F4A7C15);
        x ^= x >> 33;
        x = x.wrapping_mul(0xff51afd7ed558ccd);
        x ^= x >> 33;
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Bitfield;

    fn picker(num_pieces: usize, blocks_per_piece: usize) -> PiecePicker {
        const BLOCK_LEN: u32 = 16384;
        let piece_len = BLOCK_LEN * blocks_per_piece as u32;
        PiecePicker::new(
            num_pieces,
            piece_len,
            piece_len,
            BLOCK_LEN,
            20,
            2,
            1.0,
        )
    }

    fn all_has(n: usize) -> Bitfield {
        Bitfield::repeat(true, n)
    }

    #[test]
    fn test_zero_priority_excludes_from_candidates() {
        let mut p = picker(4, 1);
        p.set_piece_priority(0, 0).unwrap();
        let peer_has = all_has(4);
        let opts = PickOptions {
            session: 1,
            speed: SpeedBucket::Medium,
        };
        let picked = p.pick_blocks(&peer_has, 10, |_| false, opts);
        assert!(picked.iter().all(|b| b.piece_index != 0));
    }

    #[test]
    fn test_idempotent_priority_set() {
        let mut p = picker(2, 1);
        p.set_piece_priority(0, 3).unwrap();
        p.set_piece_priority(0, 3).unwrap();
        assert_eq!(p.priority(0).unwrap(), 3);
    }

    #[test]
    fn test_rarest_first_prefers_least_available() {
        let mut p = picker(3, 1);
        // piece 0 seen by 5 peers, piece 1 by 1 peer, piece 2 by 3 peers
        for _ in 0..5 {
            p.has_piece(0);
        }
        p.has_piece(1);
        for _ in 0..3 {
            p.has_piece(2);
        }
        let peer_has = all_has(3);
        let opts = PickOptions {
            session: 1,
            speed: SpeedBucket::Medium,
        };
        let picked = p.pick_blocks(&peer_has, 1, |_| false, opts);
        assert_eq!(picked[0].piece_index, 1);
    }

    #[test]
    fn test_sequential_mode_picks_lowest_index_first() {
        let mut p = picker(5, 1);
        p.set_sequential(true);
        // make piece 2 the rarest to prove sequential ignores rarity
        p.has_piece(2);
        let peer_has = all_has(5);
        let opts = PickOptions {
            session: 1,
            speed: SpeedBucket::Medium,
        };
        let picked = p.pick_blocks(&peer_has, 1, |_| false, opts);
        assert_eq!(picked[0].piece_index, 0);
    }

    #[test]
    fn test_lock_piece_prevents_pick_and_mark() {
        let mut p = picker(1, 2);
        p.lock_piece(0).unwrap();
        let peer_has = all_has(1);
        let opts = PickOptions {
            session: 1,
            speed: SpeedBucket::Medium,
        };
        let picked = p.pick_blocks(&peer_has, 2, |_| false, opts);
        assert!(picked.is_empty());
        let block = BlockKey {
            piece_index: 0,
            block_index: 0,
        };
        assert!(p.mark_as_downloading(block, 1, false).is_err());
    }

    #[test]
    fn test_restore_piece_resets_all_blocks() {
        let mut p = picker(1, 4);
        for i in 0..4 {
            let block = BlockKey {
                piece_index: 0,
                block_index: i,
            };
            p.mark_as_downloading(block, 1, false).unwrap();
        }
        p.restore_piece(0).unwrap();
        assert!(p.pieces[0].has_none_block());
        assert!(p.pieces[0]
            .block_states
            .iter()
            .all(|s| *s == BlockState::None));
    }

    #[test]
    fn test_endgame_allows_duplicate_request() {
        let mut p = picker(1, 4);
        // finish 3 of 4 blocks, leave one outstanding to session 1
        for i in 0..3 {
            let block = BlockKey {
                piece_index: 0,
                block_index: i,
            };
            p.mark_as_downloading(block, 1, false).unwrap();
            p.mark_as_finished(block).unwrap();
        }
        let last = BlockKey {
            piece_index: 0,
            block_index: 3,
        };
        p.mark_as_downloading(last, 1, false).unwrap();

        // lower the endgame threshold so a single outstanding block
        // triggers it
        p.endgame_unfinished_block_threshold = 5;
        assert!(p.is_endgame());

        let peer_has = all_has(1);
        let opts = PickOptions {
            session: 2,
            speed: SpeedBucket::Medium,
        };
        let picked = p.pick_blocks(&peer_has, 1, |_| false, opts);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].piece_index, 0);
        // the duplicate is recorded as a second requester for block 3
        assert_eq!(p.pieces[0].requesters[3].len(), 2);
    }

    #[test]
    fn test_anti_sparse_boosts_piece_between_two_owned_neighbors() {
        let mut p = picker(5, 1);
        p.set_anti_sparse(true);
        // complete pieces 1 and 3, leaving piece 2 sandwiched between two
        // owned neighbors and pieces 0/4 each adjacent to only one
        p.we_have(1).unwrap();
        p.we_have(3).unwrap();
        let peer_has = all_has(5);
        let opts = PickOptions {
            session: 1,
            speed: SpeedBucket::Medium,
        };
        let picked = p.pick_blocks(&peer_has, 1, |_| false, opts);
        assert_eq!(picked[0].piece_index, 2);
    }

    #[test]
    fn test_anti_sparse_disabled_ignores_adjacency() {
        let mut p = picker(3, 1);
        // piece 1 is the rarest; without anti-sparse boosting, rarity
        // alone should decide, regardless of piece 0 being "owned"
        p.we_have(0).unwrap();
        p.has_piece(1);
        for _ in 0..5 {
            p.has_piece(2);
        }
        let peer_has = all_has(3);
        let opts = PickOptions {
            session: 1,
            speed: SpeedBucket::Medium,
        };
        let picked = p.pick_blocks(&peer_has, 1, |_| false, opts);
        assert_eq!(picked[0].piece_index, 1);
    }

    #[test]
    fn test_deadline_piece_picked_before_rarer_piece() {
        let mut p = picker(2, 1);
        // piece 1 is rarer, but piece 0 has an (already-passed, i.e. most
        // urgent) deadline
        p.has_piece(1);
        p.set_deadline(0, Instant::now()).unwrap();
        let peer_has = all_has(2);
        let opts = PickOptions {
            session: 1,
            speed: SpeedBucket::Medium,
        };
        let picked = p.pick_blocks(&peer_has, 1, |_| false, opts);
        assert_eq!(picked[0].piece_index, 0);
    }
}
