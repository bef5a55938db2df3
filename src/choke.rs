//! Periodic unchoke-set selection (§4.5).
//!
//! There is no direct teacher analogue for this component -- the
//! retrieved snapshot of the engine predates peer upload support -- so
//! `ChokeController` is written fresh in the idiom the rest of the crate
//! uses for synchronous, plain-data components driven by a periodic tick
//! from the owning [`crate::torrent::SwarmTorrent`] loop, the same way
//! [`crate::piece_picker::PiecePicker`] is a pure struct called from the
//! event loop rather than a task of its own.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::piece_picker::SessionId;
use crate::PieceIndex;

/// Per-peer inputs the controller needs to rank candidates. Supplied
/// fresh by the caller on every [`ChokeController::run`] call; the
/// controller itself only remembers which sessions are currently in
/// which set.
#[derive(Clone, Copy, Debug)]
pub struct PeerSnapshot {
    pub session: SessionId,
    pub interested_in_us: bool,
    pub choking_us: bool,
    pub download_rate: f64,
    pub upload_rate: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Leech,
    Seed,
}

/// One assignment in a super-seeding round: the piece handed to a
/// specific peer, and when it was revealed.
struct Reveal {
    session: SessionId,
    piece: PieceIndex,
    revealed_at: Instant,
}

pub struct ChokeController {
    max_uploads: usize,
    unchoke_interval: Duration,
    optimistic_unchoke_interval: Duration,
    super_seeding_reveal_timeout: Duration,
    regular_unchoked: HashSet<SessionId>,
    optimistic_unchoked: Option<SessionId>,
    last_run: Option<Instant>,
    last_optimistic_rotation: Option<Instant>,
    super_seeding: bool,
    reveals: Vec<Reveal>,
}

/// The outcome of a [`ChokeController::run`] call: the full unchoke set
/// and, separately, which sessions newly transitioned so the caller
/// knows which `Choke`/`Unchoke` frames to actually send.
pub struct ChokeDecision {
    pub unchoked: HashSet<SessionId>,
    pub newly_unchoked: Vec<SessionId>,
    pub newly_choked: Vec<SessionId>,
    /// In super-seeding mode: pieces newly revealed to a peer this round.
    pub reveals: Vec<(SessionId, PieceIndex)>,
}

impl ChokeController {
    pub fn new(
        max_uploads: usize,
        unchoke_interval: Duration,
        optimistic_unchoke_interval: Duration,
        super_seeding_reveal_timeout: Duration,
    ) -> Self {
        Self {
            max_uploads,
            unchoke_interval,
            optimistic_unchoke_interval,
            super_seeding_reveal_timeout,
            regular_unchoked: HashSet::new(),
            optimistic_unchoked: None,
            last_run: None,
            last_optimistic_rotation: None,
            super_seeding: false,
            reveals: Vec::new(),
        }
    }

    pub fn set_super_seeding(&mut self, super_seeding: bool) {
        self.super_seeding = super_seeding;
        if !super_seeding {
            self.reveals.clear();
        }
    }

    /// True if enough time has passed since the last run to justify
    /// calling [`Self::run`] again.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_run {
            Some(t) => now.duration_since(t) >= self.unchoke_interval,
            None => true,
        }
    }

    /// Evaluates the unchoke set against the given peer snapshots. `seed`
    /// selects whether to rank by upload or download rate (§4.5
    /// "Algorithm").
    pub fn run(&mut self, peers: &[PeerSnapshot], seed: bool, now: Instant) -> ChokeDecision {
        self.last_run = Some(now);
        if self.super_seeding {
            return self.run_super_seeding(peers, now);
        }

        let mode = if seed { Mode::Seed } else { Mode::Leech };
        let mut candidates: Vec<&PeerSnapshot> = peers
            .iter()
            .filter(|p| p.interested_in_us)
            .collect();
        candidates.sort_by(|a, b| {
            let score = |p: &PeerSnapshot| match mode {
                Mode::Leech => p.download_rate,
                Mode::Seed => p.upload_rate,
            };
            score(b)
                .partial_cmp(&score(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let regular_slots = self.max_uploads.saturating_sub(1);
        let new_regular: HashSet<SessionId> = candidates
            .iter()
            .take(regular_slots)
            .map(|p| p.session)
            .collect();

        let rotate_optimistic = match self.last_optimistic_rotation {
            Some(t) => now.duration_since(t) >= self.optimistic_unchoke_interval,
            None => true,
        };
        if rotate_optimistic {
            self.last_optimistic_rotation = Some(now);
            self.optimistic_unchoked = candidates
                .iter()
                .map(|p| p.session)
                .find(|s| !new_regular.contains(s) && Some(*s) != self.optimistic_unchoked)
                .or(self.optimistic_unchoked);
        } else if let Some(cur) = self.optimistic_unchoked {
            // keep the current optimistic pick alive unless it dropped out
            // of the interested set entirely
            if !peers.iter().any(|p| p.session == cur && p.interested_in_us) {
                self.optimistic_unchoked = None;
            }
        }

        let mut new_unchoked = new_regular.clone();
        if let Some(opt) = self.optimistic_unchoked {
            new_unchoked.insert(opt);
        }

        let newly_unchoked: Vec<SessionId> = new_unchoked
            .difference(&self.regular_unchoked)
            .copied()
            .collect();
        let newly_choked: Vec<SessionId> = self
            .regular_unchoked
            .difference(&new_unchoked)
            .copied()
            .collect();

        self.regular_unchoked = new_unchoked.clone();

        ChokeDecision {
            unchoked: new_unchoked,
            newly_unchoked,
            newly_choked,
            reveals: Vec::new(),
        }
    }

    /// In super-seeding mode unchoking is driven entirely by [`Self::reveal`]
    /// calls the caller makes once it picks, per newly-interested peer, a
    /// piece nobody else has been handed yet (§4.5 "Super-seeding variant");
    /// this just expires stale reveals and reports who is currently
    /// unchoked as a result.
    fn run_super_seeding(&mut self, _peers: &[PeerSnapshot], now: Instant) -> ChokeDecision {
        self.reveals
            .retain(|r| now.duration_since(r.revealed_at) < self.super_seeding_reveal_timeout * 4);

        let unchoked: HashSet<SessionId> = self.reveals.iter().map(|r| r.session).collect();
        ChokeDecision {
            unchoked,
            newly_unchoked: Vec::new(),
            newly_choked: Vec::new(),
            reveals: Vec::new(),
        }
    }

    /// Records that `piece` was revealed to `session` in super-seeding
    /// mode. Never reveals the same piece to more than one peer unless
    /// the caller explicitly calls this again for it (§4.5 "Super-seeding
    /// variant").
    pub fn reveal(&mut self, session: SessionId, piece: PieceIndex, now: Instant) {
        self.reveals.retain(|r| r.session != session);
        self.reveals.push(Reveal {
            session,
            piece,
            revealed_at: now,
        });
    }

    pub fn revealed_pieces(&self) -> HashSet<PieceIndex> {
        self.reveals.iter().map(|r| r.piece).collect()
    }

    pub fn is_unchoked(&self, session: SessionId) -> bool {
        self.regular_unchoked.contains(&session) || self.optimistic_unchoked == Some(session)
    }
}
