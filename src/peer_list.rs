//! Directory of known peers, connected or not (§4.3).
//!
//! `PeerList` is the torrent-scoped address book: every address we've ever
//! heard of via a tracker, PEX, DHT, LSD, resume data or an incoming
//! connection gets a [`KnownPeer`] entry here, bounded by an LRU-style cap.
//! It never holds a live connection itself -- [`crate::peer_session`] owns
//! that -- it only tracks enough metadata to rank candidates for the next
//! outgoing connection attempt and to enforce bans.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use lru::LruCache;

/// How a peer address was learned. A peer can be learned from more than one
/// source; the flags accumulate (§4.3 "Adding a peer").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerSource {
    pub tracker: bool,
    pub pex: bool,
    pub dht: bool,
    pub lsd: bool,
    pub resume: bool,
    pub incoming: bool,
}

impl PeerSource {
    pub fn merge(&mut self, other: PeerSource) {
        self.tracker |= other.tracker;
        self.pex |= other.pex;
        self.dht |= other.dht;
        self.lsd |= other.lsd;
        self.resume |= other.resume;
        self.incoming |= other.incoming;
    }
}

/// The lowest value [`KnownPeer::trust_points`] may take. Reached after
/// repeated hash failures attributed to this peer.
pub const MIN_TRUST_POINTS: i8 = -7;
/// The value a newly added peer starts at.
pub const INITIAL_TRUST_POINTS: i8 = 0;
/// The highest value [`KnownPeer::trust_points`] may take.
pub const MAX_TRUST_POINTS: i8 = 8;
/// The cap on [`KnownPeer::hashfails`]; beyond this, further failures are
/// not counted (but still affect `trust_points`).
pub const MAX_HASHFAILS: u16 = 255;

/// A peer we know about, whether or not we're currently connected to it.
#[derive(Clone, Debug)]
pub struct KnownPeer {
    pub addr: SocketAddr,
    pub source: PeerSource,
    pub failcount: u32,
    pub trust_points: i8,
    pub hashfails: u16,
    pub banned: bool,
    pub last_connected: Option<Instant>,
    /// Cumulative bytes transferred with this peer across past sessions,
    /// in KiB, retained for rank/diagnostics after the session ends.
    pub prev_session_downloaded_kb: u64,
    pub prev_session_uploaded_kb: u64,
    pub seed: bool,
    /// True if we have a usable port for this peer (as opposed to, e.g., a
    /// peer learned from an incoming connection whose listen port is
    /// unknown).
    pub connectable: bool,
    /// True while a `PeerSession` is live for this address.
    pub connected: bool,
}

impl KnownPeer {
    fn new(addr: SocketAddr, source: PeerSource) -> Self {
        Self {
            addr,
            source,
            failcount: 0,
            trust_points: INITIAL_TRUST_POINTS,
            hashfails: 0,
            banned: false,
            last_connected: None,
            prev_session_downloaded_kb: 0,
            prev_session_uploaded_kb: 0,
            seed: false,
            connectable: true,
            connected: false,
        }
    }

    /// The deterministic rank used both for eviction (worst rank evicted
    /// first) and, inverted, for candidate tie-breaking (best rank
    /// preferred). Lower is worse.
    ///
    /// Banned peers and peers with a higher failcount rank worst, per
    /// §4.3.
    fn rank(&self) -> (i32, i32, i32, i32, i32, i64) {
        (
            if self.banned { 0 } else { 1 },
            -(self.failcount as i32),
            self.trust_points as i32,
            self.source_weight(),
            if self.seed { 1 } else { 0 },
            self.last_connected
                .map(|t| -(t.elapsed().as_secs() as i64))
                .unwrap_or(i64::MIN),
        )
    }

    fn source_weight(&self) -> i32 {
        // a peer explicitly confirmed by a tracker or DHT lookup is worth
        // more than one merely guessed at via PEX/LSD
        let mut w = 0;
        if self.source.tracker {
            w += 2;
        }
        if self.source.dht {
            w += 2;
        }
        if self.source.pex {
            w += 1;
        }
        if self.source.lsd {
            w += 1;
        }
        if self.source.resume {
            w += 1;
        }
        w
    }

    fn reconnect_backoff(&self, min_reconnect_time: Duration) -> Duration {
        let shift = self.failcount.min(6);
        min_reconnect_time * 2u32.pow(shift)
    }

    fn is_in_backoff(&self, min_reconnect_time: Duration) -> bool {
        match self.last_connected {
            Some(t) => t.elapsed() < self.reconnect_backoff(min_reconnect_time),
            None => false,
        }
    }
}

/// Bounded directory of [`KnownPeer`] records for one torrent.
pub struct PeerList {
    peers: LruCache<SocketAddr, KnownPeer>,
    cap_active: usize,
    cap_paused: usize,
    min_reconnect_time: Duration,
    /// Round-robin cursor for [`Self::next_connect_candidate`], so repeated
    /// calls spread across the directory instead of always returning the
    /// same front-of-list peer.
    cursor: usize,
    we_are_seed: bool,
    paused: bool,
}

impl PeerList {
    pub fn new(cap_active: usize, cap_paused: usize, min_reconnect_time: Duration) -> Self {
        Self {
            // capacity is enforced ourselves in `enforce_cap` by rank
            // rather than recency, so the cache itself is unbounded
            peers: LruCache::new(usize::max_value()),
            cap_active,
            cap_paused,
            min_reconnect_time,
            cursor: 0,
            we_are_seed: false,
            paused: false,
        }
    }

    fn cap(&self) -> usize {
        if self.paused {
            self.cap_paused
        } else {
            self.cap_active
        }
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
        self.enforce_cap();
    }

    pub fn set_we_are_seed(&mut self, seed: bool) {
        self.we_are_seed = seed;
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&KnownPeer> {
        self.peers.peek(addr)
    }

    /// Adds a peer address, merging source flags and preserving failcount
    /// if the address was already known (§4.3 "Adding a peer"). Rejection
    /// by an IP filter is the caller's responsibility -- this method
    /// assumes the address already passed that check.
    pub fn add(&mut self, addr: SocketAddr, source: PeerSource) {
        if let Some(existing) = self.peers.get_mut(&addr) {
            existing.source.merge(source);
            return;
        }
        self.peers.put(addr, KnownPeer::new(addr, source));
        self.enforce_cap();
    }

    /// Explicitly bans an address: sets the ban bit, clears the
    /// `connected` flag, and keeps the record so the address cannot
    /// re-enter as if new (§4.3 "Ban policy").
    pub fn ban(&mut self, addr: &SocketAddr) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.banned = true;
            peer.connected = false;
        }
    }

    pub fn is_banned(&self, addr: &SocketAddr) -> bool {
        self.peers.peek(addr).map(|p| p.banned).unwrap_or(false)
    }

    /// Records a hash failure attributed to this peer: decrements
    /// `trust_points` by 2 (floored at [`MIN_TRUST_POINTS`]) and
    /// increments `hashfails` (capped at [`MAX_HASHFAILS`]). Returns true
    /// if the peer should now be banned.
    pub fn record_hashfail(&mut self, addr: &SocketAddr, sole_source: bool) -> bool {
        let peer = match self.peers.get_mut(addr) {
            Some(p) => p,
            None => return false,
        };
        peer.trust_points = (peer.trust_points - 2).max(MIN_TRUST_POINTS);
        peer.hashfails = peer.hashfails.saturating_add(1).min(MAX_HASHFAILS);
        let should_ban = peer.trust_points <= MIN_TRUST_POINTS || sole_source;
        if should_ban {
            peer.banned = true;
            peer.connected = false;
        }
        should_ban
    }

    pub fn record_connect_attempt(&mut self, addr: &SocketAddr, succeeded: bool) {
        if let Some(peer) = self.peers.get_mut(addr) {
            if succeeded {
                peer.failcount = 0;
                peer.connected = true;
                peer.last_connected = Some(Instant::now());
            } else {
                peer.failcount += 1;
                peer.last_connected = Some(Instant::now());
            }
        }
    }

    pub fn record_disconnect(&mut self, addr: &SocketAddr, downloaded_kb: u64, uploaded_kb: u64) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.connected = false;
            peer.prev_session_downloaded_kb += downloaded_kb;
            peer.prev_session_uploaded_kb += uploaded_kb;
        }
    }

    pub fn mark_seed(&mut self, addr: &SocketAddr, seed: bool) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.seed = seed;
        }
    }

    /// Returns the next connect candidate using a round-robin cursor over
    /// the directory, per §4.3 "Connect-candidate selection". Candidates
    /// are ranked and the best-ranked eligible peer encountered from the
    /// cursor position onward is returned; the cursor then advances past
    /// it.
    pub fn next_connect_candidate(&mut self) -> Option<SocketAddr> {
        let addrs: Vec<SocketAddr> = self.peers.iter().map(|(a, _)| *a).collect();
        if addrs.is_empty() {
            return None;
        }
        let n = addrs.len();
        let mut best: Option<(usize, SocketAddr, (i32, i32, i32, i32, i32, i64))> = None;
        for offset in 0..n {
            let i = (self.cursor + offset) % n;
            let addr = addrs[i];
            let peer = match self.peers.peek(&addr) {
                Some(p) => p,
                None => continue,
            };
            if !self.is_eligible(peer) {
                continue;
            }
            let rank = peer.rank();
            let better = match &best {
                Some((_, _, best_rank)) => rank > *best_rank,
                None => true,
            };
            if better {
                best = Some((i, addr, rank));
            }
        }
        if let Some((i, addr, _)) = best {
            self.cursor = (i + 1) % n;
            Some(addr)
        } else {
            None
        }
    }

    fn is_eligible(&self, peer: &KnownPeer) -> bool {
        !peer.banned
            && !peer.connected
            && peer.connectable
            && !(self.we_are_seed && peer.seed)
            && !peer.is_in_backoff(self.min_reconnect_time)
    }

    /// Evicts the worst-ranked peer if the directory is over its current
    /// capacity (which shrinks while paused). Banned peers are still
    /// subject to eviction once the cap is exceeded, but their `rank`
    /// puts them first in line.
    fn enforce_cap(&mut self) {
        let cap = self.cap();
        while self.peers.len() > cap {
            let worst = self
                .peers
                .iter()
                .min_by_key(|(_, p)| p.rank())
                .map(|(a, _)| *a);
            match worst {
                Some(addr) => {
                    self.peers.pop(&addr);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_add_merges_source_and_preserves_failcount() {
        let mut list = PeerList::new(100, 20, Duration::from_secs(60));
        list.add(
            addr(1),
            PeerSource {
                tracker: true,
                ..Default::default()
            },
        );
        list.record_connect_attempt(&addr(1), false);
        list.add(
            addr(1),
            PeerSource {
                pex: true,
                ..Default::default()
            },
        );
        let peer = list.get(&addr(1)).unwrap();
        assert!(peer.source.tracker);
        assert!(peer.source.pex);
        assert_eq!(peer.failcount, 1);
    }

    #[test]
    fn test_ban_prevents_future_candidate_selection() {
        let mut list = PeerList::new(100, 20, Duration::from_secs(60));
        list.add(addr(1), PeerSource::default());
        list.ban(&addr(1));
        assert!(list.is_banned(&addr(1)));
        assert_eq!(list.next_connect_candidate(), None);
    }

    #[test]
    fn test_hashfail_bans_after_reaching_min_trust() {
        let mut list = PeerList::new(100, 20, Duration::from_secs(60));
        list.add(addr(1), PeerSource::default());
        let mut banned = false;
        for _ in 0..4 {
            banned = list.record_hashfail(&addr(1), false);
        }
        assert!(banned);
        assert!(list.is_banned(&addr(1)));
    }

    #[test]
    fn test_sole_source_hashfail_bans_immediately() {
        let mut list = PeerList::new(100, 20, Duration::from_secs(60));
        list.add(addr(1), PeerSource::default());
        let banned = list.record_hashfail(&addr(1), true);
        assert!(banned);
    }

    #[test]
    fn test_reconnect_backoff_excludes_recently_failed_peer() {
        let mut list = PeerList::new(100, 20, Duration::from_secs(3600));
        list.add(addr(1), PeerSource::default());
        list.record_connect_attempt(&addr(1), false);
        // just failed, well within the backoff window
        assert_eq!(list.next_connect_candidate(), None);
    }

    #[test]
    fn test_round_robin_cursor_spreads_across_candidates() {
        let mut list = PeerList::new(100, 20, Duration::from_secs(0));
        list.add(addr(1), PeerSource::default());
        list.add(addr(2), PeerSource::default());
        let first = list.next_connect_candidate();
        let second = list.next_connect_candidate();
        assert!(first.is_some());
        assert!(second.is_some());
        assert_ne!(first, second);
    }

    #[test]
    fn test_cap_shrinks_while_paused_and_evicts_worst_rank() {
        let mut list = PeerList::new(100, 1, Duration::from_secs(0));
        list.add(addr(1), PeerSource::default());
        list.add(addr(2), PeerSource::default());
        assert_eq!(list.len(), 2);
        list.set_paused(true);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_we_are_seed_excludes_seed_peers_from_candidates() {
        let mut list = PeerList::new(100, 20, Duration::from_secs(0));
        list.add(addr(1), PeerSource::default());
        list.mark_seed(&addr(1), true);
        list.set_we_are_seed(true);
        assert_eq!(list.next_connect_candidate(), None);
    }
}
