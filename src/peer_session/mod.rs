mod codec;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{
    select,
    stream::{Fuse, SplitSink},
    SinkExt, StreamExt,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use tokio::time::interval;
use tokio_util::codec::{Framed, FramedParts};

use crate::conf::TorrentConf;
use crate::counter::{SpeedBucket, ThruputCounter};
use crate::error::{Error, Result};
use crate::piece_map::PieceMap;
use crate::piece_picker::{PickOptions, PiecePicker, SessionId};
use crate::storage::{HashFlags, StorageHandle};
use crate::{Bitfield, BlockInfo, BlockKey, PeerId, PieceIndex, Sha1Hash};

use codec::{Handshake, HandshakeCodec, Message, PeerCodec};

/// A request we've sent to the peer and are waiting on.
#[derive(Clone, Debug)]
struct PendingRequest {
    block: BlockInfo,
    requested_at: Instant,
    /// True once this request has already timed out once; a second
    /// timeout abandons it (§4.4 "Block timeout").
    timed_out: bool,
}

/// A periodic snapshot a session pushes up to the owning torrent so it
/// can feed [`crate::choke::ChokeController`] without reaching into a
/// session task's private state (§4.5, §5 "single-threaded cooperative"
/// scheduling still applies per-session; the torrent only ever sees a
/// consistent snapshot, never a live borrow).
#[derive(Clone, Copy, Debug)]
pub struct SessionReport {
    pub session: SessionId,
    pub peer_id: Option<PeerId>,
    pub interested_in_us: bool,
    pub choking_us: bool,
    pub download_rate: f64,
    pub upload_rate: f64,
}

pub type ReportSender = UnboundedSender<SessionReport>;

/// A piece-completion outcome a session reports after it finishes the
/// last block of a piece and verifies it against storage (§2/§4.1:
/// "PiecePicker may instruct storage to verify a finished piece"). The
/// owning [`crate::torrent::SwarmTorrent`] drains these and drives the
/// `Have` broadcast / hash-failure ban flow, since only it holds the
/// full session table and tracker/peer-list state a single session
/// doesn't have access to.
#[derive(Clone, Debug)]
pub enum PieceEvent {
    Verified {
        piece: PieceIndex,
    },
    HashFailed {
        piece: PieceIndex,
        contributors: Vec<SessionId>,
    },
}

pub type PieceEventSender = UnboundedSender<PieceEvent>;
pub type PieceEventReceiver = UnboundedReceiver<PieceEvent>;

/// Shared, torrent-scoped state every session needs a handle to.
pub struct TorrentHandle {
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub conf: TorrentConf,
    pub piece_picker: Arc<RwLock<PiecePicker>>,
    pub piece_map: Arc<RwLock<PieceMap>>,
    pub storage: Arc<dyn StorageHandle>,
    pub block_len: u32,
    /// The expected per-piece SHA-1 digests from the torrent's metainfo,
    /// indexed by piece index, used to verify a piece once its last
    /// block has been written.
    pub piece_hashes: Vec<Sha1Hash>,
}

/// Implements the choking/interest/request protocol as a pair of
/// per-direction state machines driven by one TCP connection (§4.4).
pub struct PeerSession {
    session_id: SessionId,
    torrent: Arc<TorrentHandle>,
    cmd_port: Fuse<Receiver>,
    addr: SocketAddr,
    status: Status,
    peer_bitfield: Bitfield,
    allowed_fast: HashSet<PieceIndex>,
    supports_fast_extension: bool,
    outstanding: Vec<PendingRequest>,
    download_counter: ThruputCounter,
    upload_counter: ThruputCounter,
    peer_id: Option<PeerId>,
    report_tx: ReportSender,
    piece_tx: PieceEventSender,
    /// Exponential moving average of observed block round-trip time,
    /// used to scale the request timeout above the configured floor
    /// (§4.4 "Block timeout": `max(base_timeout, observed_rtt * 2)`).
    avg_block_rtt: Option<Duration>,
}

impl PeerSession {
    pub fn outbound(
        session_id: SessionId,
        torrent: Arc<TorrentHandle>,
        addr: SocketAddr,
        report_tx: ReportSender,
        piece_tx: PieceEventSender,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                session_id,
                torrent,
                cmd_port: cmd_port.fuse(),
                addr,
                status: Status::default(),
                peer_bitfield: Bitfield::new(),
                allowed_fast: HashSet::new(),
                supports_fast_extension: false,
                outstanding: Vec::new(),
                download_counter: ThruputCounter::new(),
                upload_counter: ThruputCounter::new(),
                peer_id: None,
                report_tx,
                piece_tx,
                avg_block_rtt: None,
            },
            cmd_chan,
        )
    }

    pub async fn start(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.status.state = State::Connecting;
        let socket = TcpStream::connect(self.addr).await?;

        let mut socket = Framed::new(socket, HandshakeCodec);
        self.status.state = State::Handshaking;
        let handshake = Handshake::new(self.torrent.info_hash, self.torrent.client_id, true);
        socket.send(handshake).await?;

        let peer_handshake = match socket.next().await {
            Some(h) => h?,
            None => {
                log::warn!("Peer {} closed before handshake", self.addr);
                return Ok(());
            }
        };
        if peer_handshake.info_hash != self.torrent.info_hash {
            return Err(Error::InvalidPeerInfoHash);
        }
        self.supports_fast_extension = peer_handshake.supports_fast_extension();
        self.peer_id = Some(peer_handshake.peer_id);

        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.status.state = State::AvailabilityExchange;
        self.run(socket).await
    }

    async fn run(&mut self, socket: Framed<TcpStream, PeerCodec>) -> Result<()> {
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();
        let mut ticker = interval(Duration::from_secs(1)).fuse();

        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    if self.status.state == State::AvailabilityExchange {
                        self.handle_availability_msg(&mut sink, msg).await?;
                        self.status.state = State::Connected;
                    } else {
                        self.handle_msg(&mut sink, msg).await?;
                    }
                }
                _ = ticker.select_next_some() => {
                    self.handle_timeouts().await?;
                    self.fill_request_pipeline(&mut sink).await?;
                    let _ = self.report_tx.send(SessionReport {
                        session: self.session_id,
                        peer_id: self.peer_id,
                        interested_in_us: self.status.peer_interested_in_us,
                        choking_us: self.status.peer_choking_us,
                        download_rate: self.download_counter.rate(),
                        upload_rate: self.upload_counter.rate(),
                    });
                }
                cmd = self.cmd_port.select_next_some() => {
                    if !self.handle_command(&mut sink, cmd).await? {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_availability_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(mut bitfield) => {
                let num_pieces = self.torrent.piece_map.read().await.num_pieces();
                bitfield.resize(num_pieces, false);
                self.register_peer_bitfield(bitfield).await;
            }
            Message::HaveAll => {
                let num_pieces = self.torrent.piece_map.read().await.num_pieces();
                self.register_peer_bitfield(Bitfield::repeat(true, num_pieces))
                    .await;
            }
            Message::HaveNone => {
                let num_pieces = self.torrent.piece_map.read().await.num_pieces();
                self.register_peer_bitfield(Bitfield::repeat(false, num_pieces))
                    .await;
            }
            other => {
                log::warn!(
                    "Peer {} sent {:?} before availability exchange",
                    self.addr,
                    other.id()
                );
                self.register_peer_bitfield(Bitfield::new()).await;
                self.handle_msg(sink, other).await?;
                return Ok(());
            }
        }
        self.recompute_interest(sink).await
    }

    async fn register_peer_bitfield(&mut self, bitfield: Bitfield) {
        let mut picker = self.torrent.piece_picker.write().await;
        for i in 0..bitfield.len() {
            if bitfield[i] {
                picker.has_piece(i);
            }
        }
        self.peer_bitfield = bitfield;
    }

    async fn handle_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(_) | Message::HaveAll | Message::HaveNone => {
                return Err(Error::BitfieldNotAfterHandshake);
            }
            Message::KeepAlive => {}
            Message::Choke => self.handle_peer_choke().await?,
            Message::Unchoke => {
                self.status.peer_choking_us = false;
                self.fill_request_pipeline(sink).await?;
            }
            Message::Interested => self.status.peer_interested_in_us = true,
            Message::NotInterested => self.status.peer_interested_in_us = false,
            Message::Have { piece_index } => {
                if piece_index >= self.peer_bitfield.len() {
                    self.peer_bitfield.resize(piece_index + 1, false);
                }
                if !self.peer_bitfield[piece_index] {
                    self.peer_bitfield.set(piece_index, true);
                    self.torrent
                        .piece_picker
                        .write()
                        .await
                        .has_piece(piece_index);
                }
                self.recompute_interest(sink).await?;
            }
            Message::AllowedFast { piece_index } => {
                self.allowed_fast.insert(piece_index);
            }
            Message::Request(block) => self.handle_request(sink, block).await?,
            Message::Cancel(_) => {
                // we reply to requests inline rather than queueing them, so
                // there is nothing durable to cancel
            }
            Message::Reject(block) => self.handle_reject(block).await?,
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let block = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.handle_block_msg(block, data).await?;
                self.fill_request_pipeline(sink).await?;
            }
        }
        Ok(())
    }

    async fn handle_peer_choke(&mut self) -> Result<()> {
        if self.status.peer_choking_us {
            return Ok(());
        }
        log::info!("Peer {} choked us", self.addr);
        self.status.peer_choking_us = true;
        // no fast extension support for pending requests means the peer
        // won't send explicit rejects, so release our claims immediately
        let mut picker = self.torrent.piece_picker.write().await;
        for req in self.outstanding.drain(..) {
            let key = BlockKey {
                piece_index: req.block.piece_index,
                block_index: req.block.index_in_piece(self.torrent.block_len),
            };
            picker.abort_download(key, self.session_id)?;
        }
        Ok(())
    }

    async fn handle_reject(&mut self, block: BlockInfo) -> Result<()> {
        if let Some(pos) = self
            .outstanding
            .iter()
            .position(|r| r.block == block)
        {
            self.outstanding.remove(pos);
            let mut picker = self.torrent.piece_picker.write().await;
            let key = BlockKey {
                piece_index: block.piece_index,
                block_index: block.index_in_piece(self.torrent.block_len),
            };
            picker.abort_download(key, self.session_id)?;
        }
        Ok(())
    }

    async fn handle_request(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        block: BlockInfo,
    ) -> Result<()> {
        if self.status.we_choking_peer && !self.allowed_fast.contains(&block.piece_index) {
            log::debug!("Ignoring request from choked peer {}", self.addr);
            return Ok(());
        }
        let have = self.torrent.piece_map.read().await.have(block.piece_index);
        if !have {
            return Ok(());
        }
        let data = self
            .torrent
            .storage
            .read(block.piece_index, block.offset, block.len)
            .await?;
        self.upload_counter.update(data.len() as u64);
        sink.send(Message::Block {
            piece_index: block.piece_index,
            offset: block.offset,
            data,
        })
        .await?;
        Ok(())
    }

    /// Recomputes "am interested" per §4.4: true iff the peer has some
    /// piece we still want. Emits exactly one frame on a state change.
    async fn recompute_interest(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        let picker = self.torrent.piece_picker.read().await;
        let map = self.torrent.piece_map.read().await;
        let mut interested = false;
        for i in 0..self.peer_bitfield.len().min(map.num_pieces()) {
            if self.peer_bitfield[i] && !map.have(i) && picker.priority(i).unwrap_or(0) > 0 {
                interested = true;
                break;
            }
        }
        drop(picker);
        drop(map);
        if interested != self.status.we_interested_in_peer {
            self.status.we_interested_in_peer = interested;
            if interested {
                sink.send(Message::Interested).await?;
            } else {
                sink.send(Message::NotInterested).await?;
            }
        }
        Ok(())
    }

    fn target_queue_depth(&mut self, conf: &TorrentConf) -> usize {
        let rate = self.download_counter.rate();
        let depth = (rate * conf.target_request_queue_time.as_secs_f64()
            / self.torrent.block_len as f64)
            .round() as i64;
        depth
            .max(conf.min_request_queue_depth as i64)
            .min(conf.max_request_queue_depth as i64) as usize
    }

    async fn fill_request_pipeline(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        if self.status.peer_choking_us || !self.status.we_interested_in_peer {
            return Ok(());
        }
        let conf = self.torrent.conf.clone();
        let depth = self.target_queue_depth(&conf);
        if self.outstanding.len() >= depth {
            return Ok(());
        }
        let want_n = depth - self.outstanding.len();

        let speed = SpeedBucket::classify(self.download_counter.rate());
        let opts = PickOptions {
            session: self.session_id,
            speed,
        };
        let outstanding = &self.outstanding;
        let already_requested = |key: BlockKey| {
            outstanding.iter().any(|r| {
                r.block.piece_index == key.piece_index
                    && r.block.index_in_piece(self.torrent.block_len) == key.block_index
            })
        };
        let blocks = {
            let mut picker = self.torrent.piece_picker.write().await;
            picker.pick_blocks(&self.peer_bitfield, want_n, already_requested, opts)
        };
        for block in blocks {
            self.outstanding.push(PendingRequest {
                block,
                requested_at: Instant::now(),
                timed_out: false,
            });
            sink.send(Message::Request(block)).await?;
        }
        Ok(())
    }

    async fn handle_timeouts(&mut self) -> Result<()> {
        let conf = &self.torrent.conf;
        let base_timeout = conf.min_request_timeout;
        let timeout = match self.avg_block_rtt {
            Some(rtt) => base_timeout.max(rtt * 2),
            None => base_timeout,
        };
        let mut abandoned = Vec::new();
        for req in self.outstanding.iter_mut() {
            let elapsed = req.requested_at.elapsed();
            if elapsed > timeout {
                if req.timed_out {
                    abandoned.push(req.block);
                } else {
                    req.timed_out = true;
                }
            }
        }
        if abandoned.is_empty() {
            return Ok(());
        }
        self.outstanding.retain(|r| !abandoned.contains(&r.block));
        let mut picker = self.torrent.piece_picker.write().await;
        for block in abandoned {
            let key = BlockKey {
                piece_index: block.piece_index,
                block_index: block.index_in_piece(self.torrent.block_len),
            };
            picker.abort_download(key, self.session_id)?;
        }
        Ok(())
    }

    async fn handle_block_msg(&mut self, block: BlockInfo, data: Vec<u8>) -> Result<()> {
        let pos = match self.outstanding.iter().position(|r| r.block == block) {
            Some(pos) => pos,
            None => {
                log::warn!("Peer {} sent unrequested block {:?}", self.addr, block);
                return Ok(());
            }
        };
        let rtt = self.outstanding[pos].requested_at.elapsed();
        self.avg_block_rtt = Some(match self.avg_block_rtt {
            Some(avg) => avg.mul_f64(0.8) + rtt.mul_f64(0.2),
            None => rtt,
        });
        self.outstanding.remove(pos);
        self.download_counter.update(data.len() as u64);

        let key = BlockKey {
            piece_index: block.piece_index,
            block_index: block.index_in_piece(self.torrent.block_len),
        };
        {
            let mut picker = self.torrent.piece_picker.write().await;
            picker.mark_as_writing(key)?;
        }
        self.torrent
            .storage
            .write(block.piece_index, block.offset, data)
            .await?;

        let should_verify = {
            let mut picker = self.torrent.piece_picker.write().await;
            picker.mark_as_finished(key)?;
            if picker.is_piece_complete(block.piece_index)? && !picker.is_locked(block.piece_index) {
                picker.lock_piece(block.piece_index)?;
                true
            } else {
                false
            }
        };
        if should_verify {
            self.verify_piece(block.piece_index).await?;
        }
        Ok(())
    }

    /// Hashes a just-completed piece and compares it against the
    /// torrent's metainfo digest, reporting the outcome to the owning
    /// [`crate::torrent::SwarmTorrent`] over `piece_tx` (§2/§4.1). The
    /// piece is locked by the caller before this runs so no other
    /// session can pick from it mid-verification; a successful
    /// verification unlocks it here, while a failure leaves it locked
    /// for `SwarmTorrent::on_hash_failure` to restore and unlock.
    async fn verify_piece(&mut self, piece_index: PieceIndex) -> Result<()> {
        let expected = self.torrent.piece_hashes.get(piece_index).copied();
        let actual = match self
            .torrent
            .storage
            .hash(piece_index, HashFlags::default())
            .await
        {
            Ok(hash) => hash,
            Err(e) => {
                log::warn!("failed to hash piece {}: {}", piece_index, e);
                let mut picker = self.torrent.piece_picker.write().await;
                picker.unlock_piece(piece_index)?;
                return Ok(());
            }
        };
        let matches = expected.map(|expected| expected == actual).unwrap_or(false);
        if matches {
            {
                let mut picker = self.torrent.piece_picker.write().await;
                picker.unlock_piece(piece_index)?;
            }
            let _ = self.piece_tx.send(PieceEvent::Verified { piece: piece_index });
        } else {
            let contributors = self
                .torrent
                .piece_picker
                .read()
                .await
                .contributors(piece_index);
            let _ = self.piece_tx.send(PieceEvent::HashFailed {
                piece: piece_index,
                contributors,
            });
        }
        Ok(())
    }

    /// Returns `true` to keep running, `false` to shut down.
    async fn handle_command(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        cmd: Command,
    ) -> Result<bool> {
        match cmd {
            Command::Shutdown => {
                log::info!("Shutting down peer {} session", self.addr);
                return Ok(false);
            }
            Command::SetChoke(choke) => {
                if choke != self.status.we_choking_peer {
                    self.status.we_choking_peer = choke;
                    sink.send(if choke {
                        Message::Choke
                    } else {
                        Message::Unchoke
                    })
                    .await?;
                }
            }
            Command::Have(piece_index) => {
                sink.send(Message::Have { piece_index }).await?;
            }
            Command::CancelPiece(piece_index) => {
                self.outstanding.retain(|r| r.block.piece_index != piece_index);
            }
        }
        Ok(true)
    }
}

pub type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// Commands the torrent sends down into a running session.
pub enum Command {
    Shutdown,
    /// The torrent's `ChokeController` toggling whether we choke the peer
    /// (upload direction).
    SetChoke(bool),
    /// We've newly completed a piece; tell the peer about it.
    Have(PieceIndex),
    /// A piece was invalidated (hash failure); drop any outstanding
    /// requests for it without waiting for a timeout.
    CancelPiece(PieceIndex),
}

#[derive(Clone, Copy, Debug)]
struct Status {
    state: State,
    peer_choking_us: bool,
    we_choking_peer: bool,
    peer_interested_in_us: bool,
    we_interested_in_peer: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            peer_choking_us: true,
            we_choking_peer: true,
            peer_interested_in_us: false,
            we_interested_in_peer: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    Disconnected,
    Connecting,
    Handshaking,
    AvailabilityExchange,
    Connected,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::MemoryStorage;
    use crate::storage_info::{FileInfo, FsStructure, StorageInfo};
    use sha1::{Digest, Sha1};
    use std::path::PathBuf;

    fn test_handle(piece_hashes: Vec<Sha1Hash>, block_len: u32) -> Arc<TorrentHandle> {
        let num_pieces = piece_hashes.len();
        let piece_len = block_len;
        let download_len = piece_len as u64 * num_pieces as u64;
        let storage_info = StorageInfo {
            piece_count: num_pieces,
            piece_len,
            last_piece_len: piece_len,
            download_len,
            download_dir: PathBuf::from("/tmp"),
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("/tmp/f"),
                len: download_len,
                torrent_offset: 0,
                is_padding: false,
            }),
        };
        let conf = TorrentConf::new(PathBuf::from("/tmp"));
        let picker = PiecePicker::new(
            num_pieces,
            piece_len,
            piece_len,
            block_len,
            conf.endgame_unfinished_block_threshold,
            conf.max_parallel_block_requests,
            conf.stalled_piece_factor,
        );
        Arc::new(TorrentHandle {
            info_hash: [0; 20],
            client_id: [1; 20],
            conf,
            piece_picker: Arc::new(RwLock::new(picker)),
            piece_map: Arc::new(RwLock::new(PieceMap::new(storage_info))),
            storage: Arc::new(MemoryStorage::new()),
            block_len,
            piece_hashes,
        })
    }

    fn test_session(handle: Arc<TorrentHandle>) -> (PeerSession, PieceEventReceiver) {
        let (report_tx, _report_rx) = mpsc::unbounded_channel();
        let (piece_tx, piece_rx) = mpsc::unbounded_channel();
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let (session, _sender) = PeerSession::outbound(1, handle, addr, report_tx, piece_tx);
        (session, piece_rx)
    }

    #[tokio::test]
    async fn test_handle_block_msg_verifies_and_reports_completion() {
        const BLOCK_LEN: u32 = 16384;
        let data = vec![b'x'; BLOCK_LEN as usize];
        let hash = {
            let digest = Sha1::digest(&data);
            let mut h = [0; 20];
            h.copy_from_slice(&digest);
            h
        };
        let handle = test_handle(vec![hash], BLOCK_LEN);
        let (mut session, mut piece_rx) = test_session(handle.clone());

        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN,
        };
        let key = BlockKey {
            piece_index: 0,
            block_index: 0,
        };
        {
            let mut picker = handle.piece_picker.write().await;
            picker.mark_as_downloading(key, 1, false).unwrap();
        }
        session.outstanding.push(PendingRequest {
            block,
            requested_at: Instant::now(),
            timed_out: false,
        });

        session.handle_block_msg(block, data).await.unwrap();

        match piece_rx.recv().await.unwrap() {
            PieceEvent::Verified { piece } => assert_eq!(piece, 0),
            other => panic!("expected Verified, got {:?}", other),
        }
        assert!(!handle.piece_picker.read().await.is_locked(0));
    }

    #[tokio::test]
    async fn test_handle_block_msg_reports_hash_failure_on_mismatch() {
        const BLOCK_LEN: u32 = 16384;
        let data = vec![b'x'; BLOCK_LEN as usize];
        let wrong_hash = [0xffu8; 20];
        let handle = test_handle(vec![wrong_hash], BLOCK_LEN);
        let (mut session, mut piece_rx) = test_session(handle.clone());

        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN,
        };
        let key = BlockKey {
            piece_index: 0,
            block_index: 0,
        };
        {
            let mut picker = handle.piece_picker.write().await;
            picker.mark_as_downloading(key, 1, false).unwrap();
        }
        session.outstanding.push(PendingRequest {
            block,
            requested_at: Instant::now(),
            timed_out: false,
        });

        session.handle_block_msg(block, data).await.unwrap();

        match piece_rx.recv().await.unwrap() {
            PieceEvent::HashFailed { piece, contributors } => {
                assert_eq!(piece, 0);
                assert_eq!(contributors, vec![1]);
            }
            other => panic!("expected HashFailed, got {:?}", other),
        }
        // still locked: SwarmTorrent::on_hash_failure restores and unlocks it
        assert!(handle.piece_picker.read().await.is_locked(0));
    }

    #[tokio::test]
    async fn test_handle_timeouts_scales_with_observed_rtt() {
        let handle = test_handle(vec![[0; 20]], 16384);
        let (mut session, _piece_rx) = test_session(handle.clone());
        session.avg_block_rtt = Some(Duration::from_secs(10));
        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: 16384,
        };
        session.outstanding.push(PendingRequest {
            block,
            requested_at: Instant::now() - Duration::from_secs(15),
            timed_out: false,
        });
        // the configured floor (3s) would already have timed this out once,
        // but 2x the 10s observed RTT (20s) hasn't elapsed yet
        session.handle_timeouts().await.unwrap();
        assert_eq!(session.outstanding.len(), 1);
        assert!(session.outstanding[0].timed_out);
    }
}
