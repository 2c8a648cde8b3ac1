use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, timeout},
};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{debug, info, trace, warn};

use crate::{
    peer::{
        PeerIdentity,
        error::PeerError,
        handshake::Handshake,
        message::{Bitfield, BlockInfo, MAX_REQUEST_LEN, Message, read_message, write_message},
    },
    policy::SwarmPolicy,
    store::{Completion, PieceClaim, PieceStore, StoreError},
    torrent::TorrentMetadata,
};

pub const PIECE_BLOCK_SIZE: u32 = 16384; // 16KB blocks
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);
const FAREWELL_TIMEOUT: Duration = Duration::from_secs(2);
const INBOX_CAPACITY: usize = 32;
/// Unserved REQUESTs a peer may have queued before the session is closed.
pub const MAX_QUEUED_REQUESTS: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub connect: Duration,
    pub handshake: Duration,
    /// How often an idle session looks for work again.
    pub idle_retry: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            handshake: Duration::from_secs(20),
            idle_retry: Duration::from_secs(5),
        }
    }
}

/// What every session of one swarm shares.
pub struct SessionContext {
    pub store: Arc<PieceStore>,
    pub local_peer_id: [u8; 20],
    pub policy: Arc<dyn SwarmPolicy>,
    pub timeouts: SessionTimeouts,
}

impl SessionContext {
    pub fn new(
        store: Arc<PieceStore>,
        local_peer_id: [u8; 20],
        policy: Arc<dyn SwarmPolicy>,
        timeouts: SessionTimeouts,
    ) -> Self {
        Self {
            store,
            local_peer_id,
            policy,
            timeouts,
        }
    }

    fn meta(&self) -> &TorrentMetadata {
        self.store.meta()
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting = 0,
    Handshaking = 1,
    Active = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Handshaking,
            2 => Self::Active,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed the peer to download from it.
    Outbound,
    /// The peer dialed us.
    Inbound,
}

/// Counters the coordinator reads while the session runs.
#[derive(Debug)]
pub struct SessionStats {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    state: AtomicU8,
}

impl SessionStats {
    fn new() -> Self {
        Self {
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            state: AtomicU8::new(SessionState::Connecting as u8),
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Starts a new measurement window.
    pub fn reset_counters(&self) {
        self.bytes_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }
}

struct PieceDownload {
    claim: PieceClaim,
    buffer: Vec<u8>,
    received: usize,
}

/// One handshaken connection to a remote peer.
///
/// A session downloads at most one piece at a time, with one block request
/// outstanding, and serves blocks to the peer once it has unchoked it.
pub struct PeerSession {
    ctx: Arc<SessionContext>,
    peer: PeerIdentity,
    direction: Direction,
    reader: Option<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    peer_pieces: Option<Bitfield>,
    download: Option<PieceDownload>,
    outstanding: Option<BlockInfo>,
    upload_queue: VecDeque<BlockInfo>,
    stats: Arc<SessionStats>,
    stop: CancellationToken,
    last_sent: Instant,
}

async fn send_then_receive(
    stream: &mut TcpStream,
    ours: &Handshake,
) -> Result<Handshake, PeerError> {
    stream.write_all(&ours.serialize()).await?;
    Handshake::read_from(stream).await
}

impl PeerSession {
    /// Dials `peer` and exchanges handshakes.
    pub async fn connect(ctx: Arc<SessionContext>, peer: PeerIdentity) -> Result<Self, PeerError> {
        let stats = Arc::new(SessionStats::new());
        let mut stream = timeout(ctx.timeouts.connect, TcpStream::connect(peer.addr))
            .await
            .map_err(|_| PeerError::Timeout)??;

        stats.set_state(SessionState::Handshaking);
        let ours = Handshake::new(ctx.meta().info_hash, ctx.local_peer_id);
        let theirs = timeout(ctx.timeouts.handshake, send_then_receive(&mut stream, &ours))
            .await
            .map_err(|_| PeerError::Timeout)??;
        if theirs.info_hash != ours.info_hash {
            return Err(PeerError::InfoHashMismatch);
        }

        debug!(peer = %peer, "handshake complete");
        let peer = PeerIdentity::new(peer.addr, Some(theirs.peer_id));
        Ok(Self::new(ctx, peer, Direction::Outbound, stream, stats))
    }

    /// Validates an inbound handshake before answering it. A peer asking for
    /// another torrent gets no reply.
    pub async fn accept(ctx: Arc<SessionContext>, mut stream: TcpStream) -> Result<Self, PeerError> {
        let addr = stream.peer_addr()?;
        let stats = Arc::new(SessionStats::new());
        stats.set_state(SessionState::Handshaking);

        let theirs = timeout(ctx.timeouts.handshake, Handshake::read_from(&mut stream))
            .await
            .map_err(|_| PeerError::Timeout)??;
        if theirs.info_hash != ctx.meta().info_hash {
            debug!(peer = %addr, "inbound handshake for another torrent");
            return Err(PeerError::InfoHashMismatch);
        }

        let ours = Handshake::new(ctx.meta().info_hash, ctx.local_peer_id);
        timeout(ctx.timeouts.handshake, stream.write_all(&ours.serialize()))
            .await
            .map_err(|_| PeerError::Timeout)??;

        debug!(peer = %addr, "accepted handshake");
        let peer = PeerIdentity::new(addr, Some(theirs.peer_id));
        Ok(Self::new(ctx, peer, Direction::Inbound, stream, stats))
    }

    fn new(
        ctx: Arc<SessionContext>,
        peer: PeerIdentity,
        direction: Direction,
        stream: TcpStream,
        stats: Arc<SessionStats>,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            ctx,
            peer,
            direction,
            reader: Some(reader),
            writer,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_pieces: None,
            download: None,
            outstanding: None,
            upload_queue: VecDeque::new(),
            stats,
            stop: CancellationToken::new(),
            last_sent: Instant::now(),
        }
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Runs the session on its own task.
    pub fn spawn(self) -> SessionHandle {
        let peer = self.peer.clone();
        let direction = self.direction;
        let stats = Arc::clone(&self.stats);
        let stop = self.stop.clone();
        SessionHandle {
            peer,
            direction,
            stats,
            stop,
            task: tokio::spawn(self.run()),
        }
    }

    async fn run(mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        self.stats.set_state(SessionState::Active);
        let (inbox_tx, mut inbox) = mpsc::channel(INBOX_CAPACITY);
        // aborted on drop, so the read half closes even if this task is aborted
        let reader_task = AbortOnDropHandle::new(tokio::spawn(read_loop(reader, inbox_tx)));

        match self.drive(&mut inbox).await {
            Ok(()) => debug!(peer = %self.peer, "session stopped"),
            Err(PeerError::ConnectionClosed) => {
                info!(peer = %self.peer, "peer closed the connection")
            }
            Err(e) => warn!(peer = %self.peer, error = %e, "session failed"),
        }

        drop(reader_task);
        self.abandon_piece();
        self.upload_queue.clear();
        self.stats.set_state(SessionState::Closed);
    }

    async fn drive(
        &mut self,
        inbox: &mut mpsc::Receiver<Result<Message, PeerError>>,
    ) -> Result<(), PeerError> {
        self.open().await?;

        let stop = self.stop.clone();
        let mut idle = tokio::time::interval(self.ctx.timeouts.idle_retry);
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);
        idle.reset();

        loop {
            let has_upload = !self.upload_queue.is_empty();
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    self.farewell().await;
                    return Ok(());
                }
                incoming = inbox.recv() => match incoming {
                    Some(Ok(message)) => self.handle(message).await?,
                    Some(Err(e)) => return Err(e),
                    None => return Err(PeerError::ConnectionClosed),
                },
                _ = std::future::ready(()), if has_upload => self.serve_upload().await?,
                _ = idle.tick() => self.on_idle().await?,
            }
        }
    }

    async fn open(&mut self) -> Result<(), PeerError> {
        let ours = self.ctx.store.bitfield();
        if !ours.is_empty() {
            self.send(&Message::Bitfield(ours)).await?;
        }
        if !self.ctx.store.is_complete() {
            self.am_interested = true;
            self.send(&Message::Interested).await?;
        }
        Ok(())
    }

    async fn handle(&mut self, message: Message) -> Result<(), PeerError> {
        trace!(peer = %self.peer, message = message.name(), "received");
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.peer_choking = true;
                self.abandon_piece();
                if !self.ctx.store.is_complete() {
                    self.am_interested = true;
                    self.send(&Message::Interested).await?;
                }
            }
            Message::Unchoke => {
                self.peer_choking = false;
                self.request_next().await?;
            }
            Message::Interested => {
                self.peer_interested = true;
                if self.am_choking && self.ctx.policy.should_unchoke(&self.peer) {
                    self.am_choking = false;
                    debug!(peer = %self.peer, "unchoking");
                    self.send(&Message::Unchoke).await?;
                }
            }
            Message::NotInterested => self.peer_interested = false,
            Message::Have(index) => {
                let index = index as usize;
                self.ctx.store.record_have(index);
                self.peer_pieces
                    .get_or_insert_with(|| Bitfield::from_piece_count(self.ctx.meta().piece_count()))
                    .set_piece(index);
                if self.download.is_none() {
                    self.request_next().await?;
                }
            }
            Message::Bitfield(bitfield) => {
                debug!(
                    peer = %self.peer,
                    pieces = bitfield.count(self.ctx.meta().piece_count()),
                    "peer bitfield"
                );
                self.ctx.store.record_availability(&bitfield);
                self.peer_pieces = Some(bitfield);
                if self.download.is_none() {
                    self.request_next().await?;
                }
            }
            Message::Request(block) => {
                if block.length > MAX_REQUEST_LEN {
                    return Err(PeerError::Protocol(format!(
                        "request for {} bytes exceeds {MAX_REQUEST_LEN}",
                        block.length
                    )));
                }
                if self.am_choking {
                    trace!(peer = %self.peer, "ignoring request while choking");
                } else if self.upload_queue.len() >= MAX_QUEUED_REQUESTS {
                    return Err(PeerError::Protocol(format!(
                        "more than {MAX_QUEUED_REQUESTS} requests queued"
                    )));
                } else {
                    self.upload_queue.push_back(block);
                }
            }
            Message::Cancel(block) => self.upload_queue.retain(|queued| *queued != block),
            Message::Piece {
                index,
                begin,
                block,
            } => self.on_block(index, begin, block).await?,
        }
        Ok(())
    }

    /// Claims a piece if needed and requests its next block.
    async fn request_next(&mut self) -> Result<(), PeerError> {
        if self.peer_choking || self.outstanding.is_some() {
            return Ok(());
        }
        if self.ctx.store.is_complete() {
            if self.am_interested {
                self.am_interested = false;
                self.send(&Message::NotInterested).await?;
            }
            return Ok(());
        }

        if self.download.is_none() {
            let hint = self.ctx.policy.piece_hint(self.ctx.meta().piece_count());
            let peer_pieces = self.peer_pieces.as_ref();
            let Some(claim) = self
                .ctx
                .store
                .claim_next(hint, |i| peer_pieces.is_none_or(|bf| bf.has_piece(i)))
            else {
                trace!(peer = %self.peer, "nothing to request");
                return Ok(());
            };
            let length = self.ctx.meta().piece_len(claim.index()) as usize;
            debug!(peer = %self.peer, piece = claim.index(), "claimed piece");
            self.download = Some(PieceDownload {
                claim,
                buffer: vec![0; length],
                received: 0,
            });
        }

        let Some(download) = &self.download else {
            return Ok(());
        };
        let remaining = download.buffer.len() - download.received;
        let request = BlockInfo::new(
            download.claim.index() as u32,
            download.received as u32,
            remaining.min(PIECE_BLOCK_SIZE as usize) as u32,
        );
        self.outstanding = Some(request);
        self.send(&Message::Request(request)).await
    }

    async fn on_block(&mut self, index: u32, begin: u32, block: Vec<u8>) -> Result<(), PeerError> {
        let expected = match self.outstanding {
            Some(request) if request.index == index && request.begin == begin => request,
            _ => {
                debug!(peer = %self.peer, index, begin, "ignoring unrequested block");
                return Ok(());
            }
        };
        if block.len() != expected.length as usize {
            return Err(PeerError::Protocol(format!(
                "block {index}@{begin} has {} bytes, requested {}",
                block.len(),
                expected.length
            )));
        }

        self.outstanding = None;
        self.stats.add_received(block.len() as u64);
        let Some(download) = self.download.as_mut() else {
            return Ok(());
        };
        let start = begin as usize;
        download.buffer[start..start + block.len()].copy_from_slice(&block);
        download.received += block.len();
        if download.received < download.buffer.len() {
            return self.request_next().await;
        }

        if let Some(download) = self.download.take() {
            self.finish_piece(download).await?;
        }
        self.request_next().await
    }

    async fn finish_piece(&mut self, download: PieceDownload) -> Result<(), PeerError> {
        let PieceDownload { claim, buffer, .. } = download;
        let index = claim.index();

        // hashing and the final disk write stay off the async workers
        let verified = tokio::task::spawn_blocking(move || claim.complete(buffer)).await;
        match verified {
            Ok(Ok(completion)) => {
                if completion == Completion::Finished {
                    info!(peer = %self.peer, "download complete");
                }
                self.send(&Message::Have(index as u32)).await?;
            }
            Ok(Err(StoreError::HashMismatch(_))) => {
                warn!(peer = %self.peer, piece = index, "piece failed verification, released")
            }
            Ok(Err(e)) => warn!(peer = %self.peer, piece = index, error = %e, "could not store piece"),
            Err(e) => warn!(peer = %self.peer, piece = index, error = %e, "verification task failed"),
        }
        Ok(())
    }

    async fn serve_upload(&mut self) -> Result<(), PeerError> {
        let Some(request) = self.upload_queue.pop_front() else {
            return Ok(());
        };
        let block = self
            .ctx
            .store
            .bytes_for_upload(
                request.index as usize,
                request.begin as usize,
                request.length as usize,
            )
            .unwrap_or_else(|| {
                debug!(peer = %self.peer, piece = request.index, "block unavailable, sending it empty");
                Vec::new()
            });

        self.stats.add_sent(block.len() as u64);
        self.send(&Message::Piece {
            index: request.index,
            begin: request.begin,
            block,
        })
        .await
    }

    async fn on_idle(&mut self) -> Result<(), PeerError> {
        if self.last_sent.elapsed() >= KEEP_ALIVE_INTERVAL {
            self.send(&Message::KeepAlive).await?;
        }
        self.request_next().await
    }

    /// Drops the current piece; the claim guard hands it back to the store.
    fn abandon_piece(&mut self) {
        self.outstanding = None;
        if let Some(download) = self.download.take() {
            debug!(peer = %self.peer, piece = download.claim.index(), "abandoning piece");
        }
    }

    async fn farewell(&mut self) {
        match timeout(FAREWELL_TIMEOUT, self.send(&Message::Choke)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = %self.peer, error = %e, "could not send choke"),
            Err(_) => debug!(peer = %self.peer, "timed out sending choke"),
        }
    }

    async fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        trace!(peer = %self.peer, message = message.name(), "sending");
        write_message(&mut self.writer, message).await?;
        self.last_sent = Instant::now();
        Ok(())
    }
}

/// Owns the read half so frames are never lost to a cancelled `select!` branch.
async fn read_loop(
    mut reader: OwnedReadHalf,
    inbox: mpsc::Sender<Result<Message, PeerError>>,
) {
    loop {
        let result = read_message(&mut reader).await;
        let failed = result.is_err();
        if inbox.send(result).await.is_err() || failed {
            break;
        }
    }
}

/// The coordinator's view of a running session.
#[derive(Debug)]
pub struct SessionHandle {
    peer: PeerIdentity,
    direction: Direction,
    stats: Arc<SessionStats>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Asks the session to stop and waits up to `join_timeout` before aborting it.
    pub async fn stop(self, join_timeout: Duration) {
        self.stop.cancel();
        let mut task = self.task;
        if timeout(join_timeout, &mut task).await.is_err() {
            warn!(peer = %self.peer, "session did not stop in time, aborting");
            task.abort();
        }
        self.stats.set_state(SessionState::Closed);
    }
}
