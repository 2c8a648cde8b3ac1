use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::Mutex,
    task::{JoinHandle, JoinSet},
    time::{Instant, MissedTickBehavior, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    peer::{PeerIdentity, PeerSession, SessionContext, SessionHandle},
    policy::SwarmPolicy,
    store::PieceStore,
    tracker::{Tracker, TrackerEvent, TransferStats},
};

pub mod config;
pub mod error;

pub use config::SwarmConfig;
pub use error::SwarmError;

const STOP_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct SwarmState {
    downloads: Vec<SessionHandle>,
    uploads: Vec<SessionHandle>,
    /// Latest filtered tracker peer list.
    available: Vec<PeerIdentity>,
    poll_interval: Duration,
    /// Peers skipped until the given instant.
    backoff: HashMap<SocketAddr, Instant>,
}

impl SwarmState {
    /// Drops sessions that ended on their own and backs their peers off.
    fn prune(&mut self, retry_after: Instant) {
        let backoff = &mut self.backoff;
        for sessions in [&mut self.downloads, &mut self.uploads] {
            sessions.retain(|handle| {
                if !handle.is_finished() {
                    return true;
                }
                debug!(peer = %handle.peer(), "session ended");
                backoff.insert(handle.peer().addr, retry_after);
                false
            });
        }
        let now = Instant::now();
        backoff.retain(|_, until| *until > now);
    }

    fn is_connected(&self, peer: &PeerIdentity) -> bool {
        self.downloads
            .iter()
            .chain(&self.uploads)
            .any(|handle| handle.peer().same_peer(peer))
    }

    /// Known peers with no live session and no pending backoff.
    fn candidates(&self) -> Vec<PeerIdentity> {
        self.available
            .iter()
            .filter(|peer| !self.is_connected(peer) && !self.backoff.contains_key(&peer.addr))
            .cloned()
            .collect()
    }
}

/// Removes the entry with the lowest rate.
fn take_slowest<T>(items: &mut Vec<T>, rate: impl Fn(&T) -> u64) -> Option<T> {
    let (index, _) = items
        .iter()
        .enumerate()
        .min_by_key(|(_, item)| rate(*item))?;
    Some(items.swap_remove(index))
}

struct Shared {
    config: SwarmConfig,
    ctx: Arc<SessionContext>,
    tracker: Arc<dyn Tracker>,
    listen_port: u16,
    state: Mutex<SwarmState>,
    shutdown: CancellationToken,
}

impl Shared {
    fn transfer_stats(&self) -> TransferStats {
        let store = &self.ctx.store;
        TransferStats {
            uploaded: store.uploaded(),
            downloaded: store.downloaded(),
            left: store.left(),
        }
    }

    fn is_usable(&self, peer: &PeerIdentity) -> bool {
        if peer.peer_id == Some(self.ctx.local_peer_id) {
            return false;
        }
        let ip = peer.ip();
        if peer.port() == 0 || ip.is_unspecified() || ip.is_multicast() {
            return false;
        }
        !(ip.is_loopback() && peer.port() == self.listen_port)
    }

    /// Drops ourselves, unusable addresses and duplicates.
    fn filter_peers(&self, peers: Vec<PeerIdentity>) -> Vec<PeerIdentity> {
        let mut kept: Vec<PeerIdentity> = Vec::with_capacity(peers.len());
        for peer in peers {
            if !self.is_usable(&peer) {
                debug!(peer = %peer, "skipping tracker peer");
                continue;
            }
            if kept.iter().all(|known| known.addr != peer.addr) {
                kept.push(peer);
            }
        }
        kept
    }

    /// One announce. Returns whether it succeeded and the delay until the next one.
    /// A failed announce leaves the peer list and interval untouched.
    async fn poll_tracker(&self, event: Option<TrackerEvent>) -> (bool, Duration) {
        let stats = self.transfer_stats();
        match self.tracker.announce(event, stats).await {
            Ok(announce) => {
                let peers = self.filter_peers(announce.peers);
                let mut state = self.state.lock().await;
                if let Some(interval) = announce.interval {
                    state.poll_interval = interval;
                }
                info!(
                    event = ?event,
                    peers = peers.len(),
                    interval = ?state.poll_interval,
                    "tracker announce succeeded"
                );
                state.available = peers;
                (true, state.poll_interval)
            }
            Err(e) => {
                let state = self.state.lock().await;
                warn!(
                    event = ?event,
                    error = %e,
                    retry_in = ?state.poll_interval,
                    "tracker announce failed, keeping previous peers"
                );
                (false, state.poll_interval)
            }
        }
    }

    async fn monitor_step(&self, rotate: bool) {
        let cap = self.config.max_download_sessions;
        let retry_after = Instant::now() + self.config.peer_retry_backoff;

        let (evicted, candidate) = {
            let mut state = self.state.lock().await;
            state.prune(retry_after);
            let candidates = state.candidates();

            let evicted = if rotate
                && state.downloads.len() >= cap
                && !candidates.is_empty()
                && !self.ctx.store.is_complete()
            {
                take_slowest(&mut state.downloads, |h| h.stats().bytes_received())
            } else {
                None
            };
            if let Some(handle) = &evicted {
                state.backoff.insert(handle.peer().addr, retry_after);
            }
            if rotate {
                for handle in state.downloads.iter().chain(&state.uploads) {
                    handle.stats().reset_counters();
                }
            }

            let candidate = if state.downloads.len() < cap {
                self.ctx
                    .policy
                    .pick_peer(&candidates)
                    .and_then(|i| candidates.get(i).cloned())
            } else {
                None
            };
            (evicted, candidate)
        };

        if let Some(handle) = evicted {
            info!(
                peer = %handle.peer(),
                received = handle.stats().bytes_received(),
                "rotating out slowest download peer"
            );
            handle.stop(self.config.join_timeout).await;
        }
        if let Some(peer) = candidate {
            self.open_download(peer).await;
        }
    }

    async fn open_download(&self, peer: PeerIdentity) {
        debug!(peer = %peer, "connecting");
        let connecting = PeerSession::connect(Arc::clone(&self.ctx), peer.clone());
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            result = connecting => result,
        };

        match result {
            Ok(session) => {
                let mut state = self.state.lock().await;
                if self.shutdown.is_cancelled() {
                    return;
                }
                info!(peer = %session.peer(), "download session open");
                state.downloads.push(session.spawn());
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "could not open session");
                let retry_after = Instant::now() + self.config.peer_retry_backoff;
                self.state.lock().await.backoff.insert(peer.addr, retry_after);
            }
        }
    }

    /// Handshakes an inbound peer and admits it, evicting the slowest upload at capacity.
    async fn admit_inbound(&self, stream: TcpStream) {
        let session = match PeerSession::accept(Arc::clone(&self.ctx), stream).await {
            Ok(session) => session,
            Err(e) => {
                debug!(error = %e, "rejected inbound peer");
                return;
            }
        };

        let evicted = {
            let mut state = self.state.lock().await;
            if self.shutdown.is_cancelled() {
                return;
            }
            state.prune(Instant::now() + self.config.peer_retry_backoff);
            let evicted = if state.uploads.len() >= self.config.max_upload_sessions {
                take_slowest(&mut state.uploads, |h| h.stats().bytes_sent())
            } else {
                None
            };
            info!(peer = %session.peer(), "upload session open");
            state.uploads.push(session.spawn());
            evicted
        };

        if let Some(handle) = evicted {
            info!(
                peer = %handle.peer(),
                sent = handle.stats().bytes_sent(),
                "evicting slowest upload peer"
            );
            handle.stop(self.config.join_timeout).await;
        }
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "incoming connection");
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move { shared.admit_inbound(stream).await });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                }
            },
        }
    }
    debug!("accept loop finished");
}

async fn tracker_loop(shared: Arc<Shared>) {
    let store = Arc::clone(&shared.ctx.store);
    let mut finished = store.subscribe();
    let mut started = false;
    let mut completion_sent = false;

    loop {
        let event = if !started {
            Some(TrackerEvent::Started)
        } else if !completion_sent && store.is_complete() {
            Some(TrackerEvent::Completed)
        } else {
            None
        };

        let (ok, mut delay) = shared.poll_tracker(event).await;
        match event {
            Some(TrackerEvent::Started) => started = ok,
            Some(TrackerEvent::Completed) => completion_sent = ok,
            _ => {}
        }
        // completion that is already known goes out right after `started`
        if started
            && !completion_sent
            && event != Some(TrackerEvent::Completed)
            && store.is_complete()
        {
            delay = Duration::ZERO;
        }

        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
            _ = finished.changed(), if started && !completion_sent => {}
        }
    }
    debug!("tracker loop finished");
}

async fn monitor_loop(shared: Arc<Shared>) {
    let mut tick = tokio::time::interval(shared.config.monitor_tick);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks: u32 = 0;

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }
        ticks = ticks.wrapping_add(1);
        let rotate = ticks % shared.config.rotation_ticks == 0;
        shared.monitor_step(rotate).await;
    }
    debug!("monitor loop finished");
}

/// Runs one torrent's swarm: accepts upload peers, polls the tracker and keeps
/// a bounded, periodically rotated set of download sessions.
pub struct SwarmCoordinator {
    shared: Arc<Shared>,
    listener: Option<TcpListener>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl SwarmCoordinator {
    pub fn new(
        config: SwarmConfig,
        store: Arc<PieceStore>,
        tracker: Arc<dyn Tracker>,
        policy: Arc<dyn SwarmPolicy>,
        local_peer_id: [u8; 20],
        listener: TcpListener,
    ) -> Result<Self, SwarmError> {
        config.validate()?;
        let listen_port = listener.local_addr()?.port();
        let ctx = Arc::new(SessionContext::new(store, local_peer_id, policy, config.session));
        let state = SwarmState {
            poll_interval: config.default_poll_interval,
            ..Default::default()
        };

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                ctx,
                tracker,
                listen_port,
                state: Mutex::new(state),
                shutdown: CancellationToken::new(),
            }),
            listener: Some(listener),
            tasks: Vec::new(),
        })
    }

    pub fn listen_port(&self) -> u16 {
        self.shared.listen_port
    }

    pub fn store(&self) -> &Arc<PieceStore> {
        &self.shared.ctx.store
    }

    pub fn pieces_downloaded(&self) -> bool {
        self.store().is_complete()
    }

    pub async fn available_peers(&self) -> Vec<PeerIdentity> {
        self.shared.state.lock().await.available.clone()
    }

    /// Live (download, upload) session counts.
    pub async fn session_counts(&self) -> (usize, usize) {
        let state = self.shared.state.lock().await;
        (state.downloads.len(), state.uploads.len())
    }

    /// Spawns the accept, tracker and monitor loops. Calling it twice is a no-op.
    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            warn!("swarm already started");
            return;
        };
        info!(
            port = self.shared.listen_port,
            pieces = self.store().piece_count(),
            complete = self.pieces_downloaded(),
            "starting swarm"
        );

        let shared = &self.shared;
        self.tasks.push((
            "accept",
            tokio::spawn(accept_loop(Arc::clone(shared), listener)),
        ));
        self.tasks
            .push(("tracker", tokio::spawn(tracker_loop(Arc::clone(shared)))));
        self.tasks
            .push(("monitor", tokio::spawn(monitor_loop(Arc::clone(shared)))));
    }

    /// Stops every loop and session, then tells the tracker we left.
    pub async fn stop(&mut self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        info!("stopping swarm");
        self.shared.shutdown.cancel();
        self.listener = None;

        let join_timeout = self.shared.config.join_timeout;
        for (name, mut task) in self.tasks.drain(..) {
            if timeout(join_timeout, &mut task).await.is_err() {
                warn!(task = name, "did not stop in time, aborting");
                task.abort();
            }
        }

        let sessions = {
            let mut state = self.shared.state.lock().await;
            let mut sessions = std::mem::take(&mut state.downloads);
            sessions.append(&mut state.uploads);
            sessions
        };
        let mut stopping = JoinSet::new();
        for handle in sessions {
            stopping.spawn(handle.stop(join_timeout));
        }
        while stopping.join_next().await.is_some() {}

        let stats = self.shared.transfer_stats();
        let announce = self
            .shared
            .tracker
            .announce(Some(TrackerEvent::Stopped), stats);
        match timeout(STOP_ANNOUNCE_TIMEOUT, announce).await {
            Ok(Ok(_)) => debug!("tracker notified of stop"),
            Ok(Err(e)) => warn!(error = %e, "could not notify tracker of stop"),
            Err(_) => warn!("tracker stop announce timed out"),
        }

        if !self.pieces_downloaded() {
            warn!(
                left = stats.left,
                "stopped before the download finished"
            );
        }
        info!("swarm stopped");
    }
}
