//! # Remote Peers
//!
//! A [`Remote`] is everything this node knows about one peer: its discovery
//! snapshot, its pinned certificate, the RPC channel to it and the transfers
//! exchanged with it.
//!
//! ## Lifecycle
//!
//! Discovery and transport connectivity arrive independently. Both are turned
//! into lifecycle events and fed to a single task per remote, which is the
//! only writer of the lifecycle state:
//!
//! ```text
//!                 Discovered                ChannelReady                 DuplexConfirmed
//! MdnsOffline ─────────────▶ MdnsDiscovered ───────────▶ WaitingForDuplex ───────────────▶ Online
//!      ▲                          │  ▲                          │                              │
//!      │ Vanished (from any)      │  │ Retry (backoff)          │                              │
//!      │                          ▼  │                          ▼                              ▼
//!      └───────────────────────── Failure ◀──────────────────────────────────────────────────────┘
//! ```
//!
//! While `MdnsOffline`, only a fresh discovery moves the remote; late transport
//! callbacks are dropped. Connect attempts are numbered, and results from an
//! attempt that is no longer current are ignored.

use crate::backpressure::FlowController;
use crate::chunk::{Chunk, ChunkError, ChunkReader};
use crate::crypto::TrustStore;
use crate::discovery::Peer;
use crate::downloader::TransferDownloader;
use crate::operation::{Direction, SideEffect, TransferEvent, TransferOperation, TransferState};
use crate::rpc::{
    Connectivity, LookupName, OpInfo, OutboundChunks, RpcClient, RpcError, RpcStatus, StatusCode,
    TransferRequest, Transport,
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

const MAX_BACKOFF_SECS: u64 = 30;
/// How long an abandoned upload waits for the peer's own stop before it counts as failed.
const ABANDON_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteState {
    MdnsOffline,
    MdnsDiscovered,
    WaitingForDuplex,
    Online,
    Failure,
}

impl fmt::Display for RemoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteState::MdnsOffline => "mdnsOffline",
            RemoteState::MdnsDiscovered => "mdnsDiscovered",
            RemoteState::WaitingForDuplex => "waitingForDuplex",
            RemoteState::Online => "online",
            RemoteState::Failure => "failure",
        };
        f.write_str(name)
    }
}

/// Inputs of the lifecycle state machine, stripped of attempt bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    Discovered,
    Vanished,
    ChannelReady,
    DuplexConfirmed,
    Failure,
    Retry,
    CredentialsInvalidated,
}

/// Pure lifecycle transition. `None` means the signal is ignored in `current`.
pub fn next_state(current: RemoteState, signal: LifecycleSignal) -> Option<RemoteState> {
    use LifecycleSignal as L;
    use RemoteState as S;

    match (current, signal) {
        (S::MdnsOffline, L::Discovered) => Some(S::MdnsDiscovered),
        (S::MdnsOffline, _) => None,

        (_, L::Vanished) => Some(S::MdnsOffline),

        (S::Failure, L::Discovered) | (S::Failure, L::Retry) => Some(S::MdnsDiscovered),
        (_, L::CredentialsInvalidated) => Some(S::MdnsDiscovered),

        (S::MdnsDiscovered, L::ChannelReady) => Some(S::WaitingForDuplex),
        (S::MdnsDiscovered, L::DuplexConfirmed) | (S::WaitingForDuplex, L::DuplexConfirmed) => {
            Some(S::Online)
        }

        (S::MdnsDiscovered, L::Failure) | (S::WaitingForDuplex, L::Failure) | (S::Online, L::Failure) => {
            Some(S::Failure)
        }

        _ => None,
    }
}

/// Delay before reconnecting after `errors` consecutive failures.
pub fn backoff(errors: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(errors).min(MAX_BACKOFF_SECS))
}

/// Notifications published by the node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    RemoteStateChanged {
        id: String,
        state: RemoteState,
    },
    TransferStateChanged {
        peer_id: String,
        transfer_id: i64,
        direction: Direction,
        state: TransferState,
    },
    IncomingTransfer {
        peer_id: String,
        transfer_id: i64,
        title: String,
        size: u64,
        count: u64,
    },
}

/// Knobs shared by every remote of a node.
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub display_name: String,
    pub save_directory: PathBuf,
    pub allow_symlinks: bool,
    pub auto_accept: bool,
    pub chunk_size: usize,
    pub cache_depth: u64,
    pub duplex_timeout: Duration,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            display_name: crate::crypto::local_hostname(),
            save_directory: PathBuf::from("."),
            allow_symlinks: false,
            auto_accept: false,
            chunk_size: crate::chunk::DEFAULT_CHUNK_SIZE,
            cache_depth: crate::backpressure::DEFAULT_CACHE_DEPTH,
            duplex_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(15),
        }
    }
}

/// Node-wide collaborators handed to every remote.
pub struct RemoteContext {
    pub trust: Arc<TrustStore>,
    pub transport: Arc<dyn Transport>,
    pub settings: RemoteSettings,
    pub events: broadcast::Sender<NodeEvent>,
}

impl RemoteContext {
    pub fn me(&self) -> LookupName {
        LookupName {
            id: self.trust.identity().to_string(),
            readable_name: self.settings.display_name.clone(),
        }
    }

    fn publish(&self, event: NodeEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

#[derive(Debug)]
enum LifecycleEvent {
    Discovered(Peer),
    Vanished,
    ChannelReady(u64),
    DuplexConfirmed(u64),
    Failed(u64, String),
    Retry(u64),
    InvalidateCredentials,
    Shutdown,
}

#[derive(Default)]
struct Transfers {
    outgoing: HashMap<i64, TransferOperation>,
    incoming: HashMap<i64, TransferOperation>,
}

impl Transfers {
    fn map_mut(&mut self, direction: Direction) -> &mut HashMap<i64, TransferOperation> {
        match direction {
            Direction::Upload => &mut self.outgoing,
            Direction::Download => &mut self.incoming,
        }
    }
}

/// How the chunk producer of an upload ended.
enum Produced {
    All,
    Cancelled,
    Abandoned,
    Failed(String),
}

pub struct Remote {
    id: String,
    ctx: Arc<RemoteContext>,
    peer: Mutex<Option<Peer>>,
    resolved: Mutex<Option<SocketAddr>>,
    certificate: Mutex<Option<Vec<u8>>>,
    client: Mutex<Option<RpcClient>>,
    transfers: Mutex<Transfers>,
    state: watch::Sender<RemoteState>,
    attempt: AtomicU64,
    errors: AtomicU32,
    lifecycle: mpsc::UnboundedSender<LifecycleEvent>,
}

impl Remote {
    /// Create a remote in `MdnsOffline` and start its lifecycle task.
    pub fn spawn(id: impl Into<String>, ctx: Arc<RemoteContext>) -> Arc<Self> {
        let (lifecycle, events) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(RemoteState::MdnsOffline);

        let remote = Arc::new(Self {
            id: id.into(),
            ctx,
            peer: Mutex::new(None),
            resolved: Mutex::new(None),
            certificate: Mutex::new(None),
            client: Mutex::new(None),
            transfers: Mutex::new(Transfers::default()),
            state,
            attempt: AtomicU64::new(0),
            errors: AtomicU32::new(0),
            lifecycle,
        });

        tokio::spawn(remote.clone().run(events));
        remote
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> RemoteState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RemoteState> {
        self.state.subscribe()
    }

    pub fn peer(&self) -> Option<Peer> {
        self.peer.lock().clone()
    }

    /// IP the peer is known at: the last address we connected to, else the
    /// discovery snapshot's host when it is a literal address.
    pub fn known_ip(&self) -> Option<IpAddr> {
        if let Some(addr) = *self.resolved.lock() {
            return Some(addr.ip());
        }
        self.peer
            .lock()
            .as_ref()
            .and_then(|peer| peer.host_name.parse().ok())
    }

    pub fn error_count(&self) -> u32 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn has_certificate(&self) -> bool {
        self.certificate.lock().is_some()
    }

    pub fn client(&self) -> Option<RpcClient> {
        self.client.lock().clone()
    }

    fn send(&self, event: LifecycleEvent) {
        if self.lifecycle.send(event).is_err() {
            debug!("Lifecycle of {} already stopped", self.id);
        }
    }

    /// Discovery reported the peer, possibly with a new snapshot.
    pub fn discovered(&self, peer: Peer) {
        self.send(LifecycleEvent::Discovered(peer));
    }

    /// Discovery lost the peer.
    pub fn vanished(&self) {
        self.send(LifecycleEvent::Vanished);
    }

    /// Connectivity callback from the transport for the current attempt.
    pub fn notify_connectivity(&self, connectivity: Connectivity) {
        let attempt = self.attempt.load(Ordering::SeqCst);
        self.notify_connectivity_for(attempt, connectivity);
    }

    fn notify_connectivity_for(&self, attempt: u64, connectivity: Connectivity) {
        match connectivity {
            Connectivity::Ready => self.send(LifecycleEvent::ChannelReady(attempt)),
            Connectivity::TransientFailure => {
                self.send(LifecycleEvent::Failed(attempt, "transient transport failure".into()))
            }
            Connectivity::Shutdown => {
                self.send(LifecycleEvent::Failed(attempt, "channel shut down".into()))
            }
            Connectivity::Connecting => {}
        }
    }

    /// Drop the pinned certificate and reconnect, e.g. after the local certificate changed.
    pub fn invalidate_credentials(&self) {
        self.send(LifecycleEvent::InvalidateCredentials);
    }

    pub fn shutdown(&self) {
        self.send(LifecycleEvent::Shutdown);
    }

    /// Wait until the remote is `Online`, at most `timeout`, and return its client.
    pub async fn wait_online(&self, timeout: Duration) -> Result<RpcClient, RpcError> {
        let mut state = self.state.subscribe();
        let online = async move {
            state
                .wait_for(|s| *s == RemoteState::Online)
                .await
                .map(|_| ())
        };
        match tokio::time::timeout(timeout, online).await {
            Err(_) => return Err(RpcError::Timeout),
            Ok(Err(_)) => return Err(RpcError::Closed),
            Ok(Ok(())) => {}
        }
        self.client()
            .ok_or_else(|| RpcError::Unavailable(format!("{} has no channel", self.id)))
    }

    /// Wait until this node has its own channel to the peer.
    pub async fn wait_reachable(&self, timeout: Duration) -> Result<(), RpcError> {
        let mut state = self.state.subscribe();
        let reachable = async move {
            state
                .wait_for(|s| matches!(s, RemoteState::WaitingForDuplex | RemoteState::Online))
                .await
                .map(|_| ())
        };
        match tokio::time::timeout(timeout, reachable).await {
            Err(_) => Err(RpcError::Timeout),
            Ok(Err(_)) => Err(RpcError::Closed),
            Ok(Ok(())) => Ok(()),
        }
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.attempt.load(Ordering::SeqCst) == attempt
    }

    fn next_attempt(&self) -> u64 {
        self.attempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn apply_signal(&self, signal: LifecycleSignal) -> bool {
        let current = self.state();
        match next_state(current, signal) {
            Some(next) => {
                info!("Peer {}: {} -> {}", self.id, current, next);
                self.state.send_replace(next);
                self.ctx.publish(NodeEvent::RemoteStateChanged {
                    id: self.id.clone(),
                    state: next,
                });
                true
            }
            None => {
                debug!("Peer {}: ignored {:?} while {}", self.id, signal, current);
                false
            }
        }
    }

    fn drop_channel(&self) {
        if let Some(client) = self.client.lock().take() {
            client.close();
        }
    }

    async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<LifecycleEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                LifecycleEvent::Discovered(peer) => {
                    *self.peer.lock() = Some(peer);
                    if self.apply_signal(LifecycleSignal::Discovered) {
                        let attempt = self.next_attempt();
                        self.start_connect(attempt);
                    }
                }
                LifecycleEvent::Vanished => {
                    self.next_attempt();
                    self.drop_channel();
                    self.apply_signal(LifecycleSignal::Vanished);
                    self.errors.store(0, Ordering::SeqCst);
                }
                LifecycleEvent::ChannelReady(attempt) if self.is_current(attempt) => {
                    self.apply_signal(LifecycleSignal::ChannelReady);
                }
                LifecycleEvent::DuplexConfirmed(attempt) if self.is_current(attempt) => {
                    if self.apply_signal(LifecycleSignal::DuplexConfirmed) {
                        self.errors.store(0, Ordering::SeqCst);
                        self.start_keepalive(attempt);
                    }
                }
                LifecycleEvent::Failed(attempt, reason) if self.is_current(attempt) => {
                    if self.apply_signal(LifecycleSignal::Failure) {
                        warn!("Peer {} failed: {}", self.id, reason);
                        self.drop_channel();
                        let errors = self.errors.fetch_add(1, Ordering::SeqCst) + 1;
                        let retry = self.next_attempt();
                        self.schedule_retry(retry, backoff(errors));
                    }
                }
                LifecycleEvent::Retry(attempt) if self.is_current(attempt) => {
                    if self.apply_signal(LifecycleSignal::Retry) {
                        self.start_connect(attempt);
                    }
                }
                LifecycleEvent::InvalidateCredentials => {
                    *self.certificate.lock() = None;
                    self.drop_channel();
                    let attempt = self.next_attempt();
                    if self.apply_signal(LifecycleSignal::CredentialsInvalidated) {
                        self.start_connect(attempt);
                    }
                }
                LifecycleEvent::Shutdown => {
                    self.next_attempt();
                    self.drop_channel();
                    break;
                }
                stale => debug!("Peer {}: dropped stale {:?}", self.id, stale),
            }
        }
        debug!("Lifecycle of {} stopped", self.id);
    }

    fn start_connect(self: &Arc<Self>, attempt: u64) {
        let remote = self.clone();
        tokio::spawn(async move {
            match remote.connect_sequence(attempt).await {
                Ok(()) => remote.send(LifecycleEvent::DuplexConfirmed(attempt)),
                Err(e) => remote.send(LifecycleEvent::Failed(attempt, e.to_string())),
            }
        });
    }

    async fn connect_sequence(self: &Arc<Self>, attempt: u64) -> Result<(), RpcError> {
        let settings = &self.ctx.settings;
        let peer = self
            .peer()
            .ok_or_else(|| RpcError::InvalidState(format!("{} has no address", self.id)))?;
        let addr = peer
            .resolve()
            .await
            .map_err(|e| RpcError::Unavailable(e.to_string()))?;
        *self.resolved.lock() = Some(addr);

        let pinned = self.certificate.lock().clone();
        let certificate = match pinned {
            Some(certificate) => certificate,
            None => {
                debug!("Requesting certificate from {} at {}", self.id, addr);
                let bootstrap = tokio::time::timeout(
                    settings.connect_timeout,
                    self.ctx.transport.connect(addr, None),
                )
                .await
                .map_err(|_| RpcError::Timeout)??;
                let bootstrap = RpcClient::new(bootstrap);
                let locked = tokio::time::timeout(
                    settings.connect_timeout,
                    bootstrap.request_certificate(self.ctx.me()),
                )
                .await
                .map_err(|_| RpcError::Timeout);
                bootstrap.close();

                let certificate = self.ctx.trust.open_remote_certificate(&locked??)?;
                *self.certificate.lock() = Some(certificate.clone());
                certificate
            }
        };

        let channel = tokio::time::timeout(
            settings.connect_timeout,
            self.ctx.transport.connect(addr, Some(certificate)),
        )
        .await
        .map_err(|_| RpcError::Timeout)?;
        let channel = match channel {
            Ok(channel) => channel,
            Err(RpcError::UntrustedCertificate) => {
                // The peer changed its certificate; exchange again on the next attempt.
                *self.certificate.lock() = None;
                return Err(RpcError::UntrustedCertificate);
            }
            Err(e) => return Err(e),
        };

        let client = RpcClient::new(channel);
        if !self.is_current(attempt) {
            client.close();
            return Err(RpcError::InvalidState("connect attempt superseded".into()));
        }
        *self.client.lock() = Some(client.clone());
        self.watch_connectivity(attempt, client.connectivity());
        self.notify_connectivity_for(attempt, Connectivity::Ready);

        client
            .waiting_for_duplex(self.ctx.me(), settings.duplex_timeout)
            .await
    }

    fn watch_connectivity(self: &Arc<Self>, attempt: u64, mut connectivity: watch::Receiver<Connectivity>) {
        let remote = self.clone();
        tokio::spawn(async move {
            loop {
                let current = *connectivity.borrow_and_update();
                if matches!(current, Connectivity::TransientFailure | Connectivity::Shutdown) {
                    remote.notify_connectivity_for(attempt, current);
                    return;
                }
                if connectivity.changed().await.is_err() || !remote.is_current(attempt) {
                    return;
                }
            }
        });
    }

    fn start_keepalive(self: &Arc<Self>, attempt: u64) {
        let remote = self.clone();
        tokio::spawn(async move {
            let interval = remote.ctx.settings.ping_interval;
            loop {
                tokio::time::sleep(interval).await;
                if !remote.is_current(attempt) {
                    return;
                }
                let Some(client) = remote.client() else {
                    return;
                };
                if let Err(e) = client.ping(remote.ctx.me(), remote.ctx.settings.connect_timeout).await {
                    remote.send(LifecycleEvent::Failed(attempt, format!("ping failed: {}", e)));
                    return;
                }
                debug!("Pinged {}", remote.id);
            }
        });
    }

    fn schedule_retry(self: &Arc<Self>, attempt: u64, delay: Duration) {
        debug!("Retrying {} in {:?}", self.id, delay);
        let remote = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if remote.is_current(attempt) {
                remote.send(LifecycleEvent::Retry(attempt));
            }
        });
    }

    // ---- transfers -------------------------------------------------------

    /// Snapshot of every transfer with this peer.
    pub fn transfers(&self) -> Vec<TransferOperation> {
        let transfers = self.transfers.lock();
        let mut all: Vec<_> = transfers
            .outgoing
            .values()
            .chain(transfers.incoming.values())
            .cloned()
            .collect();
        all.sort_by_key(|op| op.transfer_id);
        all
    }

    pub fn transfer(&self, direction: Direction, transfer_id: i64) -> Option<TransferOperation> {
        self.transfers
            .lock()
            .map_mut(direction)
            .get(&transfer_id)
            .cloned()
    }

    /// Direction under which `transfer_id` is known, downloads first.
    fn find_direction(&self, transfer_id: i64) -> Option<Direction> {
        let transfers = self.transfers.lock();
        if transfers.incoming.contains_key(&transfer_id) {
            Some(Direction::Download)
        } else if transfers.outgoing.contains_key(&transfer_id) {
            Some(Direction::Upload)
        } else {
            None
        }
    }

    /// Run `f` on one operation and publish its state if it changed.
    fn with_transfer<R>(
        &self,
        direction: Direction,
        transfer_id: i64,
        f: impl FnOnce(&mut TransferOperation) -> R,
    ) -> Option<R> {
        let (result, changed) = {
            let mut transfers = self.transfers.lock();
            let op = transfers.map_mut(direction).get_mut(&transfer_id)?;
            let before = op.state().clone();
            let result = f(op);
            let changed = (*op.state() != before).then(|| op.state().clone());
            (result, changed)
        };

        if let Some(state) = changed {
            self.ctx.publish(NodeEvent::TransferStateChanged {
                peer_id: self.id.clone(),
                transfer_id,
                direction,
                state,
            });
        }
        Some(result)
    }

    fn apply_event(&self, direction: Direction, transfer_id: i64, event: TransferEvent) -> Option<SideEffect> {
        self.with_transfer(direction, transfer_id, |op| op.apply(event)).flatten()
    }

    fn perform(self: &Arc<Self>, effect: Option<SideEffect>, transfer_id: i64, error: bool) {
        let Some(effect) = effect else {
            return;
        };
        let Some(client) = self.client() else {
            debug!("No channel to {}, skipping {:?}", self.id, effect);
            return;
        };

        let info = OpInfo {
            ident: self.ctx.me().id,
            transfer_id,
            readable_name: String::new(),
        };
        let id = self.id.clone();
        tokio::spawn(async move {
            let result = match effect {
                SideEffect::SendCancelRequest => client.cancel_transfer_op_request(info).await,
                SideEffect::SendStopTransfer => client.stop_transfer(info, error).await,
            };
            if let Err(e) = result {
                debug!("{:?} to {} failed: {}", effect, id, e);
            }
        });
    }

    /// Offer an upload to the peer. On success the operation is `Requested`;
    /// if the request cannot be delivered it is dropped and the error returned.
    pub async fn send_operation(self: &Arc<Self>, mut op: TransferOperation) -> Result<i64, RpcError> {
        let transfer_id = op.transfer_id;
        let me = self.ctx.me();
        op.apply(TransferEvent::Requested);
        let request = op.to_request(&me.id, &me.readable_name);

        self.transfers.lock().outgoing.insert(transfer_id, op);
        self.ctx.publish(NodeEvent::TransferStateChanged {
            peer_id: self.id.clone(),
            transfer_id,
            direction: Direction::Upload,
            state: TransferState::Requested,
        });

        let delivered = match self.wait_online(self.ctx.settings.connect_timeout).await {
            Ok(client) => client.process_transfer_op_request(request).await,
            Err(e) => Err(e),
        };

        if let Err(e) = delivered {
            warn!("Could not offer transfer {} to {}: {}", transfer_id, self.id, e);
            self.transfers.lock().outgoing.remove(&transfer_id);
            return Err(e);
        }

        info!("Offered transfer {} to {}", transfer_id, self.id);
        Ok(transfer_id)
    }

    /// An inbound transfer request from this peer.
    pub fn register_incoming(self: &Arc<Self>, request: &TransferRequest) {
        let transfer_id = request.transfer_id;
        let existing = {
            let mut transfers = self.transfers.lock();
            if transfers.incoming.contains_key(&transfer_id) {
                true
            } else {
                transfers
                    .incoming
                    .insert(transfer_id, TransferOperation::new_download(request));
                false
            }
        };

        if existing {
            self.apply_event(Direction::Download, transfer_id, TransferEvent::Requested);
            return;
        }

        info!(
            "Incoming transfer {} from {}: {} ({} bytes, {} entries)",
            transfer_id, self.id, request.name_if_single, request.size, request.count
        );
        self.ctx.publish(NodeEvent::IncomingTransfer {
            peer_id: self.id.clone(),
            transfer_id,
            title: self
                .transfer(Direction::Download, transfer_id)
                .map(|op| op.title)
                .unwrap_or_default(),
            size: request.size,
            count: request.count,
        });

        if self.ctx.settings.auto_accept {
            let remote = self.clone();
            tokio::spawn(async move {
                if let Err(e) = remote.accept(transfer_id).await {
                    warn!("Auto-accept of transfer {} failed: {}", transfer_id, e);
                }
            });
        }
    }

    /// Accept a requested download and start pulling its chunks.
    pub async fn accept(self: &Arc<Self>, transfer_id: i64) -> Result<(), RpcError> {
        let op = self
            .transfer(Direction::Download, transfer_id)
            .ok_or_else(|| RpcError::NotFound(format!("transfer {}", transfer_id)))?;
        if *op.state() != TransferState::Requested {
            return Err(RpcError::InvalidState(format!(
                "transfer {} is {}",
                transfer_id,
                op.state()
            )));
        }

        let client = self.wait_online(self.ctx.settings.connect_timeout).await?;
        self.apply_event(Direction::Download, transfer_id, TransferEvent::Start);

        let remote = self.clone();
        tokio::spawn(async move { remote.receive(client, op).await });
        Ok(())
    }

    async fn receive(self: Arc<Self>, client: RpcClient, op: TransferOperation) {
        let transfer_id = op.transfer_id;
        let cancel = op.cancel_handle();
        let info = op.op_info(&self.ctx.me().id);

        let mut downloader = match TransferDownloader::new(
            &self.ctx.settings.save_directory,
            &op.top_dir_basenames,
            self.ctx.settings.allow_symlinks,
        ) {
            Ok(downloader) => downloader,
            Err(e) => return self.fail_download(transfer_id, e.to_string()),
        };

        let mut stream = match client.start_transfer(info).await {
            Ok(stream) => stream,
            Err(e) => return self.fail_download(transfer_id, e.to_string()),
        };

        while let Some(item) = stream.next().await {
            if cancel.is_cancelled() {
                debug!("Transfer {} cancelled, dropping stream", transfer_id);
                return;
            }

            let chunk: Chunk = match item {
                Ok(chunk) => chunk,
                Err(RpcError::Remote(RpcStatus {
                    code: StatusCode::Cancelled,
                    ..
                })) => {
                    self.apply_event(
                        Direction::Download,
                        transfer_id,
                        TransferEvent::TransferCancelledByRemote,
                    );
                    return;
                }
                Err(e) => return self.fail_download(transfer_id, e.to_string()),
            };

            let bytes = chunk.payload.len();
            let written = tokio::task::spawn_blocking(move || {
                let result = downloader.handle_chunk(&chunk);
                (downloader, result)
            })
            .await;

            downloader = match written {
                Ok((downloader, Ok(()))) => downloader,
                Ok((_, Err(e))) => return self.fail_download(transfer_id, e.to_string()),
                Err(e) => return self.fail_download(transfer_id, e.to_string()),
            };
            self.with_transfer(Direction::Download, transfer_id, |op| {
                op.metrics_mut().record_chunk(bytes)
            });
        }

        if cancel.is_cancelled() {
            return;
        }

        let finished = tokio::task::spawn_blocking(move || downloader.finish()).await;
        match finished {
            Ok(Ok(())) => {
                self.apply_event(Direction::Download, transfer_id, TransferEvent::Completed);
            }
            Ok(Err(e)) => self.fail_download(transfer_id, e.to_string()),
            Err(e) => self.fail_download(transfer_id, e.to_string()),
        }
    }

    fn fail_download(self: &Arc<Self>, transfer_id: i64, reason: String) {
        warn!("Transfer {} from {} failed: {}", transfer_id, self.id, reason);
        let failed = self.with_transfer(Direction::Download, transfer_id, |op| {
            op.apply(TransferEvent::Failure(reason));
            matches!(op.state(), TransferState::Failed(_))
        });

        if failed == Some(true) {
            self.perform(Some(SideEffect::SendStopTransfer), transfer_id, true);
        }
    }

    /// Serve `StartTransfer` for one of our uploads.
    pub fn start_outgoing(self: &Arc<Self>, transfer_id: i64) -> Result<OutboundChunks, RpcStatus> {
        let (paths, cancel) = self
            .with_transfer(Direction::Upload, transfer_id, |op| {
                if *op.state() != TransferState::Requested {
                    return Err(RpcStatus::failed_precondition(format!(
                        "transfer {} is {}",
                        transfer_id,
                        op.state()
                    )));
                }
                op.apply(TransferEvent::Start);
                Ok((op.source_paths.clone(), op.cancel_handle()))
            })
            .ok_or_else(|| RpcStatus::not_found(format!("transfer {}", transfer_id)))??;

        let settings = &self.ctx.settings;
        let flow = Arc::new(FlowController::new(settings.cache_depth));
        let (tx, rx) = mpsc::channel(settings.cache_depth.max(1) as usize);
        let reader = ChunkReader::new(paths, settings.chunk_size, cancel);

        let remote = self.clone();
        let producer_flow = flow.clone();
        tokio::spawn(async move {
            let handle = tokio::runtime::Handle::current();
            let blocking_flow = producer_flow.clone();
            let blocking_remote = remote.clone();

            let produced = tokio::task::spawn_blocking(move || {
                for item in reader {
                    match item {
                        Ok(chunk) => {
                            if handle.block_on(blocking_flow.wait_for_slot()).is_err() {
                                return Produced::Abandoned;
                            }
                            let bytes = chunk.payload.len();
                            if tx.blocking_send(Ok(chunk)).is_err() {
                                return Produced::Abandoned;
                            }
                            blocking_remote.with_transfer(Direction::Upload, transfer_id, |op| {
                                op.metrics_mut().record_chunk(bytes)
                            });
                        }
                        Err(ChunkError::Cancelled) => {
                            let status = RpcStatus::new(StatusCode::Cancelled, "transfer cancelled");
                            let _ = tx.blocking_send(Err(status));
                            return Produced::Cancelled;
                        }
                        Err(e) => {
                            let _ = tx.blocking_send(Err(RpcStatus::internal(e.to_string())));
                            return Produced::Failed(e.to_string());
                        }
                    }
                }
                Produced::All
            })
            .await
            .unwrap_or_else(|e| Produced::Failed(e.to_string()));

            remote.finish_outgoing(transfer_id, produced, &producer_flow).await;
        });

        Ok(OutboundChunks::new(rx, flow))
    }

    async fn finish_outgoing(&self, transfer_id: i64, produced: Produced, flow: &FlowController) {
        let event = match produced {
            Produced::All => {
                flow.wait_idle().await;
                if flow.completed() >= flow.initiated() {
                    TransferEvent::Completed
                } else {
                    tokio::time::sleep(ABANDON_GRACE).await;
                    TransferEvent::Failure("receiver stopped reading".into())
                }
            }
            Produced::Abandoned => {
                // A cancel from the peer usually arrives right behind the dropped stream.
                tokio::time::sleep(ABANDON_GRACE).await;
                TransferEvent::Failure("receiver stopped reading".into())
            }
            Produced::Failed(reason) => TransferEvent::Failure(reason),
            Produced::Cancelled => return,
        };
        self.apply_event(Direction::Upload, transfer_id, event);
    }

    /// User cancel of either direction.
    pub fn cancel(self: &Arc<Self>, transfer_id: i64) -> Result<(), RpcError> {
        let direction = self
            .find_direction(transfer_id)
            .ok_or_else(|| RpcError::NotFound(format!("transfer {}", transfer_id)))?;
        let effect = self
            .with_transfer(direction, transfer_id, |op| op.user_cancel())
            .flatten();
        self.perform(effect, transfer_id, false);
        Ok(())
    }

    /// Remove a transfer that reached a terminal state.
    pub fn remove(&self, transfer_id: i64) -> Result<TransferOperation, RpcError> {
        let direction = self
            .find_direction(transfer_id)
            .ok_or_else(|| RpcError::NotFound(format!("transfer {}", transfer_id)))?;

        let not_found = || RpcError::NotFound(format!("transfer {}", transfer_id));
        let mut transfers = self.transfers.lock();
        let map = transfers.map_mut(direction);

        let state = map.get(&transfer_id).map(|op| op.state().clone()).ok_or_else(not_found)?;
        if !state.is_terminal() {
            return Err(RpcError::InvalidState(format!(
                "transfer {} is {}",
                transfer_id, state
            )));
        }
        map.remove(&transfer_id).ok_or_else(not_found)
    }

    /// The peer withdrew a request before it started.
    pub fn on_request_cancelled(&self, transfer_id: i64) -> Result<(), RpcStatus> {
        let direction = self
            .find_direction(transfer_id)
            .ok_or_else(|| RpcStatus::not_found(format!("transfer {}", transfer_id)))?;
        self.apply_event(direction, transfer_id, TransferEvent::RequestCancelledByRemote);
        Ok(())
    }

    /// The peer stopped a running transfer. With `error` set the stop reports a failure.
    pub fn on_transfer_stopped(&self, transfer_id: i64, error: bool) -> Result<(), RpcStatus> {
        let direction = self
            .find_direction(transfer_id)
            .ok_or_else(|| RpcStatus::not_found(format!("transfer {}", transfer_id)))?;

        let event = if error {
            TransferEvent::Failure("transfer failed on the receiving side".into())
        } else {
            TransferEvent::TransferCancelledByRemote
        };
        self.with_transfer(direction, transfer_id, |op| {
            op.apply(event);
            // Failure does not trip the cancel handle; stop producing either way.
            op.cancel_handle().cancel();
        });
        Ok(())
    }
}
