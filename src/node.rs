//! # Node
//!
//! One running lanwarp instance: the trust store, the RPC server, the peer
//! registry and the discovery feed wired together, plus the user-facing
//! operations on top of them.
//!
//! ```rust,no_run
//! # use lanwarp::crypto::{GroupSecret, Identity, TrustStore};
//! # use lanwarp::node::Node;
//! # use lanwarp::remote::RemoteSettings;
//! # use lanwarp::transport::QuicTransport;
//! # use std::sync::Arc;
//! # async fn demo() -> anyhow::Result<()> {
//! let trust = Arc::new(TrustStore::new(
//!     Identity::local().clone(),
//!     &GroupSecret::new("Warpinator"),
//!     None,
//! )?);
//! let transport = Arc::new(QuicTransport::bind("0.0.0.0:42000".parse()?)?);
//! let node = Node::start(trust, transport, RemoteSettings::default()).await?;
//! let mut events = node.events();
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

use crate::crypto::{GroupSecret, TrustStore};
use crate::discovery::{DiscoveryEvent, Peer};
use crate::operation::{Direction, TransferOperation};
use crate::registry::PeerRegistry;
use crate::remote::{Remote, RemoteContext, RemoteSettings, RemoteState};
use crate::rpc::Transport;
use crate::servicer::RpcServicer;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::info;

pub use crate::remote::NodeEvent;

const EVENT_CAPACITY: usize = 256;
const DISCOVERY_CAPACITY: usize = 64;

/// What the node knows about one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub id: String,
    pub address: Option<String>,
    pub state: RemoteState,
    pub transfers: usize,
}

pub struct Node {
    ctx: Arc<RemoteContext>,
    registry: Arc<PeerRegistry>,
    discovery: mpsc::Sender<DiscoveryEvent>,
    local_addr: SocketAddr,
    feed_task: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Serve RPCs on `transport` and start consuming discovery events.
    pub async fn start(
        trust: Arc<TrustStore>,
        transport: Arc<dyn Transport>,
        settings: RemoteSettings,
    ) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let duplex_timeout = settings.duplex_timeout;
        let ctx = Arc::new(RemoteContext {
            trust: trust.clone(),
            transport: transport.clone(),
            settings,
            events,
        });

        let registry = Arc::new(PeerRegistry::new(ctx.clone()));
        let servicer = Arc::new(RpcServicer::new(registry.clone(), trust.clone(), duplex_timeout));
        let local_addr = transport
            .serve(servicer, &trust.certificate())
            .await
            .context("Failed to start the RPC server")?;

        let (discovery, feed) = mpsc::channel(DISCOVERY_CAPACITY);
        let feed_task = tokio::spawn(registry.clone().run(feed));

        info!("Node {} listening on {}", trust.identity(), local_addr);
        Ok(Self {
            ctx,
            registry,
            discovery,
            local_addr,
            feed_task: Mutex::new(Some(feed_task)),
        })
    }

    pub fn identity(&self) -> String {
        self.ctx.trust.identity().to_string()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn settings(&self) -> &RemoteSettings {
        &self.ctx.settings
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Sender side of the discovery feed, for an external discovery service.
    pub fn discovery_sender(&self) -> mpsc::Sender<DiscoveryEvent> {
        self.discovery.clone()
    }

    /// Report a peer as if discovery had seen it.
    pub async fn discover(&self, peer: Peer) -> Result<()> {
        self.discovery
            .send(DiscoveryEvent::Appeared(peer))
            .await
            .context("Discovery feed is closed")
    }

    pub async fn forget(&self, peer_id: &str) -> Result<()> {
        self.discovery
            .send(DiscoveryEvent::Vanished(peer_id.to_string()))
            .await
            .context("Discovery feed is closed")
    }

    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.ctx.events.subscribe()
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        self.registry
            .remotes()
            .into_iter()
            .map(|remote| PeerSummary {
                id: remote.id().to_string(),
                address: remote.peer().map(|p| format!("{}:{}", p.host_name, p.port)),
                state: remote.state(),
                transfers: remote.transfers().len(),
            })
            .collect()
    }

    fn remote(&self, peer_id: &str) -> Result<Arc<Remote>> {
        self.registry
            .get(peer_id)
            .with_context(|| format!("Unknown peer {}", peer_id))
    }

    pub async fn wait_online(&self, peer_id: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let remote = loop {
            if let Some(remote) = self.registry.get(peer_id) {
                break remote;
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("Peer {} was never discovered", peer_id);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };

        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        remote
            .wait_online(left)
            .await
            .with_context(|| format!("Peer {} is not online", peer_id))?;
        Ok(())
    }

    /// Offer `paths` to a peer. Returns the id of the new upload.
    pub async fn send_files(&self, peer_id: &str, paths: Vec<PathBuf>) -> Result<i64> {
        let remote = self.remote(peer_id)?;
        let owner = peer_id.to_string();
        let op = tokio::task::spawn_blocking(move || TransferOperation::new_upload(owner, paths))
            .await
            .context("Scanning the files to send panicked")?
            .context("Failed to scan the files to send")?;

        let transfer_id = remote
            .send_operation(op)
            .await
            .with_context(|| format!("Failed to offer the transfer to {}", peer_id))?;
        Ok(transfer_id)
    }

    pub async fn accept(&self, peer_id: &str, transfer_id: i64) -> Result<()> {
        self.remote(peer_id)?
            .accept(transfer_id)
            .await
            .with_context(|| format!("Failed to accept transfer {}", transfer_id))
    }

    pub fn cancel(&self, peer_id: &str, transfer_id: i64) -> Result<()> {
        self.remote(peer_id)?
            .cancel(transfer_id)
            .with_context(|| format!("Failed to cancel transfer {}", transfer_id))
    }

    pub fn remove(&self, peer_id: &str, transfer_id: i64) -> Result<TransferOperation> {
        self.remote(peer_id)?
            .remove(transfer_id)
            .with_context(|| format!("Failed to remove transfer {}", transfer_id))
    }

    pub fn transfer(&self, peer_id: &str, direction: Direction, transfer_id: i64) -> Option<TransferOperation> {
        self.registry.get(peer_id)?.transfer(direction, transfer_id)
    }

    /// Every transfer with every peer.
    pub fn transfers(&self) -> Vec<TransferOperation> {
        self.registry
            .remotes()
            .iter()
            .flat_map(|remote| remote.transfers())
            .collect()
    }

    /// Replace the local certificate. Every peer goes through the exchange again.
    pub async fn regenerate_certificate(&self) -> Result<()> {
        let certificate = self
            .ctx
            .trust
            .regenerate_certificate()
            .context("Failed to regenerate the certificate")?;
        self.ctx
            .transport
            .update_certificate(&certificate)
            .await
            .context("Failed to present the new certificate")?;
        self.registry.invalidate_certificates();
        Ok(())
    }

    /// Switch to another group code. Peers outside the new group stop trusting us.
    pub async fn set_group(&self, group: &GroupSecret) -> Result<()> {
        let certificate = self
            .ctx
            .trust
            .set_group_secret(group)
            .context("Failed to switch group")?;
        self.ctx
            .transport
            .update_certificate(&certificate)
            .await
            .context("Failed to present the new certificate")?;
        self.registry.invalidate_certificates();
        info!("Switched group, reconnecting to every peer");
        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("Shutting down node {}", self.identity());
        if let Some(task) = self.feed_task.lock().take() {
            task.abort();
        }
        self.registry.shutdown();
        self.ctx.transport.shutdown().await;
    }
}
