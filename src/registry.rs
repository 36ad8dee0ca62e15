//! # Peer Registry
//!
//! Maps peer identities to their [`Remote`]. Remotes are created on first
//! sight (a discovery event or an inbound `RequestCertificate`) and are never
//! deleted: a vanished peer is retired to `MdnsOffline` and revived by the next
//! discovery. The map lock is only held to look up or insert, so work on one
//! remote never blocks another.

use crate::discovery::{DiscoveryEvent, Peer};
use crate::remote::{Remote, RemoteContext, RemoteState};
use crate::rpc::{LookupName, RpcError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

pub struct PeerRegistry {
    ctx: Arc<RemoteContext>,
    remotes: RwLock<HashMap<String, Arc<Remote>>>,
    added: Notify,
}

impl PeerRegistry {
    pub fn new(ctx: Arc<RemoteContext>) -> Self {
        Self {
            ctx,
            remotes: RwLock::new(HashMap::new()),
            added: Notify::new(),
        }
    }

    pub fn local_id(&self) -> String {
        self.ctx.trust.identity().to_string()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Remote>> {
        self.remotes.read().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.remotes.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn remotes(&self) -> Vec<Arc<Remote>> {
        let mut remotes: Vec<_> = self.remotes.read().values().cloned().collect();
        remotes.sort_by(|a, b| a.id().cmp(b.id()));
        remotes
    }

    fn get_or_create(&self, id: &str) -> Arc<Remote> {
        if let Some(remote) = self.get(id) {
            return remote;
        }

        let remote = self
            .remotes
            .write()
            .entry(id.to_string())
            .or_insert_with(|| {
                info!("New peer {}", id);
                Remote::spawn(id, self.ctx.clone())
            })
            .clone();
        self.added.notify_waiters();
        remote
    }

    pub fn handle_discovery(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Appeared(peer) => {
                if peer.name == self.local_id() {
                    debug!("Ignoring our own announcement");
                    return;
                }
                self.get_or_create(&peer.name).discovered(peer);
            }
            DiscoveryEvent::Vanished(id) => match self.get(&id) {
                Some(remote) => remote.vanished(),
                None => debug!("Unknown peer {} vanished", id),
            },
        }
    }

    /// A peer asked for our certificate from `addr`. Unknown or lost peers are
    /// (re)discovered at that address so only one side needs to know the other.
    pub fn observe_requester(&self, requester: &LookupName, addr: SocketAddr) {
        if requester.id.is_empty() || requester.id == self.local_id() {
            return;
        }

        let remote = self.get_or_create(&requester.id);
        if matches!(remote.state(), RemoteState::MdnsOffline | RemoteState::Failure) {
            debug!("Discovered {} through its request from {}", requester.id, addr);
            remote.discovered(Peer::from_addr(requester.id.clone(), addr));
        }
    }

    /// Block until this node has a channel of its own to `id`, at most `timeout`.
    pub async fn wait_for_duplex(&self, id: &str, timeout: Duration) -> Result<(), RpcError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let added = self.added.notified();
            tokio::pin!(added);
            added.as_mut().enable();

            if let Some(remote) = self.get(id) {
                let left = deadline.saturating_duration_since(tokio::time::Instant::now());
                return remote.wait_reachable(left).await;
            }

            if tokio::time::timeout_at(deadline, added).await.is_err() {
                return Err(RpcError::Timeout);
            }
        }
    }

    /// Every pinned peer certificate is stale; exchange again with everyone.
    pub fn invalidate_certificates(&self) {
        for remote in self.remotes() {
            remote.invalidate_credentials();
        }
    }

    /// Consume a discovery feed until it closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<DiscoveryEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_discovery(event);
        }
        debug!("Discovery feed closed");
    }

    pub fn shutdown(&self) {
        for remote in self.remotes() {
            remote.shutdown();
        }
    }
}
