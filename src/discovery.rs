//! # Discovery Feed
//!
//! Local-network discovery (mDNS or anything else) is an external collaborator:
//! it only has to push [`DiscoveryEvent`]s into the node. A [`Peer`] is an
//! immutable snapshot; an update is reported as a fresh `Appeared` event and the
//! owning remote swaps its stored snapshot.
//!
//! [`StaticDiscovery`] feeds peers listed in the configuration file.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Stable identity string of the peer.
    pub name: String,
    pub host_name: String,
    pub port: u16,
}

impl Peer {
    pub fn new(name: impl Into<String>, host_name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host_name: host_name.into(),
            port,
        }
    }

    pub fn from_addr(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self::new(name, addr.ip().to_string(), addr.port())
    }

    /// Resolve the host name to a socket address, preferring IPv4.
    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host_name.as_str(), self.port))
            .await?
            .collect();

        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} did not resolve", self.host_name),
                )
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Appeared(Peer),
    Vanished(String),
}

/// Configured peer: `id` is its identity string, `address` is `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticPeer {
    pub id: String,
    pub address: String,
}

impl StaticPeer {
    pub fn to_peer(&self) -> Option<Peer> {
        let (host, port) = self.address.rsplit_once(':')?;
        let port = port.parse().ok()?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Some(Peer::new(self.id.clone(), host, port))
    }
}

/// Announces a fixed list of peers, once through [`StaticDiscovery::announce`] or
/// periodically through [`StaticDiscovery::spawn`].
pub struct StaticDiscovery {
    peers: Vec<StaticPeer>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<StaticPeer>) -> Self {
        Self { peers }
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peers
            .iter()
            .filter_map(|p| {
                let peer = p.to_peer();
                if peer.is_none() {
                    warn!("Ignoring peer {} with malformed address {:?}", p.id, p.address);
                }
                peer
            })
            .collect()
    }

    /// Push an `Appeared` event for every configured peer.
    pub async fn announce(&self, events: &mpsc::Sender<DiscoveryEvent>) {
        for peer in self.peers() {
            debug!("Announcing configured peer {}", peer.name);
            if events.send(DiscoveryEvent::Appeared(peer)).await.is_err() {
                return;
            }
        }
    }

    /// Re-announce every `interval`, which brings retired peers back.
    pub fn spawn(self, events: mpsc::Sender<DiscoveryEvent>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if events.is_closed() {
                    break;
                }
                self.announce(&events).await;
            }
        })
    }
}
