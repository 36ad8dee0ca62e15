//! In-process transport.
//!
//! A [`MemoryNetwork`] is a shared address book of servers. Every
//! [`MemoryTransport`] created from it gets its own loopback address, serves an
//! [`RpcHandler`] there and opens channels to the others. Certificate pinning
//! is enforced by comparing DER bytes, like the QUIC transport does during the
//! TLS handshake.

use crate::chunk::Chunk;
use crate::crypto::LocalCertificate;
use crate::rpc::{
    CallContext, ChunkStream, Connectivity, OpInfo, OutboundChunks, RpcChannel, RpcError,
    RpcHandler, RpcRequest, RpcResponse, Transport,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::debug;

const FIRST_PORT: u16 = 42000;

struct ServerEntry {
    handler: Arc<dyn RpcHandler>,
    certificate_der: Vec<u8>,
    channels: Vec<Weak<watch::Sender<Connectivity>>>,
}

#[derive(Default)]
struct NetworkInner {
    servers: HashMap<SocketAddr, ServerEntry>,
    next_port: u16,
}

/// Shared in-memory network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport with a fresh address on this network.
    pub fn transport(&self) -> MemoryTransport {
        let addr = {
            let mut inner = self.inner.lock();
            let port = FIRST_PORT.saturating_add(inner.next_port);
            inner.next_port += 1;
            SocketAddr::from((Ipv4Addr::LOCALHOST, port))
        };
        MemoryTransport {
            network: self.clone(),
            addr,
        }
    }

    /// Take the server at `addr` off the network. Open channels to it report
    /// `TransientFailure`, as a dropped link would.
    pub fn disconnect(&self, addr: SocketAddr) {
        if let Some(entry) = self.inner.lock().servers.remove(&addr) {
            for channel in entry.channels.iter().filter_map(Weak::upgrade) {
                channel.send_replace(Connectivity::TransientFailure);
            }
        }
    }

    pub fn is_serving(&self, addr: SocketAddr) -> bool {
        self.inner.lock().servers.contains_key(&addr)
    }

    fn handler(&self, addr: SocketAddr) -> Option<Arc<dyn RpcHandler>> {
        self.inner.lock().servers.get(&addr).map(|e| e.handler.clone())
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    addr: SocketAddr,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn serve(
        &self,
        handler: Arc<dyn RpcHandler>,
        certificate: &LocalCertificate,
    ) -> Result<SocketAddr, RpcError> {
        let mut inner = self.network.inner.lock();
        inner.servers.insert(
            self.addr,
            ServerEntry {
                handler,
                certificate_der: certificate.certificate_der().to_vec(),
                channels: Vec::new(),
            },
        );
        debug!("Memory transport serving on {}", self.addr);
        Ok(self.addr)
    }

    async fn connect(
        &self,
        addr: SocketAddr,
        pinned: Option<Vec<u8>>,
    ) -> Result<Arc<dyn RpcChannel>, RpcError> {
        let mut inner = self.network.inner.lock();
        let entry = inner
            .servers
            .get_mut(&addr)
            .ok_or_else(|| RpcError::Unavailable(format!("nothing listening on {}", addr)))?;

        if let Some(pinned) = pinned {
            if pinned != entry.certificate_der {
                return Err(RpcError::UntrustedCertificate);
            }
        }

        let (state, _) = watch::channel(Connectivity::Ready);
        let state = Arc::new(state);
        entry.channels.retain(|c| c.strong_count() > 0);
        entry.channels.push(Arc::downgrade(&state));

        Ok(Arc::new(MemoryChannel {
            network: self.network.clone(),
            target: addr,
            caller: self.addr,
            state,
            closed: AtomicBool::new(false),
        }))
    }

    async fn update_certificate(&self, certificate: &LocalCertificate) -> Result<(), RpcError> {
        if let Some(entry) = self.network.inner.lock().servers.get_mut(&self.addr) {
            entry.certificate_der = certificate.certificate_der().to_vec();
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }

    async fn shutdown(&self) {
        if let Some(entry) = self.network.inner.lock().servers.remove(&self.addr) {
            for channel in entry.channels.iter().filter_map(Weak::upgrade) {
                channel.send_replace(Connectivity::Shutdown);
            }
        }
    }
}

struct MemoryChannel {
    network: MemoryNetwork,
    target: SocketAddr,
    caller: SocketAddr,
    state: Arc<watch::Sender<Connectivity>>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn handler(&self) -> Result<Arc<dyn RpcHandler>, RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        self.network.handler(self.target).ok_or_else(|| {
            self.state.send_replace(Connectivity::TransientFailure);
            RpcError::Unavailable(format!("{} went away", self.target))
        })
    }

    fn context(&self) -> CallContext {
        CallContext {
            remote_addr: self.caller,
        }
    }
}

#[async_trait]
impl RpcChannel for MemoryChannel {
    async fn unary(&self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        let handler = self.handler()?;
        handler
            .handle_unary(self.context(), request)
            .await
            .map_err(RpcError::from)
    }

    async fn start_transfer(&self, op: OpInfo) -> Result<ChunkStream, RpcError> {
        let handler = self.handler()?;
        let outbound = handler.handle_start_transfer(self.context(), op).await?;
        Ok(Box::pin(outbound_stream(outbound)))
    }

    fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.send_replace(Connectivity::Shutdown);
    }
}

/// Deliver items in order, acknowledging each once the consumer has taken it.
fn outbound_stream(
    outbound: OutboundChunks,
) -> impl futures::Stream<Item = Result<Chunk, RpcError>> + Send {
    futures::stream::unfold(Some(outbound), |state| async move {
        let mut outbound = state?;
        match outbound.next().await? {
            Ok(chunk) => {
                outbound.ack();
                Some((Ok(chunk), Some(outbound)))
            }
            Err(status) => {
                outbound.ack();
                Some((Err(RpcError::from(status)), None))
            }
        }
    })
}
