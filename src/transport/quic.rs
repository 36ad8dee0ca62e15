//! # QUIC Transport
//!
//! One quinn [`Endpoint`] per node acts as both server and client, so a peer
//! dials out from the same address it listens on. Each RPC call runs on its own
//! bidirectional stream:
//!
//! ```text
//! client ──▶ CallFrame (Unary | StartTransfer) ── finish
//! server ──▶ Result<RpcResponse, RpcStatus>                 (unary)
//! server ──▶ StreamFrame::Chunk* (StreamFrame::End | Error) (streaming)
//! ```
//!
//! Frames are a 4-byte big-endian length followed by a bincode payload.
//!
//! TLS: the server presents the node certificate. Clients either pin the
//! certificate obtained through the certificate exchange, or, for the exchange
//! itself, accept any certificate.

use crate::crypto::LocalCertificate;
use crate::rpc::{
    CallContext, ChunkStream, Connectivity, OpInfo, RpcChannel, RpcError, RpcHandler, RpcRequest,
    RpcResponse, RpcStatus, StreamFrame, Transport, SERVER_NAME,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use quinn::{Connection, Endpoint, RecvStream, SendStream};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const ALPN: &[u8] = b"lanwarp/1";
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const KEEP_ALIVE: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
enum CallFrame {
    Unary(RpcRequest),
    StartTransfer(OpInfo),
}

fn transport_error(err: impl std::fmt::Display) -> RpcError {
    RpcError::Unavailable(err.to_string())
}

async fn write_frame<T: Serialize>(send: &mut SendStream, value: &T) -> Result<(), RpcError> {
    let payload = bincode::serialize(value)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(RpcError::Codec(format!("frame of {} bytes is too large", payload.len())));
    }

    send.write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .map_err(transport_error)?;
    send.write_all(&payload).await.map_err(transport_error)?;
    Ok(())
}

async fn read_frame<T: DeserializeOwned>(recv: &mut RecvStream) -> Result<T, RpcError> {
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf).await.map_err(|e| match e {
        quinn::ReadExactError::FinishedEarly => RpcError::Closed,
        other => transport_error(other),
    })?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(RpcError::Codec(format!("frame of {} bytes is too large", len)));
    }

    let mut payload = vec![0u8; len];
    recv.read_exact(&mut payload).await.map_err(transport_error)?;
    Ok(bincode::deserialize(&payload)?)
}

fn server_config(certificate: &LocalCertificate) -> Result<quinn::ServerConfig, RpcError> {
    let cert = rustls::Certificate(certificate.certificate_der().to_vec());
    let key = rustls::PrivateKey(certificate.private_key_der().to_vec());

    let mut crypto = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(|e| RpcError::Unavailable(format!("failed to configure server: {}", e)))?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    Ok(quinn::ServerConfig::with_crypto(Arc::new(crypto)))
}

fn client_config(verifier: Arc<dyn rustls::client::ServerCertVerifier>) -> quinn::ClientConfig {
    let mut crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE));

    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(Arc::new(transport));
    config
}

/// Accepts exactly one certificate, byte for byte.
struct PinnedCertVerifier {
    certificate_der: Vec<u8>,
    mismatch: AtomicBool,
}

impl rustls::client::ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        if end_entity.0 == self.certificate_der {
            Ok(rustls::client::ServerCertVerified::assertion())
        } else {
            self.mismatch.store(true, Ordering::SeqCst);
            Err(rustls::Error::General("certificate does not match the pinned one".into()))
        }
    }
}

/// Used only for `RequestCertificate`; the payload is authenticated by the group key.
struct AcceptAnyCertificate;

impl rustls::client::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

pub struct QuicTransport {
    endpoint: Endpoint,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl QuicTransport {
    /// Bind the UDP socket. Nothing is accepted until [`Transport::serve`] runs.
    pub fn bind(addr: SocketAddr) -> Result<Self, RpcError> {
        let endpoint = Endpoint::client(addr).map_err(transport_error)?;
        info!("QUIC endpoint bound to {}", endpoint.local_addr().map_err(transport_error)?);

        Ok(Self {
            endpoint,
            accept_task: Mutex::new(None),
        })
    }

    async fn handle_connection(connection: Connection, handler: Arc<dyn RpcHandler>) {
        let ctx = CallContext {
            remote_addr: connection.remote_address(),
        };
        debug!("Accepted connection from {}", ctx.remote_addr);

        loop {
            match connection.accept_bi().await {
                Ok((send, recv)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_call(ctx, send, recv, handler).await {
                            debug!("Call from {} ended with error: {}", ctx.remote_addr, e);
                        }
                    });
                }
                Err(e) => {
                    debug!("Connection {} closed: {}", ctx.remote_addr, e);
                    break;
                }
            }
        }
    }

    async fn handle_call(
        ctx: CallContext,
        mut send: SendStream,
        mut recv: RecvStream,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<(), RpcError> {
        match read_frame::<CallFrame>(&mut recv).await? {
            CallFrame::Unary(request) => {
                let response = handler.handle_unary(ctx, request).await;
                write_frame(&mut send, &response).await?;
            }
            CallFrame::StartTransfer(op) => match handler.handle_start_transfer(ctx, op).await {
                Err(status) => write_frame(&mut send, &StreamFrame::Error(status)).await?,
                Ok(mut outbound) => loop {
                    match outbound.next().await {
                        Some(Ok(chunk)) => {
                            write_frame(&mut send, &StreamFrame::Chunk(chunk)).await?;
                            outbound.ack();
                        }
                        Some(Err(status)) => {
                            write_frame(&mut send, &StreamFrame::Error(status)).await?;
                            outbound.ack();
                            break;
                        }
                        None => {
                            write_frame(&mut send, &StreamFrame::End).await?;
                            break;
                        }
                    }
                },
            },
        }

        send.finish().await.map_err(transport_error)?;
        Ok(())
    }
}

#[async_trait]
impl Transport for QuicTransport {
    async fn serve(
        &self,
        handler: Arc<dyn RpcHandler>,
        certificate: &LocalCertificate,
    ) -> Result<SocketAddr, RpcError> {
        self.endpoint.set_server_config(Some(server_config(certificate)?));

        let endpoint = self.endpoint.clone();
        let task = tokio::spawn(async move {
            while let Some(connecting) = endpoint.accept().await {
                let handler = handler.clone();
                tokio::spawn(async move {
                    match connecting.await {
                        Ok(connection) => Self::handle_connection(connection, handler).await,
                        Err(e) => warn!("Failed to accept connection: {}", e),
                    }
                });
            }
        });

        if let Some(previous) = self.accept_task.lock().replace(task) {
            previous.abort();
        }

        let addr = self.endpoint.local_addr().map_err(transport_error)?;
        info!("Serving on {}", addr);
        Ok(addr)
    }

    async fn connect(
        &self,
        addr: SocketAddr,
        pinned: Option<Vec<u8>>,
    ) -> Result<Arc<dyn RpcChannel>, RpcError> {
        let pinned_verifier = pinned.map(|certificate_der| {
            Arc::new(PinnedCertVerifier {
                certificate_der,
                mismatch: AtomicBool::new(false),
            })
        });
        let verifier: Arc<dyn rustls::client::ServerCertVerifier> = match &pinned_verifier {
            Some(verifier) => verifier.clone(),
            None => Arc::new(AcceptAnyCertificate),
        };

        let connecting = self
            .endpoint
            .connect_with(client_config(verifier), addr, SERVER_NAME)
            .map_err(transport_error)?;

        let connection = match connecting.await {
            Ok(connection) => connection,
            Err(e) => {
                if pinned_verifier.is_some_and(|v| v.mismatch.load(Ordering::SeqCst)) {
                    return Err(RpcError::UntrustedCertificate);
                }
                return Err(transport_error(e));
            }
        };

        let (state, _) = watch::channel(Connectivity::Ready);
        let state = Arc::new(state);
        let watcher = {
            let connection = connection.clone();
            let state = state.clone();
            tokio::spawn(async move {
                let reason = connection.closed().await;
                debug!("Connection to {} closed: {}", connection.remote_address(), reason);
                let next = match reason {
                    quinn::ConnectionError::LocallyClosed => Connectivity::Shutdown,
                    _ => Connectivity::TransientFailure,
                };
                state.send_replace(next);
            })
        };

        Ok(Arc::new(QuicChannel {
            connection,
            state,
            watcher,
        }))
    }

    async fn update_certificate(&self, certificate: &LocalCertificate) -> Result<(), RpcError> {
        self.endpoint.set_server_config(Some(server_config(certificate)?));
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr().ok()
    }

    async fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

struct QuicChannel {
    connection: Connection,
    state: Arc<watch::Sender<Connectivity>>,
    watcher: JoinHandle<()>,
}

impl QuicChannel {
    async fn open_call(&self, frame: &CallFrame) -> Result<RecvStream, RpcError> {
        let (mut send, recv) = self.connection.open_bi().await.map_err(transport_error)?;
        write_frame(&mut send, frame).await?;
        send.finish().await.map_err(transport_error)?;
        Ok(recv)
    }
}

#[async_trait]
impl RpcChannel for QuicChannel {
    async fn unary(&self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        let mut recv = self.open_call(&CallFrame::Unary(request)).await?;
        let response: Result<RpcResponse, RpcStatus> = read_frame(&mut recv).await?;
        response.map_err(RpcError::from)
    }

    async fn start_transfer(&self, op: OpInfo) -> Result<ChunkStream, RpcError> {
        let recv = self.open_call(&CallFrame::StartTransfer(op)).await?;

        let stream = futures::stream::unfold(Some(recv), |state| async move {
            let mut recv = state?;
            match read_frame::<StreamFrame>(&mut recv).await {
                Ok(StreamFrame::Chunk(chunk)) => Some((Ok(chunk), Some(recv))),
                Ok(StreamFrame::End) => None,
                Ok(StreamFrame::Error(status)) => Some((Err(RpcError::from(status)), None)),
                Err(e) => Some((Err(e), None)),
            }
        });
        Ok(Box::pin(stream))
    }

    fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    fn close(&self) {
        self.connection.close(0u32.into(), b"closed");
    }
}

impl Drop for QuicChannel {
    fn drop(&mut self) {
        self.watcher.abort();
        self.connection.close(0u32.into(), b"dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;
    use crate::rpc::{LookupName, OutboundChunks};
    use assert_matches::assert_matches;

    struct PingHandler;

    #[async_trait]
    impl RpcHandler for PingHandler {
        async fn handle_unary(
            &self,
            _ctx: CallContext,
            request: RpcRequest,
        ) -> Result<RpcResponse, RpcStatus> {
            match request {
                RpcRequest::Ping(_) => Ok(RpcResponse::Ack),
                _ => Err(RpcStatus::not_found("unsupported")),
            }
        }

        async fn handle_start_transfer(
            &self,
            _ctx: CallContext,
            _op: OpInfo,
        ) -> Result<OutboundChunks, RpcStatus> {
            Err(RpcStatus::not_found("no transfers"))
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_pinned_and_bootstrap_connections() {
        let certificate = LocalCertificate::generate(&Identity::new("quichost", "0000000A")).unwrap();
        let server = QuicTransport::bind(loopback()).unwrap();
        let addr = server.serve(Arc::new(PingHandler), &certificate).await.unwrap();
        let client = QuicTransport::bind(loopback()).unwrap();

        let me = LookupName {
            id: "me".into(),
            readable_name: "Me".into(),
        };

        let bootstrap = client.connect(addr, None).await.unwrap();
        assert_eq!(
            bootstrap.unary(RpcRequest::Ping(me.clone())).await.unwrap(),
            RpcResponse::Ack
        );

        let pinned = client
            .connect(addr, Some(certificate.certificate_der().to_vec()))
            .await
            .unwrap();
        assert_eq!(pinned.unary(RpcRequest::Ping(me.clone())).await.unwrap(), RpcResponse::Ack);
        assert_matches!(
            pinned.unary(RpcRequest::WaitingForDuplex(me)).await,
            Err(RpcError::NotFound(_))
        );

        let stranger = LocalCertificate::generate(&Identity::new("other", "0000000B")).unwrap();
        let result = client
            .connect(addr, Some(stranger.certificate_der().to_vec()))
            .await;
        assert_matches!(result.err(), Some(RpcError::UntrustedCertificate));

        server.shutdown().await;
    }
}
