//! # RPC Surface
//!
//! Message types and the seams between the peer logic and a concrete transport.
//!
//! - [`RpcChannel`]: client side of one connection to one peer; unary calls, the
//!   server-streaming `StartTransfer` call and connectivity notifications.
//! - [`RpcHandler`]: server side, implemented by the servicer.
//! - [`Transport`]: binds a server and opens channels, optionally pinned to a
//!   certificate obtained through the certificate exchange.
//!
//! Implementations live in [`crate::transport`].

use crate::backpressure::FlowController;
use crate::chunk::Chunk;
use crate::crypto::{AuthError, LocalCertificate};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// TLS server name used on every connection; trust never depends on it.
pub const SERVER_NAME: &str = "lanwarp.local";

/// Identity of the calling node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupName {
    pub id: String,
    pub readable_name: String,
}

/// Metadata of a proposed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub sender_id: String,
    pub sender_name: String,
    pub transfer_id: i64,
    pub size: u64,
    pub count: u64,
    pub name_if_single: String,
    pub mime_if_single: String,
    pub top_dir_basenames: Vec<String>,
}

/// Names a transfer on the remote side. `ident` is the caller's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpInfo {
    pub ident: String,
    pub transfer_id: i64,
    pub readable_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopInfo {
    pub info: OpInfo,
    /// Set when the stop is caused by a failure rather than a user action.
    pub error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    RequestCertificate(LookupName),
    WaitingForDuplex(LookupName),
    Ping(LookupName),
    ProcessTransferOpRequest(TransferRequest),
    CancelTransferOpRequest(OpInfo),
    StopTransfer(StopInfo),
}

impl RpcRequest {
    pub fn name(&self) -> &'static str {
        match self {
            RpcRequest::RequestCertificate(_) => "RequestCertificate",
            RpcRequest::WaitingForDuplex(_) => "WaitingForDuplex",
            RpcRequest::Ping(_) => "Ping",
            RpcRequest::ProcessTransferOpRequest(_) => "ProcessTransferOpRequest",
            RpcRequest::CancelTransferOpRequest(_) => "CancelTransferOpRequest",
            RpcRequest::StopTransfer(_) => "StopTransfer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
    /// Base64 secretbox-sealed certificate.
    Certificate(String),
    Ack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    NotFound,
    InvalidArgument,
    FailedPrecondition,
    PermissionDenied,
    Unavailable,
    DeadlineExceeded,
    Cancelled,
    Internal,
}

/// Error as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: StatusCode,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FailedPrecondition, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("peer unavailable: {0}")]
    Unavailable(String),
    #[error("peer presented a certificate that does not match the pinned one")]
    UntrustedCertificate,
    #[error("call timed out")]
    Timeout,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("remote error: {0}")]
    Remote(RpcStatus),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("channel closed")]
    Closed,
}

impl From<RpcStatus> for RpcError {
    fn from(status: RpcStatus) -> Self {
        match status.code {
            StatusCode::NotFound => RpcError::NotFound(status.message),
            StatusCode::DeadlineExceeded => RpcError::Timeout,
            StatusCode::Unavailable => RpcError::Unavailable(status.message),
            _ => RpcError::Remote(status),
        }
    }
}

impl From<bincode::Error> for RpcError {
    fn from(err: bincode::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

/// Frames of a server-streaming response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamFrame {
    Chunk(Chunk),
    End,
    Error(RpcStatus),
}

/// Connectivity of a channel, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk, RpcError>> + Send>>;

/// Client half of a connection to one peer.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    async fn unary(&self, request: RpcRequest) -> Result<RpcResponse, RpcError>;

    async fn start_transfer(&self, op: OpInfo) -> Result<ChunkStream, RpcError>;

    fn connectivity(&self) -> watch::Receiver<Connectivity>;

    fn close(&self);
}

/// Facts the transport knows about an inbound call.
#[derive(Debug, Clone, Copy)]
pub struct CallContext {
    /// Address the caller listens on.
    pub remote_addr: SocketAddr,
}

/// Producer side of a `StartTransfer` stream.
///
/// The transport pulls with [`OutboundChunks::next`] and calls
/// [`OutboundChunks::ack`] after each item has been written out, which frees a
/// slot in the sender's [`FlowController`].
pub struct OutboundChunks {
    receiver: mpsc::Receiver<Result<Chunk, RpcStatus>>,
    flow: Arc<FlowController>,
}

impl OutboundChunks {
    pub fn new(receiver: mpsc::Receiver<Result<Chunk, RpcStatus>>, flow: Arc<FlowController>) -> Self {
        Self { receiver, flow }
    }

    pub async fn next(&mut self) -> Option<Result<Chunk, RpcStatus>> {
        self.receiver.recv().await
    }

    pub fn ack(&self) {
        self.flow.notify_completed();
    }
}

impl Drop for OutboundChunks {
    fn drop(&mut self) {
        // Unblocks a producer parked on a slot once nobody is reading.
        self.flow.close();
    }
}

#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle_unary(&self, ctx: CallContext, request: RpcRequest) -> Result<RpcResponse, RpcStatus>;

    async fn handle_start_transfer(&self, ctx: CallContext, op: OpInfo) -> Result<OutboundChunks, RpcStatus>;
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start serving `handler` with `certificate`. Returns the bound address.
    async fn serve(
        &self,
        handler: Arc<dyn RpcHandler>,
        certificate: &LocalCertificate,
    ) -> Result<SocketAddr, RpcError>;

    /// Open a channel. Without `pinned` any server certificate is accepted, which
    /// is only good enough for the certificate exchange itself.
    async fn connect(
        &self,
        addr: SocketAddr,
        pinned: Option<Vec<u8>>,
    ) -> Result<Arc<dyn RpcChannel>, RpcError>;

    /// Present a new certificate to callers from now on.
    async fn update_certificate(&self, certificate: &LocalCertificate) -> Result<(), RpcError>;

    fn local_addr(&self) -> Option<SocketAddr>;

    async fn shutdown(&self);
}

/// Typed wrapper over an [`RpcChannel`].
#[derive(Clone)]
pub struct RpcClient {
    channel: Arc<dyn RpcChannel>,
}

impl RpcClient {
    pub fn new(channel: Arc<dyn RpcChannel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Arc<dyn RpcChannel> {
        &self.channel
    }

    async fn expect_ack(&self, request: RpcRequest) -> Result<(), RpcError> {
        match self.channel.unary(request).await? {
            RpcResponse::Ack => Ok(()),
            other => Err(RpcError::Codec(format!("expected Ack, got {:?}", other))),
        }
    }

    pub async fn request_certificate(&self, requester: LookupName) -> Result<String, RpcError> {
        match self.channel.unary(RpcRequest::RequestCertificate(requester)).await? {
            RpcResponse::Certificate(locked) => Ok(locked),
            other => Err(RpcError::Codec(format!("expected Certificate, got {:?}", other))),
        }
    }

    /// Ask the peer to confirm it can reach us, waiting at most `timeout`.
    pub async fn waiting_for_duplex(&self, me: LookupName, timeout: Duration) -> Result<(), RpcError> {
        tokio::time::timeout(timeout, self.expect_ack(RpcRequest::WaitingForDuplex(me)))
            .await
            .map_err(|_| RpcError::Timeout)?
    }

    pub async fn ping(&self, me: LookupName, timeout: Duration) -> Result<(), RpcError> {
        tokio::time::timeout(timeout, self.expect_ack(RpcRequest::Ping(me)))
            .await
            .map_err(|_| RpcError::Timeout)?
    }

    pub async fn process_transfer_op_request(&self, request: TransferRequest) -> Result<(), RpcError> {
        self.expect_ack(RpcRequest::ProcessTransferOpRequest(request)).await
    }

    pub async fn cancel_transfer_op_request(&self, info: OpInfo) -> Result<(), RpcError> {
        self.expect_ack(RpcRequest::CancelTransferOpRequest(info)).await
    }

    pub async fn stop_transfer(&self, info: OpInfo, error: bool) -> Result<(), RpcError> {
        self.expect_ack(RpcRequest::StopTransfer(StopInfo { info, error })).await
    }

    pub async fn start_transfer(&self, info: OpInfo) -> Result<ChunkStream, RpcError> {
        self.channel.start_transfer(info).await
    }

    pub fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.channel.connectivity()
    }

    pub fn close(&self) {
        self.channel.close();
    }
}
