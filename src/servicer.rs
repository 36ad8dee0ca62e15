//! # RPC Servicer
//!
//! Server side of the RPC surface. Every call is routed to the [`Remote`] named
//! by the caller's identity; calls naming a peer this node has never seen are
//! answered with `NotFound`. `StartTransfer` hands out file contents, so it is
//! also refused unless it comes from the IP the named peer is known at.

use crate::crypto::TrustStore;
use crate::downloader::sanitize_top_dir_name;
use crate::registry::PeerRegistry;
use crate::remote::Remote;
use crate::rpc::{
    CallContext, OpInfo, OutboundChunks, RpcError, RpcHandler, RpcRequest, RpcResponse, RpcStatus,
    StatusCode, TransferRequest,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct RpcServicer {
    registry: Arc<PeerRegistry>,
    trust: Arc<TrustStore>,
    duplex_timeout: Duration,
}

impl RpcServicer {
    pub fn new(registry: Arc<PeerRegistry>, trust: Arc<TrustStore>, duplex_timeout: Duration) -> Self {
        Self {
            registry,
            trust,
            duplex_timeout,
        }
    }

    fn remote(&self, id: &str) -> Result<Arc<Remote>, RpcStatus> {
        self.registry
            .get(id)
            .ok_or_else(|| RpcStatus::not_found(format!("unknown peer {}", id)))
    }
}

fn status_from_error(err: RpcError) -> RpcStatus {
    match err {
        RpcError::Timeout => RpcStatus::new(StatusCode::DeadlineExceeded, "timed out"),
        RpcError::NotFound(message) => RpcStatus::not_found(message),
        RpcError::InvalidState(message) => RpcStatus::failed_precondition(message),
        RpcError::Remote(status) => status,
        other => RpcStatus::new(StatusCode::Unavailable, other.to_string()),
    }
}

/// Top-level names must be unique single path components.
fn validate_request(request: &TransferRequest) -> Result<(), RpcStatus> {
    if request.top_dir_basenames.is_empty() {
        return Err(RpcStatus::new(StatusCode::InvalidArgument, "transfer has no entries"));
    }

    let mut seen = HashSet::new();
    for name in &request.top_dir_basenames {
        let name = sanitize_top_dir_name(name)
            .map_err(|e| RpcStatus::new(StatusCode::InvalidArgument, e.to_string()))?;
        if !seen.insert(name) {
            return Err(RpcStatus::new(
                StatusCode::InvalidArgument,
                "duplicate top-level entry name",
            ));
        }
    }
    Ok(())
}

#[async_trait]
impl RpcHandler for RpcServicer {
    async fn handle_unary(&self, ctx: CallContext, request: RpcRequest) -> Result<RpcResponse, RpcStatus> {
        debug!("{} from {}", request.name(), ctx.remote_addr);

        match request {
            RpcRequest::RequestCertificate(requester) => {
                self.registry.observe_requester(&requester, ctx.remote_addr);
                let locked = self
                    .trust
                    .locked_certificate()
                    .map_err(|e| RpcStatus::internal(e.to_string()))?;
                Ok(RpcResponse::Certificate(locked))
            }
            RpcRequest::WaitingForDuplex(peer) => {
                self.registry
                    .wait_for_duplex(&peer.id, self.duplex_timeout)
                    .await
                    .map_err(status_from_error)?;
                Ok(RpcResponse::Ack)
            }
            RpcRequest::Ping(peer) => {
                self.remote(&peer.id)?;
                Ok(RpcResponse::Ack)
            }
            RpcRequest::ProcessTransferOpRequest(request) => {
                let remote = self.remote(&request.sender_id)?;
                if let Err(status) = validate_request(&request) {
                    warn!(
                        target: "lanwarp::security",
                        "Rejected transfer request {} from {}: {}",
                        request.transfer_id, request.sender_id, status
                    );
                    return Err(status);
                }
                remote.register_incoming(&request);
                Ok(RpcResponse::Ack)
            }
            RpcRequest::CancelTransferOpRequest(OpInfo { ident, transfer_id, .. }) => {
                self.remote(&ident)?.on_request_cancelled(transfer_id)?;
                Ok(RpcResponse::Ack)
            }
            RpcRequest::StopTransfer(stop) => {
                self.remote(&stop.info.ident)?
                    .on_transfer_stopped(stop.info.transfer_id, stop.error)?;
                Ok(RpcResponse::Ack)
            }
        }
    }

    async fn handle_start_transfer(&self, ctx: CallContext, op: OpInfo) -> Result<OutboundChunks, RpcStatus> {
        debug!("StartTransfer {} from {}", op.transfer_id, ctx.remote_addr);
        let remote = self.remote(&op.ident)?;

        // Only the peer itself may pull an upload meant for it.
        let caller = ctx.remote_addr.ip();
        if remote.known_ip() != Some(caller) {
            warn!(
                target: "lanwarp::security",
                "StartTransfer {} for {} came from {}", op.transfer_id, op.ident, caller
            );
            return Err(RpcStatus::new(
                StatusCode::PermissionDenied,
                format!("{} is not known at {}", op.ident, caller),
            ));
        }

        remote.start_outgoing(op.transfer_id)
    }
}
