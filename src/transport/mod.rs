//! Concrete [`Transport`](crate::rpc::Transport) implementations.
//!
//! - [`quic`]: QUIC with TLS 1.3, server certificates pinned per peer
//! - [`memory`]: in-process network for tests and embedding

pub mod memory;
pub mod quic;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use quic::QuicTransport;
