//! # lanwarp
//!
//! Peer-to-peer file transfer between machines on the same local network.
//!
//! Peers that share a group code trust each other: each hands out its TLS
//! certificate sealed with a key derived from the code, and every later call
//! runs over a channel pinned to that certificate. Files and directory trees
//! travel as an ordered stream of chunks, throttled by a small in-flight window
//! and checked on arrival so nothing is written outside the announced entries.
//!
//! ## Core Modules
//!
//! - [`crypto`] - Identity, group key and certificate exchange
//! - [`chunk`] - Turning files and directories into chunks
//! - [`downloader`] - Writing received chunks safely under the save directory
//! - [`backpressure`] - Flow control of in-flight chunks
//! - [`operation`] - Transfer state machine and metrics
//! - [`remote`] - One peer: connection lifecycle and transfers
//! - [`registry`] - All known peers
//! - [`rpc`] - Message model and transport seams
//! - [`servicer`] - Inbound RPC handlers
//! - [`transport`] - QUIC and in-memory transports
//! - [`discovery`] - Discovery feed and static peers
//! - [`node`] - A running node
//! - [`config`] - Configuration file
//! - [`cli`] - Command-line front end
//!
//! ## Quick Start
//!
//! ```bash
//! # Initialize lanwarp
//! lanwarp init
//!
//! # Receive files
//! lanwarp daemon --accept
//!
//! # Send a directory to a peer
//! lanwarp send laptop-1A2B3C4D ~/Pictures/holiday --address 192.168.1.20:42000
//! ```

pub mod backpressure;
pub mod chunk;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod downloader;
pub mod node;
pub mod operation;
pub mod registry;
pub mod remote;
pub mod rpc;
pub mod servicer;
pub mod transport;

pub use config::Config;
pub use crypto::Identity;
pub use node::{Node, NodeEvent};
