//! # Command Line Interface
//!
//! Argument parsing and command implementations for the `lanwarp` binary.
//!
//! ## Commands
//!
//! - `init` - Write a default configuration and generate the local certificate
//! - `id` - Display this node's identity and certificate fingerprint
//! - `group` - Switch to another group code
//! - `daemon` - Serve transfers until interrupted
//! - `send` - Send files or directories to a peer
//! - `peers` - Probe the configured peers

use crate::config::Config;
use crate::crypto::{GroupSecret, TrustStore};
use crate::discovery::{Peer, StaticDiscovery, StaticPeer};
use crate::node::{Node, NodeEvent};
use crate::operation::{Direction, TransferState};
use crate::remote::RemoteState;
use crate::transport::QuicTransport;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const REANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);
const PROBE_TIME: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "lanwarp")]
#[command(about = "Peer-to-peer file transfer for the local network")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default configuration and generate the local certificate
    Init,

    /// Display this node's identity
    Id,

    /// Switch to another group code; only peers using the same code are trusted
    Group {
        code: String,
    },

    /// Serve transfers until interrupted
    Daemon {
        /// Accept every incoming transfer
        #[arg(long)]
        accept: bool,
    },

    /// Send files or directories to a peer
    Send {
        /// Identity of the receiving peer
        peer: String,
        /// Files or directories to send
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Address of the peer, when it is not in the configured peer list
        #[arg(short, long)]
        address: Option<String>,
    },

    /// Probe the configured peers
    Peers,
}

fn open_trust_store(config: &Config) -> Result<TrustStore> {
    TrustStore::new(
        config.identity(),
        &GroupSecret::new(config.group_code.clone()),
        Some(config.certificate_dir()),
    )
    .context("Failed to open the trust store")
}

async fn start_node(config: &Config, port: u16) -> Result<Node> {
    let trust = Arc::new(open_trust_store(config)?);
    let transport = Arc::new(QuicTransport::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?);
    Node::start(trust, transport, config.to_settings()).await
}

fn find_peer(config: &Config, id: &str, address: Option<String>) -> Result<Peer> {
    let configured = match address {
        Some(address) => StaticPeer {
            id: id.to_string(),
            address,
        },
        None => config
            .peers
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .with_context(|| format!("Peer {} is not configured; pass --address host:port", id))?,
    };

    configured
        .to_peer()
        .with_context(|| format!("Invalid address {:?} for {}", configured.address, id))
}

pub async fn init() -> Result<()> {
    info!("Initializing lanwarp...");

    let config = Config::init().await?;
    info!("Configuration initialized at: {}", config.config_path().display());

    let trust = open_trust_store(&config)?;

    println!("{}", "✅ lanwarp initialized successfully!".green().bold());
    println!("Identity: {}", trust.identity().to_string().cyan());
    println!("Config: {}", config.config_path().display());
    println!("Save directory: {}", config.save_directory.display());

    Ok(())
}

pub async fn show_id() -> Result<()> {
    let config = Config::load().await?;
    let trust = open_trust_store(&config)?;

    println!("{}", trust.identity());
    println!("Certificate: {}", trust.certificate().fingerprint().dimmed());
    Ok(())
}

pub async fn set_group(code: String) -> Result<()> {
    let group = GroupSecret::new(code.clone());
    group
        .derive_group_key()
        .context("The group code cannot be used")?;

    let mut config = Config::load().await?;
    let trust = open_trust_store(&config)?;
    let certificate = trust.set_group_secret(&group)?;

    config.group_code = code;
    config.save().await?;

    println!("{}", "✅ Group changed".green().bold());
    println!("New certificate: {}", certificate.fingerprint().dimmed());
    println!("Peers must use the same group code to connect to this node.");
    Ok(())
}

pub async fn run_daemon(accept: bool) -> Result<()> {
    info!("Starting lanwarp daemon...");

    let mut config = Config::load().await?;
    config.auto_accept |= accept;
    tokio::fs::create_dir_all(&config.save_directory)
        .await
        .with_context(|| format!("Failed to create {}", config.save_directory.display()))?;

    let node = start_node(&config, config.listen_port).await?;
    let mut events = node.events();

    println!("{}", "🚀 lanwarp daemon running".green().bold());
    println!("Identity: {}", node.identity().cyan());
    println!("Listening on: {}", node.local_addr());
    println!("Saving to: {}", config.save_directory.display());
    if !config.auto_accept {
        println!(
            "{}",
            "Incoming transfers are not accepted automatically; restart with --accept to receive files."
                .yellow()
        );
    }

    let discovery = StaticDiscovery::new(config.peers.clone());
    let announcer = discovery.spawn(node.discovery_sender(), REANNOUNCE_INTERVAL);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Missed {} events", missed);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    println!("\n{}", "🛑 lanwarp daemon stopping...".yellow());
    announcer.abort();
    node.shutdown().await;
    Ok(())
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

fn print_event(event: &NodeEvent) {
    match event {
        NodeEvent::RemoteStateChanged { id, state } => {
            println!("[{}] {} {}", timestamp(), id.cyan(), color_state(*state));
        }
        NodeEvent::IncomingTransfer {
            peer_id,
            title,
            size,
            count,
            ..
        } => {
            println!(
                "[{}] {} offers {} ({}, {} entries)",
                timestamp(),
                peer_id.cyan(),
                title.bold(),
                format_bytes(*size),
                count
            );
        }
        NodeEvent::TransferStateChanged {
            peer_id,
            transfer_id,
            direction,
            state,
        } => {
            let arrow = match direction {
                Direction::Upload => "→",
                Direction::Download => "←",
            };
            println!(
                "[{}] {} {} #{}: {}",
                timestamp(),
                arrow,
                peer_id.cyan(),
                transfer_id,
                color_transfer_state(state)
            );
        }
    }
}

fn color_state(state: RemoteState) -> ColoredString {
    let text = state.to_string();
    match state {
        RemoteState::Online => text.green(),
        RemoteState::Failure => text.red(),
        RemoteState::MdnsOffline => text.dimmed(),
        _ => text.yellow(),
    }
}

fn color_transfer_state(state: &TransferState) -> ColoredString {
    let text = state.to_string();
    match state {
        TransferState::Completed => text.green(),
        TransferState::Failed(_) => text.red(),
        s if s.is_canceled() => text.yellow(),
        _ => text.normal(),
    }
}

pub async fn send_files(peer_id: String, paths: Vec<PathBuf>, address: Option<String>) -> Result<()> {
    for path in &paths {
        if !path.exists() {
            anyhow::bail!("Path does not exist: {}", path.display());
        }
    }

    let config = Config::load().await?;
    let peer = find_peer(&config, &peer_id, address)?;
    let connect_timeout = Duration::from_secs(config.connect_timeout_secs);

    let node = start_node(&config, 0).await?;
    let mut events = node.events();
    node.discover(peer).await?;

    println!("Connecting to {}...", peer_id.cyan());
    node.wait_online(&peer_id, connect_timeout).await?;

    let transfer_id = node.send_files(&peer_id, paths).await?;
    let total = node
        .transfer(&peer_id, Direction::Upload, transfer_id)
        .map(|op| op.total_size)
        .unwrap_or_default();
    println!("Waiting for {} to accept...", peer_id.cyan());

    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:40}] {bytes}/{total_bytes} {bytes_per_sec} {msg}")?
            .progress_chars("=> "),
    );

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let outcome = loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                node.cancel(&peer_id, transfer_id)?;
            }
            event = events.recv() => {
                if let Err(tokio::sync::broadcast::error::RecvError::Closed) = event {
                    break None;
                }
            }
        }

        let Some(op) = node.transfer(&peer_id, Direction::Upload, transfer_id) else {
            break None;
        };
        bar.set_position(op.metrics().bytes_transferred);
        bar.set_message(op.state().to_string());
        if op.state().is_terminal() {
            break Some(op);
        }
    };

    bar.finish_and_clear();
    node.shutdown().await;

    let Some(op) = outcome else {
        anyhow::bail!("Transfer {} disappeared", transfer_id);
    };
    match op.state() {
        TransferState::Completed => {
            println!(
                "{} Sent {} ({}) in {:.1}s",
                "✅".green(),
                op.title.bold(),
                format_bytes(op.total_size),
                op.metrics().elapsed().as_secs_f64()
            );
            Ok(())
        }
        TransferState::Failed(reason) => anyhow::bail!("Transfer failed: {}", reason),
        other => anyhow::bail!("Transfer ended: {}", other),
    }
}

pub async fn show_peers() -> Result<()> {
    let config = Config::load().await?;
    if config.peers.is_empty() {
        println!("No peers configured.");
        println!("💡 Add peers to {} as:", config.config_path().display());
        println!("   [[peers]]\n   id = \"HOSTNAME-SUFFIX\"\n   address = \"192.168.1.20:42000\"");
        return Ok(());
    }

    let node = start_node(&config, 0).await?;
    StaticDiscovery::new(config.peers.clone())
        .announce(&node.discovery_sender())
        .await;

    println!("🌐 Probing {} peer(s)...\n", config.peers.len());
    tokio::time::sleep(PROBE_TIME).await;

    for (i, peer) in node.peers().iter().enumerate() {
        println!("{}. 📡 {}", i + 1, peer.id.cyan());
        println!("   Address: {}", peer.address.as_deref().unwrap_or("unknown"));
        println!("   Status: {}", color_state(peer.state));
        println!();
    }

    node.shutdown().await;
    Ok(())
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_with_peer() -> (Config, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            peers: vec![StaticPeer {
                id: "desk-0000AAAA".into(),
                address: "10.0.0.2:42000".into(),
            }],
            config_file_path: temp_dir.path().join("config.toml"),
            ..Config::default()
        };
        (config, temp_dir)
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn test_find_peer() {
        let (config, _dir) = config_with_peer();

        let peer = find_peer(&config, "desk-0000AAAA", None).unwrap();
        assert_eq!(peer, Peer::new("desk-0000AAAA", "10.0.0.2", 42000));

        let explicit = find_peer(&config, "other", Some("10.0.0.3:42001".into())).unwrap();
        assert_eq!(explicit.port, 42001);

        assert!(find_peer(&config, "unknown", None).is_err());
        assert!(find_peer(&config, "other", Some("nonsense".into())).is_err());
    }

    #[tokio::test]
    async fn test_send_missing_path() {
        let result = send_files(
            "peer".into(),
            vec![PathBuf::from("/nonexistent/path/that/does/not/exist")],
            None,
        )
        .await;

        let error_msg = result.unwrap_err().to_string();
        assert!(error_msg.contains("Path does not exist"));
    }

    #[test]
    fn test_cli_parser() {
        let cli = Cli::try_parse_from(["lanwarp", "init"]).unwrap();
        assert!(matches!(cli.command, Commands::Init));

        let cli = Cli::try_parse_from(["lanwarp", "group", "secret"]).unwrap();
        assert!(matches!(cli.command, Commands::Group { code } if code == "secret"));

        let cli = Cli::try_parse_from(["lanwarp", "daemon", "--accept"]).unwrap();
        assert!(matches!(cli.command, Commands::Daemon { accept: true }));

        let cli = Cli::try_parse_from(["lanwarp", "send", "desk-1", "a.txt", "dir", "-a", "10.0.0.2:42000"])
            .unwrap();
        match cli.command {
            Commands::Send { peer, paths, address } => {
                assert_eq!(peer, "desk-1");
                assert_eq!(paths, vec![PathBuf::from("a.txt"), PathBuf::from("dir")]);
                assert_eq!(address.as_deref(), Some("10.0.0.2:42000"));
            }
            _ => panic!("Wrong command parsed"),
        }
    }

    #[test]
    fn test_cli_invalid_arguments() {
        assert!(Cli::try_parse_from(["lanwarp", "send", "desk-1"]).is_err());
        assert!(Cli::try_parse_from(["lanwarp", "group"]).is_err());
        assert!(Cli::try_parse_from(["lanwarp", "unknown"]).is_err());
    }
}
