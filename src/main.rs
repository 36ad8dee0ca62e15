//! # lanwarp CLI Application
//!
//! Main entry point for the lanwarp peer-to-peer file transfer utility.

use anyhow::Result;
use clap::Parser;
use colored::*;
use lanwarp::cli::{self, Cli, Commands};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lanwarp=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(e) = match cli.command {
        Commands::Init => cli::init().await,
        Commands::Id => cli::show_id().await,
        Commands::Group { code } => cli::set_group(code).await,
        Commands::Daemon { accept } => cli::run_daemon(accept).await,
        Commands::Send { peer, paths, address } => cli::send_files(peer, paths, address).await,
        Commands::Peers => cli::show_peers().await,
    } {
        eprintln!(
            "{} {:#}\n{}",
            "Error:".red().bold(),
            e,
            "Tip: Run with --help for usage information.".yellow()
        );
        std::process::exit(1);
    }
    Ok(())
}
