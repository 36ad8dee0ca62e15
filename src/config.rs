//! # Configuration Management
//!
//! lanwarp keeps its settings in a TOML file, `config.toml`, inside a
//! platform-appropriate directory (e.g. `~/.config/lanwarp/` on Linux). The
//! `LANWARP_CONFIG_DIR` environment variable points it elsewhere. The local
//! certificate and private key are stored next to the file.

use crate::crypto::Identity;
use crate::discovery::StaticPeer;
use crate::remote::RemoteSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_DIR_ENV: &str = "LANWARP_CONFIG_DIR";
const CONFIG_FILE: &str = "config.toml";

/// Settings of one lanwarp node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Suffix of the identity string, kept so configured peer lists stay valid across restarts.
    pub identity_suffix: String,
    pub display_name: String,
    pub listen_port: u16,
    pub group_code: String,
    pub save_directory: PathBuf,
    pub auto_accept: bool,
    pub allow_symlinks: bool,
    pub chunk_size: usize,
    pub cache_depth: u64,
    pub duplex_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub ping_interval_secs: u64,
    /// Peers announced without network discovery.
    pub peers: Vec<StaticPeer>,

    #[serde(skip)]
    pub config_file_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let save_directory = dirs::download_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lanwarp");

        Self {
            identity_suffix: String::new(),
            display_name: crate::crypto::local_hostname(),
            listen_port: 42000,
            group_code: "Warpinator".to_string(),
            save_directory,
            auto_accept: false,
            allow_symlinks: false,
            chunk_size: crate::chunk::DEFAULT_CHUNK_SIZE,
            cache_depth: crate::backpressure::DEFAULT_CACHE_DEPTH,
            duplex_timeout_secs: 5,
            connect_timeout_secs: 10,
            ping_interval_secs: 15,
            peers: Vec::new(),
            config_file_path: PathBuf::new(),
        }
    }
}

impl Config {
    /// Write a default configuration, replacing any existing one.
    pub async fn init() -> Result<Self> {
        let config_dir = Self::config_dir()?;
        tokio::fs::create_dir_all(&config_dir)
            .await
            .with_context(|| format!("Failed to create {}", config_dir.display()))?;

        let config = Self {
            identity_suffix: Identity::local().unique_suffix().to_string(),
            config_file_path: config_dir.join(CONFIG_FILE),
            ..Self::default()
        };
        config.save().await?;

        Ok(config)
    }

    pub async fn load() -> Result<Self> {
        Self::load_from(&Self::config_dir()?.join(CONFIG_FILE)).await
    }

    pub async fn load_from(config_file: &Path) -> Result<Self> {
        if !config_file.exists() {
            anyhow::bail!("lanwarp is not initialized. Run 'lanwarp init' first.");
        }

        let content = tokio::fs::read_to_string(config_file)
            .await
            .with_context(|| format!("Failed to read {}", config_file.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid configuration in {}", config_file.display()))?;
        config.config_file_path = config_file.to_path_buf();
        config.validate()?;

        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&self.config_file_path, content)
            .await
            .with_context(|| format!("Failed to write {}", self.config_file_path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_code.trim().is_empty() {
            anyhow::bail!("group_code must not be empty");
        }
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be positive");
        }
        if self.cache_depth == 0 {
            anyhow::bail!("cache_depth must be positive");
        }
        Ok(())
    }

    /// The identity of a node run from this configuration.
    pub fn identity(&self) -> Identity {
        if self.identity_suffix.is_empty() {
            Identity::local().clone()
        } else {
            Identity::new(crate::crypto::local_hostname(), self.identity_suffix.clone())
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    /// Directory holding `certificate.der` and `private_key.der`.
    pub fn certificate_dir(&self) -> PathBuf {
        self.config_file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn to_settings(&self) -> RemoteSettings {
        RemoteSettings {
            display_name: self.display_name.clone(),
            save_directory: self.save_directory.clone(),
            allow_symlinks: self.allow_symlinks,
            auto_accept: self.auto_accept,
            chunk_size: self.chunk_size,
            cache_depth: self.cache_depth,
            duplex_timeout: Duration::from_secs(self.duplex_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
        }
    }

    pub fn config_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
            return Ok(PathBuf::from(dir));
        }

        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("lanwarp");
        Ok(config_dir)
    }
}
