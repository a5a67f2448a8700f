//! Server configuration
//!
//! Priority: environment variables > config file > defaults

use anyhow::Context;
use docraft_core::consensus::{
    ConsensusConfig, DEFAULT_ADMISSION_TIMEOUT_MS, DEFAULT_ELECTION_TIMEOUT_MS, DEFAULT_KEEP_ALIVE_BATCH,
};
use docraft_core::storage::StorageConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address leaders connect to
    pub addr: SocketAddr,
    /// Data directory
    pub data_dir: PathBuf,
    /// Url this node is known by in the cluster topology
    pub url: String,
    /// Election timeout in milliseconds
    pub election_timeout_ms: u64,
    /// Snapshot items between keep-alive checks
    pub keep_alive_batch: u64,
    /// Time a new connection has to send its first message, in milliseconds
    pub admission_timeout_ms: u64,
    /// LMDB map size in bytes
    pub map_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 15480)),
            data_dir: PathBuf::from("./data"),
            url: "tcp://127.0.0.1:15480".to_string(),
            election_timeout_ms: DEFAULT_ELECTION_TIMEOUT_MS,
            keep_alive_batch: DEFAULT_KEEP_ALIVE_BATCH,
            admission_timeout_ms: DEFAULT_ADMISSION_TIMEOUT_MS,
            map_size: StorageConfig::default().map_size,
        }
    }
}

impl Config {
    /// Load defaults, then `file` if given, then the process environment
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Override settings from `DOCRAFT_*` variables looked up by `var`
    pub fn apply_env<F>(&mut self, var: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = var("DOCRAFT_ADDR") {
            self.addr = addr
                .parse()
                .with_context(|| format!("Invalid DOCRAFT_ADDR: {}", addr))?;
        }
        if let Some(data_dir) = var("DOCRAFT_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }
        if let Some(url) = var("DOCRAFT_URL") {
            self.url = url;
        }
        if let Some(timeout) = var("DOCRAFT_ELECTION_TIMEOUT_MS") {
            self.election_timeout_ms = timeout
                .parse()
                .with_context(|| format!("Invalid DOCRAFT_ELECTION_TIMEOUT_MS: {}", timeout))?;
        }
        if let Some(timeout) = var("DOCRAFT_ADMISSION_TIMEOUT_MS") {
            self.admission_timeout_ms = timeout
                .parse()
                .with_context(|| format!("Invalid DOCRAFT_ADMISSION_TIMEOUT_MS: {}", timeout))?;
        }
        if let Some(map_size) = var("DOCRAFT_MAP_SIZE") {
            self.map_size = map_size
                .parse()
                .with_context(|| format!("Invalid DOCRAFT_MAP_SIZE: {}", map_size))?;
        }
        Ok(())
    }

    /// Check the consensus settings
    pub fn validate(&self) -> anyhow::Result<()> {
        self.consensus()
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))
    }

    /// Consensus settings
    pub fn consensus(&self) -> ConsensusConfig {
        ConsensusConfig::node(self.url.clone())
            .with_election_timeout(Duration::from_millis(self.election_timeout_ms))
            .with_keep_alive_batch(self.keep_alive_batch)
            .with_admission_timeout(Duration::from_millis(self.admission_timeout_ms))
    }

    /// Storage settings
    pub fn storage(&self) -> StorageConfig {
        StorageConfig::at(&self.data_dir).with_map_size(self.map_size)
    }
}
