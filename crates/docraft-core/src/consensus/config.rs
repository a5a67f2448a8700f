//! Consensus configuration

use super::{DEFAULT_ADMISSION_TIMEOUT_MS, DEFAULT_ELECTION_TIMEOUT_MS, DEFAULT_KEEP_ALIVE_BATCH};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Consensus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// URL this node is known by in the topology
    pub url: String,

    /// Time without leader contact before this node becomes a candidate
    pub election_timeout: Duration,

    /// Snapshot items processed between keep-alive checks
    pub keep_alive_batch: u64,

    /// Time a new connection has to send its negotiation message
    pub admission_timeout: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            url: "tcp://127.0.0.1:15480".to_string(),
            election_timeout: Duration::from_millis(DEFAULT_ELECTION_TIMEOUT_MS),
            keep_alive_batch: DEFAULT_KEEP_ALIVE_BATCH,
            admission_timeout: Duration::from_millis(DEFAULT_ADMISSION_TIMEOUT_MS),
        }
    }
}

impl ConsensusConfig {
    /// Configuration for the node reachable at `url`
    pub fn node(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the election timeout
    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    /// Set the keep-alive batch size
    pub fn with_keep_alive_batch(mut self, batch: u64) -> Self {
        self.keep_alive_batch = batch;
        self
    }

    /// Set the admission timeout
    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = timeout;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.url.trim().is_empty() {
            return Err("url must not be empty".into());
        }

        if self.election_timeout.is_zero() {
            return Err("election_timeout must be greater than zero".into());
        }

        if self.keep_alive_batch == 0 {
            return Err("keep_alive_batch must be at least 1".into());
        }

        if self.admission_timeout.is_zero() {
            return Err("admission_timeout must be greater than zero".into());
        }

        Ok(())
    }
}
