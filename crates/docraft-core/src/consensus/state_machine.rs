//! State machine driven by committed log entries

use super::Index;
use crate::documents::{DocumentsStorage, Etag};
use crate::{Error, Result};
use heed::{RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Receives committed commands, in log order, inside the committing
/// transaction
pub trait StateMachine: Send + Sync {
    /// Apply the command at `index`
    fn apply(&self, txn: &mut RwTxn, index: Index, payload: &[u8]) -> Result<()>;

    /// Storage was replaced by a snapshot; rebuild derived in-memory state
    fn on_snapshot_installed(&self, txn: &RoTxn) -> Result<()> {
        let _ = txn;
        Ok(())
    }
}

/// Command carried by a log entry for the document store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DocumentCommand {
    /// Store a document
    Put {
        /// Document key
        key: String,
        /// Optimistic concurrency check
        expected_etag: Option<Etag>,
        /// Document body
        document: Value,
    },
    /// Remove a document
    Delete {
        /// Document key
        key: String,
        /// Optimistic concurrency check
        expected_etag: Option<Etag>,
    },
}

impl DocumentCommand {
    /// Encode as a log entry payload
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a log entry payload
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Applies [`DocumentCommand`]s to document storage
pub struct DocumentsStateMachine {
    documents: Arc<DocumentsStorage>,
}

impl DocumentsStateMachine {
    /// Drive `documents`
    pub fn new(documents: Arc<DocumentsStorage>) -> Self {
        Self { documents }
    }

    /// Document storage
    pub fn documents(&self) -> &Arc<DocumentsStorage> {
        &self.documents
    }
}

impl StateMachine for DocumentsStateMachine {
    fn apply(&self, txn: &mut RwTxn, index: Index, payload: &[u8]) -> Result<()> {
        let command = DocumentCommand::from_payload(payload)?;
        let result = match &command {
            DocumentCommand::Put {
                key,
                expected_etag,
                document,
            } => self
                .documents
                .put(txn, key, *expected_etag, document)
                .map(|_| ()),
            DocumentCommand::Delete { key, expected_etag } => {
                self.documents.delete(txn, key, *expected_etag).map(|_| ())
            }
        };

        match result {
            // Rejected before any write, identically on every replica
            Err(Error::Concurrency(msg)) | Err(Error::InvalidArgument(msg)) => {
                tracing::warn!("Skipping command at index {}: {}", index, msg);
                Ok(())
            }
            other => other,
        }
    }

    fn on_snapshot_installed(&self, txn: &RoTxn) -> Result<()> {
        let last = self.documents.reload_last_etag(txn)?;
        tracing::info!("Snapshot installed, last document etag is now {}", last);
        Ok(())
    }
}
