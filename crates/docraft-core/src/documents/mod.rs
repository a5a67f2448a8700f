//! Document storage
//!
//! Documents are JSON values addressed by a case-insensitive key. Each
//! document belongs to a collection (`@metadata.@collection`, `@empty` when
//! absent) and every collection is backed by its own table:
//!
//! ```text
//! @doc-keys          lowered key -> collection table name
//! @doc-etags         "LastEtag" -> highest etag handed out (u64 BE)
//! @docs/<collection> [lowered key, etag, original key, json]
//!                    CollectionEtags: per-table index on etag
//!                    AllDocsEtags:    global index on etag
//! ```
//!
//! Every put assigns a fresh etag from a node-local counter, persisted in
//! the same transaction so deleting the newest document never lets its
//! etag be handed out again. Writers may
//! pass the etag they last saw; a mismatch fails with
//! [`Error::Concurrency`](crate::Error::Concurrency) before anything is
//! written.

pub mod key;

pub use key::{KeyBufferPool, MAX_KEY_BYTES, validate_key};

use crate::storage::{RootObjectType, StorageEnvironment, Table, TableSchema, TableValue, Tree};
use crate::{Error, Result};
use heed::{RoTxn, RwTxn};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-document version stamp
pub type Etag = u64;

/// Metadata object inside a document
pub const METADATA: &str = "@metadata";
/// Collection property inside the metadata object
pub const COLLECTION: &str = "@collection";
/// Collection of documents without one
pub const EMPTY_COLLECTION: &str = "@empty";

/// Per-collection etag index
pub const COLLECTION_ETAGS_INDEX: &str = "CollectionEtags";
/// Etag index shared by all collections
pub const ALL_DOCS_ETAGS_INDEX: &str = "AllDocsEtags";

const KEYS_TREE: &str = "@doc-keys";
const ETAGS_TREE: &str = "@doc-etags";
const LAST_ETAG_KEY: &[u8] = b"LastEtag";
const COLLECTION_TABLE_PREFIX: &str = "@docs/";

const FIELD_LOWERED_KEY: usize = 0;
const FIELD_ETAG: usize = 1;
const FIELD_KEY: usize = 2;
const FIELD_DATA: usize = 3;

/// A stored document
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Key as originally written
    pub key: String,
    /// Current etag
    pub etag: Etag,
    /// Owning collection
    pub collection: String,
    /// Document body
    pub data: Value,
}

/// Schema shared by every collection table
pub fn documents_schema() -> TableSchema {
    TableSchema::new(FIELD_LOWERED_KEY)
        .define_fixed_size_index(COLLECTION_ETAGS_INDEX, FIELD_ETAG, false)
        .define_fixed_size_index(ALL_DOCS_ETAGS_INDEX, FIELD_ETAG, true)
}

/// Name of the table backing `collection`
pub fn collection_table_name(collection: &str) -> String {
    format!("{}{}", COLLECTION_TABLE_PREFIX, collection.to_lowercase())
}

/// Collection a document belongs to
pub fn collection_of(document: &Value) -> String {
    document
        .get(METADATA)
        .and_then(|metadata| metadata.get(COLLECTION))
        .and_then(Value::as_str)
        .filter(|name| !name.trim().is_empty())
        .unwrap_or(EMPTY_COLLECTION)
        .to_string()
}

/// Document storage over a storage environment
pub struct DocumentsStorage {
    storage: Arc<StorageEnvironment>,
    schema: TableSchema,
    last_etag: AtomicU64,
    key_buffers: KeyBufferPool,
}

impl DocumentsStorage {
    /// Open document storage, creating the key tree and the default
    /// collection when missing
    pub fn open(storage: Arc<StorageEnvironment>) -> Result<Self> {
        let documents = Self {
            storage,
            schema: documents_schema(),
            last_etag: AtomicU64::new(0),
            key_buffers: KeyBufferPool::new(),
        };

        let mut txn = documents.storage.write_txn()?;
        documents.storage.create_tree(&mut txn, KEYS_TREE)?;
        documents.storage.create_tree(&mut txn, ETAGS_TREE)?;
        documents.ensure_collection(&mut txn, EMPTY_COLLECTION)?;
        txn.commit()?;

        let txn = documents.storage.read_txn()?;
        let last = documents.reload_last_etag(&txn)?;
        drop(txn);

        tracing::debug!("Opened document storage, last etag {}", last);
        Ok(documents)
    }

    /// Underlying storage environment
    pub fn storage(&self) -> &Arc<StorageEnvironment> {
        &self.storage
    }

    /// Highest etag handed out so far
    pub fn last_etag(&self) -> Etag {
        self.last_etag.load(Ordering::SeqCst)
    }

    /// Re-read the etag counter from storage (after a snapshot replaced
    /// the tables). Never moves the counter below a value already
    /// persisted or stored in a document.
    pub fn reload_last_etag(&self, txn: &RoTxn) -> Result<Etag> {
        let indexed = self
            .storage
            .last_in_global_index(txn, ALL_DOCS_ETAGS_INDEX)?
            .unwrap_or(0);
        let last = indexed.max(self.persisted_last_etag(txn)?);
        self.last_etag.store(last, Ordering::SeqCst);
        Ok(last)
    }

    fn persisted_last_etag(&self, txn: &RoTxn) -> Result<Etag> {
        let Some(tree) = self.storage.open_tree(txn, ETAGS_TREE)? else {
            return Ok(0);
        };
        match tree.read(txn, LAST_ETAG_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    Error::storage(format!(
                        "Invalid last etag entry of {} bytes",
                        bytes.len()
                    ))
                })?;
                Ok(Etag::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    /// Create the table for `collection` if needed
    pub fn ensure_collection(&self, txn: &mut RwTxn, collection: &str) -> Result<Table> {
        self.storage
            .create_table(txn, &collection_table_name(collection), &self.schema)
    }

    /// Names of the tables backing collections
    pub fn collection_tables(&self, txn: &RoTxn) -> Result<Vec<String>> {
        Ok(self
            .storage
            .roots(txn)?
            .into_iter()
            .filter(|(name, kind)| {
                *kind == RootObjectType::Table && name.starts_with(COLLECTION_TABLE_PREFIX)
            })
            .map(|(name, _)| name)
            .collect())
    }

    /// Read a document
    pub fn get(&self, txn: &RoTxn, key: &str) -> Result<Option<Document>> {
        let mut buf = self.key_buffers.acquire();
        let lowered = buf.lower(key)?;
        match self.read_row(txn, lowered)? {
            Some((_, row)) => Ok(Some(document_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Store a document and return its new etag
    ///
    /// `expected_etag`: `None` skips the check, `Some(0)` accepts a missing
    /// document, anything else must equal the stored etag.
    pub fn put(
        &self,
        txn: &mut RwTxn,
        key: &str,
        expected_etag: Option<Etag>,
        document: &Value,
    ) -> Result<Etag> {
        let mut buf = self.key_buffers.acquire();
        let lowered = buf.lower(key)?;
        let data = serde_json::to_vec(document)?;
        let table_name = collection_table_name(&collection_of(document));

        let existing = self.read_row(txn, lowered)?;
        let current = match &existing {
            Some((_, row)) => Some(row.fixed_size_field(FIELD_ETAG)?),
            None => None,
        };
        match (expected_etag, current) {
            (None, _) | (Some(0), None) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (Some(expected), None) => {
                return Err(Error::concurrency(format!(
                    "Document '{}' does not exist, but put was called with etag {}",
                    key, expected
                )));
            }
            (Some(expected), Some(actual)) => {
                return Err(Error::concurrency(format!(
                    "Document '{}' has etag {}, but put was called with etag {}",
                    key, actual, expected
                )));
            }
        }

        // Moving between collections removes the old row
        if let Some((old_table, _)) = &existing {
            if old_table != &table_name {
                if let Some(table) = self.storage.open_table(txn, old_table)? {
                    table.delete_by_key(txn, lowered)?;
                }
            }
        }

        let table = self.storage.create_table(txn, &table_name, &self.schema)?;
        let etag = self.last_etag.fetch_add(1, Ordering::SeqCst) + 1;
        let row = TableValue::new(vec![
            lowered.to_vec(),
            etag.to_be_bytes().to_vec(),
            key.as_bytes().to_vec(),
            data,
        ]);
        table.set(txn, &row)?;
        self.keys_tree(txn)?.add(txn, lowered, table_name.as_bytes())?;
        self.storage
            .create_tree(txn, ETAGS_TREE)?
            .add(txn, LAST_ETAG_KEY, &etag.to_be_bytes())?;

        tracing::debug!("Put document '{}' in {} with etag {}", key, table_name, etag);
        Ok(etag)
    }

    /// Delete a document. Returns false when it did not exist.
    pub fn delete(&self, txn: &mut RwTxn, key: &str, expected_etag: Option<Etag>) -> Result<bool> {
        let mut buf = self.key_buffers.acquire();
        let lowered = buf.lower(key)?;

        let Some((table_name, row)) = self.read_row(txn, lowered)? else {
            if let Some(expected) = expected_etag {
                return Err(Error::concurrency(format!(
                    "Document '{}' does not exist, but delete was called with etag {}",
                    key, expected
                )));
            }
            return Ok(false);
        };

        let actual = row.fixed_size_field(FIELD_ETAG)?;
        if let Some(expected) = expected_etag {
            if expected != actual {
                return Err(Error::concurrency(format!(
                    "Document '{}' has etag {}, but delete was called with etag {}",
                    key, actual, expected
                )));
            }
        }

        if let Some(table) = self.storage.open_table(txn, &table_name)? {
            table.delete_by_key(txn, lowered)?;
        }
        self.keys_tree(txn)?.delete(txn, lowered)?;
        Ok(true)
    }

    /// Documents whose key starts with `prefix` (case-insensitive), in key
    /// order
    pub fn get_documents_starting_with(&self, txn: &RoTxn, prefix: &str) -> Result<Vec<Document>> {
        let mut buf = self.key_buffers.acquire();
        let lowered = buf.lower_prefix(prefix)?;

        let mut documents = Vec::new();
        for (key, table_name) in self.keys_tree(txn)?.prefix_entries(txn, lowered)? {
            let table_name = table_name_from_bytes(&table_name)?;
            let Some(table) = self.storage.open_table(txn, &table_name)? else {
                continue;
            };
            if let Some(row) = table.read_by_key(txn, &key)? {
                documents.push(document_from_row(&row)?);
            }
        }
        Ok(documents)
    }

    /// Documents of every collection with an etag strictly greater than
    /// `etag`, in etag order
    pub fn get_documents_after(&self, txn: &RoTxn, etag: Etag) -> Result<Vec<Document>> {
        self.storage
            .seek_global_index_after(txn, ALL_DOCS_ETAGS_INDEX, etag)?
            .iter()
            .map(|(_, row)| document_from_row(row))
            .collect()
    }

    /// Documents of `collection` with an etag strictly greater than `etag`,
    /// in etag order
    pub fn get_collection_documents_after(
        &self,
        txn: &RoTxn,
        collection: &str,
        etag: Etag,
    ) -> Result<Vec<Document>> {
        let Some(table) = self
            .storage
            .open_table(txn, &collection_table_name(collection))?
        else {
            return Ok(Vec::new());
        };
        table
            .seek_index_after(txn, COLLECTION_ETAGS_INDEX, etag)?
            .iter()
            .map(document_from_row)
            .collect()
    }

    fn keys_tree(&self, txn: &RoTxn) -> Result<Tree> {
        self.storage
            .open_tree(txn, KEYS_TREE)?
            .ok_or_else(|| Error::storage(format!("Missing document key tree '{}'", KEYS_TREE)))
    }

    /// Row and table name for a lowered key
    fn read_row(&self, txn: &RoTxn, lowered: &[u8]) -> Result<Option<(String, TableValue)>> {
        let Some(table_name) = self.keys_tree(txn)?.read(txn, lowered)? else {
            return Ok(None);
        };
        let table_name = table_name_from_bytes(&table_name)?;
        let Some(table) = self.storage.open_table(txn, &table_name)? else {
            return Ok(None);
        };
        Ok(table.read_by_key(txn, lowered)?.map(|row| (table_name, row)))
    }
}

fn table_name_from_bytes(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::storage(format!("Invalid collection table name: {}", e)))
}

fn document_from_row(row: &TableValue) -> Result<Document> {
    let key = String::from_utf8(row.field(FIELD_KEY)?.to_vec())
        .map_err(|e| Error::storage(format!("Invalid document key: {}", e)))?;
    let data: Value = serde_json::from_slice(row.field(FIELD_DATA)?)?;
    Ok(Document {
        key,
        etag: row.fixed_size_field(FIELD_ETAG)?,
        collection: collection_of(&data),
        data,
    })
}
