//! Variable-size trees: sorted byte key -> byte value collections

use crate::Result;
use heed::types::Bytes;
use heed::{Database, RoTxn, RwTxn};

/// Handle to an open tree. Cheap to create, holds no transaction.
pub struct Tree {
    name: String,
    db: Database<Bytes, Bytes>,
}

impl Tree {
    pub(crate) fn new(name: &str, db: Database<Bytes, Bytes>) -> Self {
        Self {
            name: name.to_string(),
            db,
        }
    }

    /// Tree name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert or overwrite `key`
    pub fn add(&self, txn: &mut RwTxn, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put(txn, key, value)?;
        Ok(())
    }

    /// Read the value stored under `key`
    pub fn read(&self, txn: &RoTxn, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(txn, key)?.map(<[u8]>::to_vec))
    }

    /// Remove `key`. Returns false when absent.
    pub fn delete(&self, txn: &mut RwTxn, key: &[u8]) -> Result<bool> {
        Ok(self.db.delete(txn, key)?)
    }

    /// Number of entries
    pub fn len(&self, txn: &RoTxn) -> Result<u64> {
        Ok(self.db.len(txn)?)
    }

    /// True when the tree holds no entries
    pub fn is_empty(&self, txn: &RoTxn) -> Result<bool> {
        Ok(self.db.is_empty(txn)?)
    }

    /// Remove every entry
    pub fn clear(&self, txn: &mut RwTxn) -> Result<()> {
        self.db.clear(txn)?;
        Ok(())
    }

    /// Visit every entry in key order
    pub fn for_each<F>(&self, txn: &RoTxn, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        for item in self.db.iter(txn)? {
            let (key, value) = item?;
            f(key, value)?;
        }
        Ok(())
    }

    /// Entries whose key starts with `prefix`, in key order
    pub fn prefix_entries(&self, txn: &RoTxn, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries = Vec::new();
        for item in self.db.prefix_iter(txn, prefix)? {
            let (key, value) = item?;
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    /// Collect every entry in key order
    pub fn entries(&self, txn: &RoTxn) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries = Vec::new();
        self.for_each(txn, |key, value| {
            entries.push((key.to_vec(), value.to_vec()));
            Ok(())
        })?;
        Ok(entries)
    }
}
