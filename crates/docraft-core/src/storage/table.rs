//! Schema-backed tables
//!
//! A row is a list of byte fields. One field is the primary key; any number
//! of fields can be declared as fixed-size indexes (exactly 8 bytes, read as
//! a big-endian `u64`). Global indexes are shared by every table that
//! declares them and remember which table a row lives in.

use crate::{Error, Result};
use heed::byteorder::BigEndian;
use heed::types::{Bytes, U64};
use heed::{Database, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use std::ops::Bound;

/// Maximum number of fields in a row
pub const MAX_FIELDS: usize = u16::MAX as usize;

/// Definition of a fixed-size (u64) index over one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedSizeIndexDef {
    /// Index name
    pub name: String,
    /// Indexed field position
    pub field: usize,
    /// Shared across all tables declaring it
    pub global: bool,
}

/// Table schema. Not part of the data: every replica must know the schema
/// of a table before rows can be loaded into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    primary_key: usize,
    indexes: Vec<FixedSizeIndexDef>,
}

impl TableSchema {
    /// Schema whose primary key is field `primary_key`
    pub fn new(primary_key: usize) -> Self {
        Self {
            primary_key,
            indexes: Vec::new(),
        }
    }

    /// Declare a fixed-size index
    pub fn define_fixed_size_index(
        mut self,
        name: impl Into<String>,
        field: usize,
        global: bool,
    ) -> Self {
        self.indexes.push(FixedSizeIndexDef {
            name: name.into(),
            field,
            global,
        });
        self
    }

    /// Primary key field position
    pub fn primary_key(&self) -> usize {
        self.primary_key
    }

    /// Declared indexes
    pub fn indexes(&self) -> &[FixedSizeIndexDef] {
        &self.indexes
    }
}

/// A table row
///
/// Encoded as `[field_count:2][len:4][bytes]...`, little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableValue {
    fields: Vec<Vec<u8>>,
}

impl TableValue {
    /// Build a row from its fields
    pub fn new(fields: Vec<Vec<u8>>) -> Self {
        Self { fields }
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when the row has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field at `index`
    pub fn field(&self, index: usize) -> Result<&[u8]> {
        self.fields
            .get(index)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::storage(format!("Row has no field {}", index)))
    }

    /// Fixed-size field at `index`, as a big-endian u64
    pub fn fixed_size_field(&self, index: usize) -> Result<u64> {
        let bytes = self.field(index)?;
        let array: [u8; 8] = bytes.try_into().map_err(|_| {
            Error::storage(format!(
                "Field {} is {} bytes, fixed-size fields must be 8 bytes",
                index,
                bytes.len()
            ))
        })?;
        Ok(u64::from_be_bytes(array))
    }

    /// Serialize the row
    pub fn to_bytes(&self) -> Vec<u8> {
        let size = 2 + self.fields.iter().map(|f| 4 + f.len()).sum::<usize>();
        let mut buf = Vec::with_capacity(size);
        buf.extend_from_slice(&(self.fields.len() as u16).to_le_bytes());
        for field in &self.fields {
            buf.extend_from_slice(&(field.len() as u32).to_le_bytes());
            buf.extend_from_slice(field);
        }
        buf
    }

    /// Deserialize a row, checking every length against the buffer
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut cursor = buf;
        let count = u16::from_le_bytes(take::<2>(&mut cursor)?) as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let len = u32::from_le_bytes(take::<4>(&mut cursor)?) as usize;
            if cursor.len() < len {
                return Err(Error::storage(format!(
                    "Truncated row: field of {} bytes, {} remaining",
                    len,
                    cursor.len()
                )));
            }
            let (field, rest) = cursor.split_at(len);
            fields.push(field.to_vec());
            cursor = rest;
        }
        if !cursor.is_empty() {
            return Err(Error::storage(format!(
                "Row has {} trailing bytes",
                cursor.len()
            )));
        }
        Ok(Self { fields })
    }
}

fn take<const N: usize>(cursor: &mut &[u8]) -> Result<[u8; N]> {
    if cursor.len() < N {
        return Err(Error::storage("Truncated row header"));
    }
    let (head, rest) = cursor.split_at(N);
    *cursor = rest;
    let mut out = [0u8; N];
    out.copy_from_slice(head);
    Ok(out)
}

/// Global index entries point back at `[name_len:2][table name][primary key]`
pub(crate) fn encode_global_ref(table: &str, key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + table.len() + key.len());
    buf.extend_from_slice(&(table.len() as u16).to_le_bytes());
    buf.extend_from_slice(table.as_bytes());
    buf.extend_from_slice(key);
    buf
}

pub(crate) fn decode_global_ref(buf: &[u8]) -> Result<(String, Vec<u8>)> {
    let mut cursor = buf;
    let len = u16::from_le_bytes(take::<2>(&mut cursor)?) as usize;
    if cursor.len() < len {
        return Err(Error::storage("Truncated global index reference"));
    }
    let (name, key) = cursor.split_at(len);
    let name = std::str::from_utf8(name)
        .map_err(|e| Error::storage(format!("Invalid table name in global index: {}", e)))?;
    Ok((name.to_string(), key.to_vec()))
}

/// Handle to an open table. Cheap to create, holds no transaction.
pub struct Table {
    name: String,
    schema: TableSchema,
    rows: Database<Bytes, Bytes>,
    indexes: Vec<(FixedSizeIndexDef, Database<U64<BigEndian>, Bytes>)>,
}

impl Table {
    pub(crate) fn new(
        name: &str,
        schema: TableSchema,
        rows: Database<Bytes, Bytes>,
        indexes: Vec<(FixedSizeIndexDef, Database<U64<BigEndian>, Bytes>)>,
    ) -> Self {
        Self {
            name: name.to_string(),
            schema,
            rows,
            indexes,
        }
    }

    /// Table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table schema
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Insert a new row. Fails if the primary key is already present.
    ///
    /// An index entry already holding the same value is repointed at this
    /// row. That only happens while a snapshot replaces tables that still
    /// carry rows from before it.
    pub fn insert(&self, txn: &mut RwTxn, value: &TableValue) -> Result<()> {
        let key = value.field(self.schema.primary_key)?;
        if self.rows.get(txn, key)?.is_some() {
            return Err(Error::storage(format!(
                "Duplicate primary key in table '{}'",
                self.name
            )));
        }

        self.rows.put(txn, key, &value.to_bytes())?;
        for (def, db) in &self.indexes {
            let indexed = value.fixed_size_field(def.field)?;
            db.put(txn, &indexed, &self.index_ref(def, key))?;
        }
        Ok(())
    }

    /// Insert or replace the row with the same primary key
    pub fn set(&self, txn: &mut RwTxn, value: &TableValue) -> Result<()> {
        let key = value.field(self.schema.primary_key)?;
        self.delete_by_key(txn, key)?;
        self.insert(txn, value)
    }

    /// Read a row by primary key
    pub fn read_by_key(&self, txn: &RoTxn, key: &[u8]) -> Result<Option<TableValue>> {
        self.rows
            .get(txn, key)?
            .map(TableValue::from_bytes)
            .transpose()
    }

    /// Delete a row and its index entries. Returns false when absent.
    pub fn delete_by_key(&self, txn: &mut RwTxn, key: &[u8]) -> Result<bool> {
        let Some(existing) = self.read_by_key(txn, key)? else {
            return Ok(false);
        };
        for (def, db) in &self.indexes {
            let indexed = existing.fixed_size_field(def.field)?;
            // Only drop the entry if it still points at this row
            let owned = db.get(txn, &indexed)? == Some(self.index_ref(def, key).as_slice());
            if owned {
                db.delete(txn, &indexed)?;
            }
        }
        self.rows.delete(txn, key)?;
        Ok(true)
    }

    fn index_ref(&self, def: &FixedSizeIndexDef, key: &[u8]) -> Vec<u8> {
        if def.global {
            encode_global_ref(&self.name, key)
        } else {
            key.to_vec()
        }
    }

    /// Primary key of the last row in key order
    pub fn last_key(&self, txn: &RoTxn) -> Result<Option<Vec<u8>>> {
        Ok(self.rows.last(txn)?.map(|(key, _)| key.to_vec()))
    }

    /// Number of rows
    pub fn number_of_entries(&self, txn: &RoTxn) -> Result<u64> {
        Ok(self.rows.len(txn)?)
    }

    /// Rows whose primary key starts with `prefix`, in key order
    pub fn seek_by_primary_key_prefix(&self, txn: &RoTxn, prefix: &[u8]) -> Result<Vec<TableValue>> {
        let mut rows = Vec::new();
        for item in self.rows.prefix_iter(txn, prefix)? {
            let (_, value) = item?;
            rows.push(TableValue::from_bytes(value)?);
        }
        Ok(rows)
    }

    /// Rows whose value in the per-table index `index_name` is strictly
    /// greater than `after`, in index order
    pub fn seek_index_after(&self, txn: &RoTxn, index_name: &str, after: u64) -> Result<Vec<TableValue>> {
        let (def, db) = self
            .indexes
            .iter()
            .find(|(def, _)| def.name == index_name)
            .ok_or_else(|| {
                Error::storage(format!(
                    "Table '{}' has no index '{}'",
                    self.name, index_name
                ))
            })?;
        if def.global {
            return Err(Error::storage(format!(
                "Index '{}' is global, seek it through the storage environment",
                index_name
            )));
        }

        let mut rows = Vec::new();
        let range = (Bound::Excluded(after), Bound::Unbounded);
        for item in db.range(txn, &range)? {
            let (_, key) = item?;
            if let Some(row) = self.read_by_key(txn, key)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Visit every encoded row in primary key order
    pub fn for_each_raw<F>(&self, txn: &RoTxn, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        for item in self.rows.iter(txn)? {
            let (_, value) = item?;
            f(value)?;
        }
        Ok(())
    }
}
