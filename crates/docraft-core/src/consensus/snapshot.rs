//! Snapshot streams
//!
//! A snapshot is a raw byte stream that follows the `InstallSnapshot`
//! message. All integers are little-endian:
//!
//! ```text
//! stream  := NOOP | object* NONE
//! NOOP    := i32(-1)                          nothing to install
//! NONE    := i32(0)
//! object  := i32(1) name i64(count) (bytes bytes){count}   tree
//!          | i32(2) name i64(count) bytes{count}           table rows
//! name    := bytes (UTF-8)
//! bytes   := i32(len) u8{len}
//! ```
//!
//! Table schemas are not part of the stream; every table named in a
//! snapshot must already exist locally.

use super::MAX_MESSAGE_SIZE;
use crate::storage::{RootObjectType, StorageEnvironment, TableValue};
use crate::{Error, Result};
use heed::{RoTxn, RwTxn};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// Nothing to install
pub const MARKER_NOOP: i32 = -1;
/// End of stream
pub const MARKER_NONE: i32 = 0;
/// Variable-size tree follows
pub const MARKER_TREE: i32 = 1;
/// Table follows
pub const MARKER_TABLE: i32 = 2;

/// What an installation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotInstall {
    /// The leader had nothing to send
    NoOp,
    /// Root objects were replaced
    Installed {
        /// Trees replaced
        trees: u64,
        /// Tables replaced
        tables: u64,
        /// Items processed: pairs and rows loaded, stale rows deleted
        items: u64,
    },
}

/// Periodic liveness signal during long installations
///
/// Every `batch` items, if more than `interval` passed since the last
/// signal, the callback runs and the stopwatch restarts.
pub struct KeepAlive {
    batch: u64,
    interval: Duration,
    processed: u64,
    last: Instant,
    sent: u64,
}

impl KeepAlive {
    /// Signal at most every `interval`, checking every `batch` items
    pub fn new(batch: u64, interval: Duration) -> Self {
        Self {
            batch: batch.max(1),
            interval,
            processed: 0,
            last: Instant::now(),
            sent: 0,
        }
    }

    /// Count one item
    pub fn tick<F>(&mut self, notify: &mut F) -> Result<()>
    where
        F: FnMut() -> Result<()>,
    {
        self.processed += 1;
        if self.processed % self.batch != 0 || self.last.elapsed() <= self.interval {
            return Ok(());
        }
        notify()?;
        self.last = Instant::now();
        self.sent += 1;
        Ok(())
    }

    /// Items counted
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Signals sent
    pub fn sent(&self) -> u64 {
        self.sent
    }
}

/// Bounds-checked reader over a snapshot stream
pub struct SnapshotReader<R> {
    inner: R,
}

impl<R: Read> SnapshotReader<R> {
    /// Wrap a stream
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read an i32
    pub fn read_i32(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Read an item count
    pub fn read_count(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.inner.read_exact(&mut buf)?;
        let count = i64::from_le_bytes(buf);
        u64::try_from(count)
            .map_err(|_| Error::snapshot_integrity(format!("Negative item count {}", count)))
    }

    /// Read a length-prefixed byte string
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_i32()?;
        let len = usize::try_from(len)
            .map_err(|_| Error::snapshot_integrity(format!("Negative length {}", len)))?;
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::snapshot_integrity(format!(
                "Length {} exceeds the {} byte limit",
                len, MAX_MESSAGE_SIZE
            )));
        }
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read a root object name
    pub fn read_name(&mut self) -> Result<String> {
        String::from_utf8(self.read_bytes()?)
            .map_err(|e| Error::snapshot_integrity(format!("Root object name is not UTF-8: {}", e)))
    }
}

/// Writer producing a snapshot stream
pub struct SnapshotWriter<W> {
    inner: W,
}

impl<W: Write> SnapshotWriter<W> {
    /// Wrap a stream
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Emit the "nothing to install" marker. Nothing may follow.
    pub fn write_noop(mut self) -> Result<W> {
        self.write_i32(MARKER_NOOP)?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    /// Emit a tree
    pub fn write_tree<'a, I>(&mut self, name: &str, count: u64, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        self.write_i32(MARKER_TREE)?;
        self.write_bytes(name.as_bytes())?;
        self.write_count(count)?;
        let mut written = 0u64;
        for (key, value) in entries {
            self.write_bytes(key)?;
            self.write_bytes(value)?;
            written += 1;
        }
        check_count(name, count, written)
    }

    /// Emit a table with pre-encoded rows
    pub fn write_table<'a, I>(&mut self, name: &str, count: u64, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        self.write_i32(MARKER_TABLE)?;
        self.write_bytes(name.as_bytes())?;
        self.write_count(count)?;
        let mut written = 0u64;
        for row in rows {
            self.write_bytes(row)?;
            written += 1;
        }
        check_count(name, count, written)
    }

    /// Emit the end marker and flush
    pub fn finish(mut self) -> Result<W> {
        self.write_i32(MARKER_NONE)?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn write_i32(&mut self, value: i32) -> Result<()> {
        self.inner.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    fn write_count(&mut self, count: u64) -> Result<()> {
        let count = i64::try_from(count)
            .map_err(|_| Error::invalid_argument(format!("Item count {} too large", count)))?;
        self.inner.write_all(&count.to_le_bytes())?;
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(Error::invalid_argument(format!(
                "Snapshot field of {} bytes exceeds the {} byte limit",
                bytes.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        self.write_i32(bytes.len() as i32)?;
        self.inner.write_all(bytes)?;
        Ok(())
    }
}

fn check_count(name: &str, declared: u64, written: u64) -> Result<()> {
    if declared != written {
        return Err(Error::internal(format!(
            "Root object '{}' declared {} items but wrote {}",
            name, declared, written
        )));
    }
    Ok(())
}

/// Dump every root object of `storage` as a snapshot stream
pub fn write_snapshot<W: Write>(storage: &StorageEnvironment, txn: &RoTxn, out: W) -> Result<W> {
    let mut writer = SnapshotWriter::new(out);
    for (name, kind) in storage.roots(txn)? {
        match kind {
            RootObjectType::VariableSizeTree => {
                let tree = storage
                    .open_tree(txn, &name)?
                    .ok_or_else(|| Error::storage(format!("Tree '{}' is listed but missing", name)))?;
                let entries = tree.entries(txn)?;
                writer.write_tree(
                    &name,
                    entries.len() as u64,
                    entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice())),
                )?;
            }
            RootObjectType::Table => {
                let table = storage
                    .open_table(txn, &name)?
                    .ok_or_else(|| Error::storage(format!("Table '{}' is listed but missing", name)))?;
                let mut rows = Vec::new();
                table.for_each_raw(txn, |row| {
                    rows.push(row.to_vec());
                    Ok(())
                })?;
                writer.write_table(&name, rows.len() as u64, rows.iter().map(Vec::as_slice))?;
            }
        }
    }
    writer.finish()
}

/// Apply a snapshot stream inside `txn`
///
/// `notify` is the keep-alive callback.
pub fn install_snapshot<R, F>(
    storage: &StorageEnvironment,
    txn: &mut RwTxn,
    reader: &mut SnapshotReader<R>,
    keep_alive: &mut KeepAlive,
    notify: &mut F,
) -> Result<SnapshotInstall>
where
    R: Read,
    F: FnMut() -> Result<()>,
{
    let mut trees = 0u64;
    let mut tables = 0u64;
    let mut first = true;

    loop {
        let marker = reader.read_i32()?;
        match marker {
            MARKER_NOOP if first => return Ok(SnapshotInstall::NoOp),
            MARKER_NONE => {
                return Ok(SnapshotInstall::Installed {
                    trees,
                    tables,
                    items: keep_alive.processed(),
                });
            }
            MARKER_TREE => {
                let name = reader.read_name()?;
                storage.delete_tree(txn, &name)?;
                let tree = storage.create_tree(txn, &name)?;

                let count = reader.read_count()?;
                for _ in 0..count {
                    keep_alive.tick(notify)?;
                    let key = reader.read_bytes()?;
                    let value = reader.read_bytes()?;
                    tree.add(txn, &key, &value)?;
                }
                tracing::debug!("Installed tree '{}' with {} entries", name, count);
                trees += 1;
            }
            MARKER_TABLE => {
                let name = reader.read_name()?;
                let table = storage.open_table(txn, &name)?.ok_or_else(|| {
                    Error::snapshot_integrity(format!(
                        "Snapshot contains table '{}' but no local schema exists for it",
                        name
                    ))
                })?;

                while let Some(key) = table.last_key(txn)? {
                    table.delete_by_key(txn, &key)?;
                    keep_alive.tick(notify)?;
                }

                let count = reader.read_count()?;
                for _ in 0..count {
                    keep_alive.tick(notify)?;
                    let row = TableValue::from_bytes(&reader.read_bytes()?)?;
                    table.insert(txn, &row)?;
                }
                tracing::debug!("Installed table '{}' with {} rows", name, count);
                tables += 1;
            }
            other => {
                return Err(Error::snapshot_integrity(format!(
                    "Unknown root object marker {} in snapshot stream",
                    other
                )));
            }
        }
        first = false;
    }
}
