//! Document key validation and case folding
//!
//! Keys are compared case-insensitively. The lowered form is built in a
//! scratch buffer borrowed from a small pool; the guard hands the buffer
//! back on drop, whichever way the caller leaves.

use crate::{Error, Result};
use parking_lot::Mutex;

/// Maximum key length in UTF-8 bytes
pub const MAX_KEY_BYTES: usize = 255;

/// Buffers kept around for reuse
const MAX_POOLED_BUFFERS: usize = 16;

/// Check that `key` can be stored
pub fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(Error::invalid_argument(
            "Document key cannot be empty or whitespace",
        ));
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(Error::invalid_argument(format!(
            "Document key cannot exceed {} UTF-8 bytes, got {}",
            MAX_KEY_BYTES,
            key.len()
        )));
    }
    Ok(())
}

/// Pool of scratch buffers for lowered keys
#[derive(Default)]
pub struct KeyBufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl KeyBufferPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow a buffer; it returns to the pool when the guard drops
    pub fn acquire(&self) -> KeyBuffer<'_> {
        let buf = self
            .buffers
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(MAX_KEY_BYTES));
        KeyBuffer { pool: self, buf }
    }

    /// Number of idle buffers
    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }

    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < MAX_POOLED_BUFFERS {
            buffers.push(buf);
        }
    }
}

/// Scoped scratch buffer
pub struct KeyBuffer<'a> {
    pool: &'a KeyBufferPool,
    buf: Vec<u8>,
}

impl KeyBuffer<'_> {
    /// Validate `key` and fill the buffer with its lowered UTF-8 bytes
    pub fn lower(&mut self, key: &str) -> Result<&[u8]> {
        validate_key(key)?;
        self.lower_prefix(key)
    }

    /// Lower an arbitrary string (used for prefixes, which may be empty)
    pub fn lower_prefix(&mut self, value: &str) -> Result<&[u8]> {
        self.buf.clear();
        let mut scratch = [0u8; 4];
        for c in value.chars() {
            for lowered in c.to_lowercase() {
                self.buf
                    .extend_from_slice(lowered.encode_utf8(&mut scratch).as_bytes());
            }
        }
        if self.buf.len() > MAX_KEY_BYTES {
            return Err(Error::invalid_argument(format!(
                "Lowered key exceeds {} UTF-8 bytes",
                MAX_KEY_BYTES
            )));
        }
        Ok(&self.buf)
    }
}

impl Drop for KeyBuffer<'_> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}
