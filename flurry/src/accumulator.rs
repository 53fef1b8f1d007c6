//! The batch accumulator.
//!
//! An [`Accumulator`] holds exactly one open buffer. Points are encoded
//! straight into it under a lock; a flush swaps in a fresh buffer from the
//! [`BufferPool`] and hands the old one back as a [`Batch`]. Appends and
//! flushes are serialized by the same lock so a flush never splits a line.

use std::sync::{Arc, Mutex, PoisonError};

use bytes::{BufMut, BytesMut};
use flurry_line::Field;

use crate::pool::BufferPool;

/// A run of complete, newline terminated lines ready to be written.
#[derive(Debug)]
pub struct Batch {
    /// Encoded lines, concatenated
    pub buf: BytesMut,
    /// Number of lines in `buf`
    pub lines: usize,
}

impl Batch {
    /// Create a new [`Batch`].
    #[must_use]
    pub fn new(buf: BytesMut, lines: usize) -> Self {
        Self { buf, lines }
    }

    /// Length of the batch in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the batch carries no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[derive(Debug)]
struct Open {
    buf: BytesMut,
    lines: usize,
}

/// Mutex guarded, double-buffered line accumulator.
#[derive(Debug)]
pub struct Accumulator {
    pool: Arc<BufferPool>,
    open: Mutex<Open>,
}

impl Accumulator {
    /// Create a new [`Accumulator`] drawing its buffers from `pool`.
    #[must_use]
    pub fn new(pool: Arc<BufferPool>) -> Self {
        let buf = pool.get();
        Self {
            pool,
            open: Mutex::new(Open { buf, lines: 0 }),
        }
    }

    /// Encode one point into the open buffer.
    ///
    /// Returns the number of lines pending since the last flush, this one
    /// included.
    pub fn append(&self, series_key: &[u8], fields: &[Field<'_>], timestamp: i64) -> usize {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        flurry_line::encode(&mut open.buf, series_key, fields, timestamp);
        open.lines += 1;
        open.lines
    }

    /// Append one pre-encoded line, adding the trailing newline if absent.
    ///
    /// Empty input is ignored. Returns the number of lines pending since the
    /// last flush.
    pub fn append_line(&self, raw: &[u8]) -> usize {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if raw.is_empty() {
            return open.lines;
        }
        open.buf.put_slice(raw);
        if raw.last() != Some(&b'\n') {
            open.buf.put_u8(b'\n');
        }
        open.lines += 1;
        open.lines
    }

    /// Number of lines appended since the last flush.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lines
    }

    /// Capture the open buffer and install a fresh one.
    ///
    /// Returns `None`, leaving the open buffer in place, when nothing has
    /// been appended since the last flush.
    pub fn flush(&self) -> Option<Batch> {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if open.lines == 0 {
            return None;
        }
        let fresh = self.pool.get();
        let buf = std::mem::replace(&mut open.buf, fresh);
        let lines = std::mem::take(&mut open.lines);
        Some(Batch::new(buf, lines))
    }
}
