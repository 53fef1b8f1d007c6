//! Reusable batch buffers.
//!
//! Batches are encoded into `BytesMut` buffers drawn from a [`BufferPool`].
//! Once a worker has written a batch out its buffer comes back here with its
//! length reset and its capacity intact, so steady-state operation does not
//! allocate.
//!
//! ## Metrics
//!
//! `buffer_pool_allocations`: Buffers allocated because the pool was empty
//! `buffer_pool_discards`: Buffers dropped because the pool was full or the
//! buffer was still shared
//!

use std::sync::{Mutex, PoisonError};

use bytes::{Bytes, BytesMut};
use metrics::counter;

/// A pool of empty, pre-allocated byte buffers.
///
/// Safe for concurrent use. The pool holds at most `max_retained` idle
/// buffers; buffers returned beyond that are dropped.
#[derive(Debug)]
pub struct BufferPool {
    buffer_capacity: usize,
    max_retained: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    /// Create a new, empty [`BufferPool`]. Fresh buffers are allocated with
    /// `buffer_capacity` bytes of room.
    #[must_use]
    pub fn new(buffer_capacity: usize, max_retained: usize) -> Self {
        Self {
            buffer_capacity,
            max_retained,
            free: Mutex::new(Vec::with_capacity(max_retained)),
        }
    }

    /// Take an empty buffer from the pool, allocating if none is idle.
    #[must_use]
    pub fn get(&self) -> BytesMut {
        let reused = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        if let Some(buf) = reused {
            buf
        } else {
            counter!("buffer_pool_allocations").increment(1);
            BytesMut::with_capacity(self.buffer_capacity)
        }
    }

    /// Return a buffer to the pool. The buffer is cleared, its capacity kept.
    pub fn put(&self, mut buf: BytesMut) {
        buf.clear();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_retained {
            free.push(buf);
        } else {
            counter!("buffer_pool_discards").increment(1);
        }
    }

    /// Return a frozen buffer to the pool.
    ///
    /// This only succeeds when `bytes` is the last handle on its allocation.
    /// If some other handle is still alive the allocation is left alone and
    /// will be freed when that handle drops.
    pub fn recycle(&self, bytes: Bytes) {
        match bytes.try_into_mut() {
            Ok(buf) => self.put(buf),
            Err(_) => counter!("buffer_pool_discards").increment(1),
        }
    }

    /// Number of idle buffers held by the pool.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;

    #[test]
    fn returned_buffers_are_reused_empty() {
        let pool = BufferPool::new(64, 4);
        let mut buf = pool.get();
        buf.put_slice(b"hello");
        let capacity = buf.capacity();
        pool.put(buf);
        assert_eq!(pool.available(), 1);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), capacity);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn retention_is_bounded() {
        let pool = BufferPool::new(8, 2);
        for _ in 0..5 {
            pool.put(BytesMut::with_capacity(8));
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn recycle_requires_unique_handle() {
        let pool = BufferPool::new(8, 2);
        let mut buf = pool.get();
        buf.put_slice(b"abc");
        let frozen = buf.freeze();
        let other = frozen.clone();

        pool.recycle(frozen);
        assert_eq!(pool.available(), 0);

        pool.recycle(other);
        assert_eq!(pool.available(), 1);
    }
}
