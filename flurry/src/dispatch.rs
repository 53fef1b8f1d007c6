//! The bounded dispatch queue between an accumulator and a worker pool.
//!
//! A thin layer over a bounded tokio mpsc channel. The receiving half is
//! shared by every worker of a pool. Senders block while the queue is full.
//! The queue closes once every [`Sender`] has been dropped; receivers then
//! drain whatever remains before observing the end of the queue.

use std::{num::NonZeroUsize, sync::Arc};

use tokio::sync::{Mutex, mpsc};

use crate::accumulator::Batch;

/// Errors produced by [`Sender`].
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum Error {
    /// Every receiver has gone away, the batch was not enqueued.
    #[error("dispatch queue closed")]
    Closed,
}

/// Create a queue that holds at most `capacity` batches.
#[must_use]
pub fn queue(capacity: NonZeroUsize) -> (Sender, Receiver) {
    let (tx, rx) = mpsc::channel(capacity.get());
    (
        Sender { inner: tx },
        Receiver {
            inner: Arc::new(Mutex::new(rx)),
        },
    )
}

/// Producing half of the queue.
#[derive(Debug, Clone)]
pub struct Sender {
    inner: mpsc::Sender<Batch>,
}

impl Sender {
    /// Enqueue a batch, waiting for room if the queue is full.
    ///
    /// # Errors
    ///
    /// Function will return an error if every [`Receiver`] has been dropped.
    pub async fn send(&self, batch: Batch) -> Result<(), Error> {
        self.inner.send(batch).await.map_err(|_| Error::Closed)
    }

    /// Free slots in the queue.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

/// Consuming half of the queue, shared between workers.
#[derive(Debug, Clone)]
pub struct Receiver {
    inner: Arc<Mutex<mpsc::Receiver<Batch>>>,
}

impl Receiver {
    /// Wait for the next batch. Returns `None` once the queue is closed and
    /// drained.
    pub async fn recv(&self) -> Option<Batch> {
        self.inner.lock().await.recv().await
    }

    /// Number of batches waiting in the queue.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Whether no batch is waiting in the queue.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;

    use super::*;

    fn batch(tag: &[u8]) -> Batch {
        Batch::new(BytesMut::from(tag), 1)
    }

    fn cap(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).expect("non-zero")
    }

    #[tokio::test(start_paused = true)]
    async fn producer_blocks_past_capacity() {
        let (tx, rx) = queue(cap(2));
        assert_eq!(tx.capacity(), 2);
        tx.send(batch(b"1")).await.expect("room for first");
        tx.send(batch(b"2")).await.expect("room for second");
        assert_eq!(tx.capacity(), 0);

        let blocked_tx = tx.clone();
        let third = tokio::spawn(async move { blocked_tx.send(batch(b"3")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!third.is_finished());

        let first = rx.recv().await.expect("queued batch");
        assert_eq!(&first.buf[..], b"1");
        third
            .await
            .expect("sender task panicked")
            .expect("room after one dequeue");
        assert_eq!(rx.len().await, 2);
    }

    #[tokio::test]
    async fn receivers_drain_after_close() {
        let (tx, rx) = queue(cap(4));
        for tag in [b"a", b"b", b"c"] {
            tx.send(batch(tag)).await.expect("room");
        }
        drop(tx);

        let other = rx.clone();
        let mut seen = Vec::new();
        while let Some(b) = other.recv().await {
            seen.push(b.buf.to_vec());
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_fails_without_receivers() {
        let (tx, rx) = queue(cap(1));
        drop(rx);
        assert!(matches!(tx.send(batch(b"x")).await, Err(Error::Closed)));
    }
}
