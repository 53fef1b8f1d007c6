//! Fixed-size pools of write workers.
//!
//! Each worker takes a batch off the shared dispatch queue, hands it to the
//! transport, records the outcome and returns the buffer to the pool. Failed
//! writes are logged and counted, never retried. Workers exit once the queue
//! is closed and drained.
//!
//! ## Metrics
//!
//! `requests_sent`: Total number of batch writes attempted
//! `request_ok`: Batch writes accepted by the transport
//! `request_failure`: Batch writes refused or failed
//! `bytes_written`: Total bytes in accepted batches
//! `lines_written`: Total lines in accepted batches
//! `write_latency_seconds`: Histogram of write latency
//!
//! All metrics are labelled with the pool name.
//!

use std::{num::NonZeroUsize, sync::Arc};

use flurry_line::now_nanos;
use metrics::{counter, histogram};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{
    accumulator::Batch,
    dispatch,
    pool::BufferPool,
    stats::{Recorder, WriteRecord},
    transport::{Transport, Write},
};

/// A fixed number of workers draining one dispatch queue.
#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    workers: JoinSet<()>,
}

impl WorkerPool {
    /// Spawn `size` workers onto the current tokio runtime.
    ///
    /// When `stats` is present every completed write is recorded there.
    #[must_use]
    pub fn spawn(
        name: &str,
        size: NonZeroUsize,
        queue: dispatch::Receiver,
        transport: Arc<dyn Transport>,
        pool: Arc<BufferPool>,
        stats: Option<Recorder>,
    ) -> Self {
        let labels = vec![
            ("component".to_string(), "worker".to_string()),
            ("pool".to_string(), name.to_string()),
        ];
        let mut workers = JoinSet::new();
        for id in 0..size.get() {
            workers.spawn(run(
                id,
                queue.clone(),
                Arc::clone(&transport),
                Arc::clone(&pool),
                stats.clone(),
                labels.clone(),
            ));
        }
        info!("Started {size} workers in pool {name}");
        Self {
            name: name.to_string(),
            workers,
        }
    }

    /// Wait for every worker to exit. Workers exit only once their queue is
    /// closed and drained.
    pub async fn join(mut self) {
        while let Some(res) = self.workers.join_next().await {
            if let Err(err) = res {
                error!("Worker in pool {name} failed: {err}", name = self.name);
            }
        }
        debug!("Worker pool {name} joined", name = self.name);
    }
}

async fn run(
    id: usize,
    queue: dispatch::Receiver,
    transport: Arc<dyn Transport>,
    pool: Arc<BufferPool>,
    stats: Option<Recorder>,
    labels: Vec<(String, String)>,
) {
    while let Some(Batch { buf, lines }) = queue.recv().await {
        let bytes = buf.len();
        let body = buf.freeze();

        counter!("requests_sent", &labels).increment(1);
        let Write { latency, result } = transport.write(body.clone()).await;
        histogram!("write_latency_seconds", &labels).record(latency.as_secs_f64());

        let ok = match result {
            Ok(()) => {
                counter!("request_ok", &labels).increment(1);
                counter!("bytes_written", &labels).increment(bytes as u64);
                counter!("lines_written", &labels).increment(lines as u64);
                true
            }
            Err(err) => {
                warn!("Worker {id} failed to write {bytes} bytes: {err}");
                counter!("request_failure", &labels).increment(1);
                false
            }
        };

        if let Some(stats) = &stats {
            stats.record(&WriteRecord {
                bytes,
                lines,
                latency,
                ok,
                timestamp: now_nanos(),
            });
        }
        pool.recycle(body);
    }
    debug!("Worker {id} exiting, queue closed");
}
