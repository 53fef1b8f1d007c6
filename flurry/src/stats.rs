//! Self-monitoring statistics.
//!
//! Every completed write becomes a [`WriteRecord`], every request accepted by
//! the sink an [`IngestRecord`]. Records are encoded straight into a dedicated
//! [`Accumulator`] as line protocol under a fixed series key and then
//! forgotten. A single flusher task moves that accumulator's contents onto the
//! stats queue:
//!
//! * every `interval`,
//! * as soon as `batch_size` lines are pending, when configured,
//! * once more when the pipeline is closed.
//!
//! A pool of reporter workers writes the stats queue to its own transport.
//! Stats writes are not themselves recorded.
//!
//! ## Metrics
//!
//! `stats_flushes`: Batches handed to the reporter pool
//!

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use flurry_line::{Field, SeriesKey};
use metrics::counter;
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    accumulator::Accumulator,
    dispatch,
    pool::BufferPool,
    signals::{self, Broadcaster, Watcher},
    transport::Transport,
    worker::WorkerPool,
};

/// Something that can be written as one stats line.
pub trait Record {
    /// Encode `self` under `key` into `accumulator`, returning the number of
    /// lines now pending there.
    fn append_to(&self, key: &SeriesKey, accumulator: &Accumulator) -> usize;
}

fn as_i64<T: TryInto<i64>>(value: T) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}

/// The outcome of one batch write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    /// Bytes in the batch
    pub bytes: usize,
    /// Lines in the batch
    pub lines: usize,
    /// Time spent in the transport
    pub latency: Duration,
    /// Whether the transport accepted the batch
    pub ok: bool,
    /// When the write completed, nanoseconds since the Unix epoch
    pub timestamp: i64,
}

impl Record for WriteRecord {
    fn append_to(&self, key: &SeriesKey, accumulator: &Accumulator) -> usize {
        accumulator.append(
            key.as_bytes(),
            &[
                Field::int("latency_ns", as_i64(self.latency.as_nanos())),
                Field::bool("ok", self.ok),
                Field::int("bytes", as_i64(self.bytes)),
                Field::int("lines", as_i64(self.lines)),
            ],
            self.timestamp,
        )
    }
}

/// One request accepted by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestRecord {
    /// Body bytes accepted
    pub bytes: usize,
    /// Lines accepted
    pub lines: usize,
    /// Time spent reading the body
    pub latency: Duration,
    /// When the request completed, nanoseconds since the Unix epoch
    pub timestamp: i64,
}

impl Record for IngestRecord {
    fn append_to(&self, key: &SeriesKey, accumulator: &Accumulator) -> usize {
        accumulator.append(
            key.as_bytes(),
            &[
                Field::int("latency_ns", as_i64(self.latency.as_nanos())),
                Field::int("bytes", as_i64(self.bytes)),
                Field::int("lines", as_i64(self.lines)),
            ],
            self.timestamp,
        )
    }
}

/// Handle used to record into a [`StatsPipeline`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Recorder {
    key: SeriesKey,
    accumulator: Arc<Accumulator>,
    batch_size: Option<NonZeroUsize>,
    wake: Arc<Notify>,
}

impl Recorder {
    /// Record one stats line.
    pub fn record<R: Record>(&self, record: &R) {
        let pending = record.append_to(&self.key, &self.accumulator);
        if self
            .batch_size
            .is_some_and(|batch_size| pending >= batch_size.get())
        {
            self.wake.notify_one();
        }
    }
}

/// Configuration of a [`StatsPipeline`].
#[derive(Debug, Clone)]
pub struct Settings {
    /// Series key every stats line is written under
    pub series_key: SeriesKey,
    /// Time between periodic flushes
    pub interval: Duration,
    /// Flush early once this many lines are pending
    pub batch_size: Option<NonZeroUsize>,
    /// Number of reporter workers, also the stats queue capacity
    pub workers: NonZeroUsize,
}

/// A stats accumulator, its flusher and its reporter pool.
#[derive(Debug)]
pub struct StatsPipeline {
    recorder: Recorder,
    flusher: JoinHandle<()>,
    stop: Broadcaster,
    reporters: WorkerPool,
}

impl StatsPipeline {
    /// Start the flusher and the reporter pool. Must be called from within a
    /// tokio runtime.
    #[must_use]
    pub fn spawn(settings: Settings, pool: Arc<BufferPool>, transport: Arc<dyn Transport>) -> Self {
        let accumulator = Arc::new(Accumulator::new(Arc::clone(&pool)));
        let (sender, receiver) = dispatch::queue(settings.workers);
        let reporters = WorkerPool::spawn("stats", settings.workers, receiver, transport, pool, None);

        let wake = Arc::new(Notify::new());
        let (watcher, stop) = signals::signal();
        let flusher = tokio::spawn(flush_loop(
            Arc::clone(&accumulator),
            sender,
            settings.interval,
            Arc::clone(&wake),
            watcher,
        ));

        Self {
            recorder: Recorder {
                key: settings.series_key,
                accumulator,
                batch_size: settings.batch_size,
                wake,
            },
            flusher,
            stop,
            reporters,
        }
    }

    /// A handle to record into this pipeline.
    #[must_use]
    pub fn recorder(&self) -> Recorder {
        self.recorder.clone()
    }

    /// Flush once more, close the stats queue and wait for the reporters to
    /// drain it. Records made after this is called may be lost.
    pub async fn close(self) {
        self.stop.signal();
        if let Err(err) = self.flusher.await {
            error!("Stats flusher failed: {err}");
        }
        self.reporters.join().await;
        info!("Stats pipeline closed");
    }
}

async fn flush_loop(
    accumulator: Arc<Accumulator>,
    queue: dispatch::Sender,
    interval: Duration,
    wake: Arc<Notify>,
    stop: Watcher,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    let stop_wait = stop.recv();
    tokio::pin!(stop_wait);
    loop {
        tokio::select! {
            _ = ticker.tick() => {},
            () = wake.notified() => debug!("Stats batch size reached"),
            () = &mut stop_wait => break,
        }
        if !flush(&accumulator, &queue).await {
            return;
        }
    }

    flush(&accumulator, &queue).await;
    debug!("Final stats flush done, closing stats queue");
}

async fn flush(accumulator: &Accumulator, queue: &dispatch::Sender) -> bool {
    let Some(batch) = accumulator.flush() else {
        return true;
    };
    counter!("stats_flushes").increment(1);
    if let Err(err) = queue.send(batch).await {
        warn!("Dropping stats batch: {err}");
        return false;
    }
    true
}
