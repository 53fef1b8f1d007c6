//! Sources of lines for the main pipeline.
//!
//! A [`Producer`] appends lines to the main accumulator and pushes a batch
//! onto the dispatch queue whenever `lines_per_batch` lines are pending. Two
//! sources drive a producer: [`run_lines`] reads raw line protocol from any
//! async reader, typically stdin, and [`run_synthetic`] makes up points of its
//! own. Both stop promptly when their stop signal fires.

use std::{num::NonZeroUsize, sync::Arc};

use flurry_line::{Field, SeriesKey, now_nanos};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info};

use crate::{accumulator::Accumulator, dispatch, signals::Watcher};

/// Errors produced by input sources.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Reading input failed.
    #[error("Failed to read input: {0}")]
    Io(#[from] std::io::Error),
    /// The dispatch queue closed underneath the producer.
    #[error(transparent)]
    Dispatch(#[from] dispatch::Error),
}

/// Appends lines and hands off full batches.
#[derive(Debug, Clone)]
pub struct Producer {
    accumulator: Arc<Accumulator>,
    queue: dispatch::Sender,
    lines_per_batch: NonZeroUsize,
}

impl Producer {
    /// Create a new [`Producer`].
    #[must_use]
    pub fn new(
        accumulator: Arc<Accumulator>,
        queue: dispatch::Sender,
        lines_per_batch: NonZeroUsize,
    ) -> Self {
        Self {
            accumulator,
            queue,
            lines_per_batch,
        }
    }

    /// Append one encoded point.
    ///
    /// # Errors
    ///
    /// Function will return an error if a full batch could not be enqueued.
    pub async fn append(
        &self,
        series_key: &[u8],
        fields: &[Field<'_>],
        timestamp: i64,
    ) -> Result<(), Error> {
        let pending = self.accumulator.append(series_key, fields, timestamp);
        self.maybe_flush(pending).await
    }

    /// Append one raw line.
    ///
    /// # Errors
    ///
    /// Function will return an error if a full batch could not be enqueued.
    pub async fn append_line(&self, raw: &[u8]) -> Result<(), Error> {
        let pending = self.accumulator.append_line(raw);
        self.maybe_flush(pending).await
    }

    async fn maybe_flush(&self, pending: usize) -> Result<(), Error> {
        if pending < self.lines_per_batch.get() {
            return Ok(());
        }
        if let Some(batch) = self.accumulator.flush() {
            self.queue.send(batch).await?;
        }
        Ok(())
    }
}

/// Feed every non-empty line of `reader` to `producer`.
///
/// Lines are passed on as raw bytes, they need not be valid UTF-8. A trailing
/// `\r` is dropped along with the newline. Returns the number of lines read once the reader is exhausted or `stop`
/// fires. Lines still pending in the accumulator are left for the final
/// flush.
///
/// # Errors
///
/// Function will return an error if reading fails or the dispatch queue
/// closes.
pub async fn run_lines<R>(producer: Producer, reader: R, stop: Watcher) -> Result<u64, Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut segments = reader.split(b'\n');
    let mut total = 0_u64;

    let stop_wait = stop.recv();
    tokio::pin!(stop_wait);
    loop {
        tokio::select! {
            segment = segments.next_segment() => {
                let Some(segment) = segment? else {
                    info!("End of input after {total} lines");
                    break;
                };
                let line = segment.strip_suffix(b"\r").unwrap_or(&segment[..]);
                if line.is_empty() {
                    continue;
                }
                producer.append_line(line).await?;
                total += 1;
            }
            () = &mut stop_wait => {
                info!("Input stopped after {total} lines");
                break;
            }
        }
    }
    Ok(total)
}

/// Parameters of the synthetic source.
#[derive(Debug, Clone)]
pub struct Synthetic {
    /// Measurement name; points are tagged with this process' pid
    pub measurement: String,
    /// Points to produce, zero for no limit
    pub lines: u64,
    /// Seed for the `value` field
    pub seed: u64,
}

/// Produce points `<measurement>,pid=<pid> ctr=<n>i,value=<f> <now>`.
///
/// Returns the number of points produced.
///
/// # Errors
///
/// Function will return an error if the dispatch queue closes.
pub async fn run_synthetic(
    producer: Producer,
    config: Synthetic,
    stop: Watcher,
) -> Result<u64, Error> {
    let pid = std::process::id().to_string();
    let key = SeriesKey::new(&config.measurement, &[("pid", pid.as_str())]);
    let mut rng = StdRng::seed_from_u64(config.seed);

    let mut ctr = 0_u64;
    while config.lines == 0 || ctr < config.lines {
        if stop.try_recv() {
            info!("Synthetic input stopped after {ctr} points");
            return Ok(ctr);
        }
        let value: f64 = rng.random();
        let fields = [
            Field::int("ctr", i64::try_from(ctr).unwrap_or(i64::MAX)),
            Field::float("value", value),
        ];
        producer.append(key.as_bytes(), &fields, now_nanos()).await?;
        ctr += 1;

        if ctr % 1024 == 0 {
            tokio::task::yield_now().await;
        }
    }
    debug!("Synthetic input produced {ctr} points");
    Ok(ctr)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;

    use crate::{pool::BufferPool, signals};

    use super::*;

    fn nz(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).expect("non-zero")
    }

    fn fixture(lines_per_batch: usize, capacity: usize) -> (Producer, Arc<Accumulator>, dispatch::Receiver) {
        let accumulator = Arc::new(Accumulator::new(Arc::new(BufferPool::new(64, 8))));
        let (tx, rx) = dispatch::queue(nz(capacity));
        (
            Producer::new(Arc::clone(&accumulator), tx, nz(lines_per_batch)),
            accumulator,
            rx,
        )
    }

    #[tokio::test]
    async fn lines_are_batched() {
        let (producer, accumulator, rx) = fixture(2, 4);
        let (watcher, _broadcaster) = signals::signal();
        let input: &[u8] = b"a x=1i 1\n\nb x=2i 2\nc x=3i 3\nd x=4i 4\ne x=5i 5";

        let total = run_lines(producer, input, watcher).await.expect("read ok");
        assert_eq!(total, 5);

        let mut batches: Vec<BytesMut> = Vec::new();
        while !rx.is_empty().await {
            batches.push(rx.recv().await.expect("queued").buf);
        }
        assert_eq!(batches.len(), 2);
        assert_eq!(&batches[0][..], b"a x=1i 1\nb x=2i 2\n");
        assert_eq!(&batches[1][..], b"c x=3i 3\nd x=4i 4\n");

        let rest = accumulator.flush().expect("one line left for the final flush");
        assert_eq!(&rest.buf[..], b"e x=5i 5\n");
    }

    #[tokio::test]
    async fn lines_pass_through_as_raw_bytes() {
        let (producer, accumulator, _rx) = fixture(100, 1);
        let (watcher, _broadcaster) = signals::signal();
        let input: &[u8] = b"a x=1i 1\nb s=\xff 2\r\nc x=3i 3\nd x=4i 4\n";

        let total = run_lines(producer, input, watcher).await.expect("read ok");
        assert_eq!(total, 4);

        let batch = accumulator.flush().expect("four lines pending");
        assert_eq!(batch.lines, 4);
        assert_eq!(&batch.buf[..], b"a x=1i 1\nb s=\xff 2\nc x=3i 3\nd x=4i 4\n");
    }

    #[tokio::test]
    async fn synthetic_is_bounded_and_seeded() {
        let (first, acc_a, _rx_a) = fixture(1000, 1);
        let (second, acc_b, _rx_b) = fixture(1000, 1);
        let config = Synthetic {
            measurement: "tmp".to_string(),
            lines: 5,
            seed: 42,
        };

        let (watcher, _broadcaster) = signals::signal();
        assert_eq!(
            run_synthetic(first, config.clone(), watcher.clone())
                .await
                .expect("queue open"),
            5
        );
        assert_eq!(
            run_synthetic(second, config, watcher).await.expect("queue open"),
            5
        );

        let strip = |buf: &[u8]| -> Vec<String> {
            String::from_utf8(buf.to_vec())
                .expect("valid utf-8")
                .lines()
                .map(|line| line.rsplit_once(' ').expect("timestamp").0.to_string())
                .collect()
        };
        let a = strip(&acc_a.flush().expect("pending").buf);
        let b = strip(&acc_b.flush().expect("pending").buf);
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
        let pid = std::process::id();
        assert!(a[0].starts_with(&format!("tmp,pid={pid} ctr=0i,value=")));
        assert!(a[4].starts_with(&format!("tmp,pid={pid} ctr=4i,value=")));
    }

    #[tokio::test]
    async fn stop_ends_unbounded_synthetic_input() {
        let (producer, _acc, rx) = fixture(10, 8);
        let (watcher, broadcaster) = signals::signal();
        let config = Synthetic {
            measurement: "tmp".to_string(),
            lines: 0,
            seed: 1,
        };

        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let task = tokio::spawn(run_synthetic(producer, config, watcher));
        tokio::task::yield_now().await;
        broadcaster.signal();

        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("synthetic input ignored its stop signal")
            .expect("task panicked")
            .expect("queue open");
        drain.abort();
    }
}
