//! The main write pipeline and its stats pipeline, wired together.
//!
//! A [`Pipeline`] owns everything one run needs: the buffer pool, the main
//! accumulator, the main dispatch queue and worker pool, the stats pipeline
//! and at most one input task. Nothing is global, every test builds its own.
//!
//! Draining happens in this order:
//!
//! 1. stop the input and wait for it to return,
//! 2. flush the main accumulator one last time,
//! 3. close the main queue and join the main workers,
//! 4. flush the stats accumulator, close the stats queue and join the
//!    reporters.

use std::{future::Future, num::NonZeroUsize, sync::Arc};

use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use crate::{
    accumulator::Accumulator,
    dispatch,
    input::{self, Producer},
    pool::BufferPool,
    shutdown::{Coordinator, Phase},
    signals::{self, Broadcaster, Watcher},
    stats::{self, StatsPipeline},
    transport::Transport,
    worker::WorkerPool,
};

/// Sizing of a [`Pipeline`].
#[derive(Debug, Clone)]
pub struct Settings {
    /// Lines per main batch
    pub lines_per_batch: NonZeroUsize,
    /// Main workers, also the main queue capacity
    pub workers: NonZeroUsize,
    /// Initial capacity of pooled buffers, in bytes
    pub buffer_capacity: usize,
    /// The stats pipeline
    pub stats: stats::Settings,
}

type InputResult = Result<u64, input::Error>;

#[derive(Debug)]
struct Input {
    handle: JoinHandle<InputResult>,
    stop: Broadcaster,
    finished: bool,
}

/// One run of the generator.
#[derive(Debug)]
pub struct Pipeline {
    pool: Arc<BufferPool>,
    accumulator: Arc<Accumulator>,
    queue: dispatch::Sender,
    workers: WorkerPool,
    stats: StatsPipeline,
    lines_per_batch: NonZeroUsize,
    input: Option<Input>,
}

impl Pipeline {
    /// Build the pipeline and start its workers. Must be called from within a
    /// tokio runtime.
    #[must_use]
    pub fn new(
        settings: Settings,
        transport: Arc<dyn Transport>,
        stats_transport: Arc<dyn Transport>,
    ) -> Self {
        let retained = settings.workers.get() * 2 + settings.stats.workers.get() * 2 + 2;
        let pool = Arc::new(BufferPool::new(settings.buffer_capacity, retained));
        let stats = StatsPipeline::spawn(settings.stats, Arc::clone(&pool), stats_transport);

        let accumulator = Arc::new(Accumulator::new(Arc::clone(&pool)));
        let (queue, receiver) = dispatch::queue(settings.workers);
        let workers = WorkerPool::spawn(
            "main",
            settings.workers,
            receiver,
            transport,
            Arc::clone(&pool),
            Some(stats.recorder()),
        );

        Self {
            pool,
            accumulator,
            queue,
            workers,
            stats,
            lines_per_batch: settings.lines_per_batch,
            input: None,
        }
    }

    /// A producer feeding the main accumulator.
    ///
    /// Every producer holds the main queue open; drop them all before
    /// shutting down or the drain will not complete.
    #[must_use]
    pub fn producer(&self) -> Producer {
        Producer::new(
            Arc::clone(&self.accumulator),
            self.queue.clone(),
            self.lines_per_batch,
        )
    }

    /// The shared buffer pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Spawn the input task. `source` receives a producer and a stop signal.
    /// Replaces, and stops, any previous input task.
    pub fn spawn_input<S, F>(&mut self, source: S)
    where
        S: FnOnce(Producer, Watcher) -> F,
        F: Future<Output = InputResult> + Send + 'static,
    {
        let (watcher, stop) = signals::signal();
        let handle = tokio::spawn(source(self.producer(), watcher));
        if let Some(previous) = self.input.replace(Input {
            handle,
            stop,
            finished: false,
        }) {
            warn!("Replacing a running input task");
            previous.stop.signal();
        }
    }

    /// Run until `interrupt` completes or the input finishes, then shut
    /// down. Returns the terminal phase.
    pub async fn run<I>(mut self, coordinator: &Coordinator, interrupt: I) -> Phase
    where
        I: Future<Output = ()>,
    {
        if let Some(input) = self.input.as_mut() {
            tokio::select! {
                () = interrupt => info!("Interrupt received, shutting down"),
                res = &mut input.handle => {
                    input.finished = true;
                    report_input(res);
                }
            }
        } else {
            interrupt.await;
            info!("Interrupt received, shutting down");
        }
        self.shutdown(coordinator).await
    }

    /// Drain both pipelines under the coordinator's deadline.
    pub async fn shutdown(self, coordinator: &Coordinator) -> Phase {
        coordinator.drain(self.drain(coordinator)).await
    }

    async fn drain(self, coordinator: &Coordinator) {
        let Self {
            pool: _,
            accumulator,
            queue,
            workers,
            stats,
            lines_per_batch: _,
            input,
        } = self;

        if let Some(Input {
            handle,
            stop,
            finished,
        }) = input
        {
            stop.signal();
            if !finished {
                report_input(handle.await);
            }
        }

        if let Some(batch) = accumulator.flush() {
            if let Err(err) = queue.send(batch).await {
                error!("Final flush lost: {err}");
            }
        }
        drop(queue);
        workers.join().await;

        coordinator.advance(Phase::StatsFlushing);
        stats.close().await;
    }
}

fn report_input(res: Result<InputResult, JoinError>) {
    match res {
        Ok(Ok(lines)) => info!("Input finished after {lines} lines"),
        Ok(Err(err)) => error!("Input failed: {err}"),
        Err(err) => error!("Could not join the input task: {err}"),
    }
}
