use std::{
    net::SocketAddr,
    num::{NonZeroU64, NonZeroUsize},
    sync::Arc,
};

use clap::{Parser, ValueEnum};
use flurry::{
    config::{self, Config, Input, Stats, Target},
    input::{self, Synthetic},
    pipeline::Pipeline,
    shutdown::{Coordinator, Phase},
    transport::{self, Http},
};
use jemallocator::Jemalloc;
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{
    io::BufReader,
    runtime::Builder,
    signal,
    time::{self, Duration},
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::Error),
    #[error("Failed to set up transport: {0}")]
    Transport(#[from] transport::Error),
    #[error("Failed to install prometheus exporter: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum InputKind {
    /// Read raw line protocol from standard input
    Stdin,
    /// Generate points
    Synthetic,
}

#[derive(Parser, Debug)]
#[clap(version, about = "Write batched line protocol and report on how it went", long_about = None)]
struct Opts {
    /// Line protocol endpoint, `host:port` or a full URL
    #[clap(long, default_value = "localhost:8086")]
    target_uri: String,
    /// Database to write to
    #[clap(long)]
    database: String,
    /// Lines per batch
    #[clap(long, default_value = "100")]
    lines_per_batch: NonZeroUsize,
    /// Write workers, defaults to eight per CPU
    #[clap(long)]
    workers: Option<NonZeroUsize>,
    /// Endpoint to report statistics to
    #[clap(long)]
    stats_uri: String,
    /// Database to report statistics to
    #[clap(long)]
    stats_database: String,
    /// Series key of statistics lines, `{pid}` is replaced by the process id
    #[clap(long, default_value = "flurry,pid={pid}")]
    stats_key: String,
    /// Seconds between statistics flushes
    #[clap(long, default_value = "3")]
    stats_interval_seconds: NonZeroU64,
    /// Statistics reporter workers
    #[clap(long, default_value = "4")]
    stats_workers: NonZeroUsize,
    /// Seconds allowed for draining on shutdown before giving up
    #[clap(long, default_value_t = 3)]
    shutdown_deadline_seconds: u64,
    /// Initial capacity of batch buffers
    #[clap(long, default_value = "4KiB")]
    buffer_capacity: byte_unit::Byte,
    /// Where lines come from
    #[clap(long, value_enum, default_value_t = InputKind::Stdin)]
    input: InputKind,
    /// Synthetic points to produce, zero for no limit
    #[clap(long, default_value_t = 0)]
    synthetic_lines: u64,
    /// Measurement name of synthetic points
    #[clap(long, default_value = "tmp")]
    synthetic_measurement: String,
    /// Seed for synthetic values, defaults to the current time
    #[clap(long)]
    seed: Option<u64>,
    /// Address to expose prometheus metrics on
    #[clap(long)]
    prometheus_addr: Option<SocketAddr>,
}

impl Opts {
    fn into_config(self) -> Config {
        let input = match self.input {
            InputKind::Stdin => Input::Stdin,
            InputKind::Synthetic => Input::Synthetic {
                measurement: self.synthetic_measurement,
                lines: self.synthetic_lines,
                seed: self
                    .seed
                    .unwrap_or_else(|| flurry_line::now_nanos().unsigned_abs()),
            },
        };
        let mut stats = Stats::new(Target {
            uri: self.stats_uri,
            database: self.stats_database,
        });
        stats.series_key = self.stats_key;
        stats.interval_seconds = self.stats_interval_seconds;
        stats.workers = self.stats_workers;

        let mut config = Config::new(
            Target {
                uri: self.target_uri,
                database: self.database,
            },
            stats,
            input,
        );
        config.lines_per_batch = self.lines_per_batch;
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        config.buffer_capacity = self.buffer_capacity;
        config.shutdown_deadline_seconds = self.shutdown_deadline_seconds;
        config
    }
}

async fn inner_main(config: Config, prometheus_addr: Option<SocketAddr>) -> Result<Phase, Error> {
    if let Some(addr) = prometheus_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Prometheus metrics exposed on {addr}");
    }

    let settings = config.pipeline_settings()?;
    let transport = Http::new(
        &config.target.uri,
        &config.target.database,
        config.workers.get(),
    )?;
    let stats_transport = Http::new(
        &config.stats.target.uri,
        &config.stats.target.database,
        config.stats.workers.get(),
    )?;
    info!(
        "Writing to {target} with {workers} workers, reporting to {stats}",
        target = transport.uri(),
        workers = config.workers,
        stats = stats_transport.uri(),
    );

    let mut pipeline = Pipeline::new(settings, Arc::new(transport), Arc::new(stats_transport));
    match config.input.clone() {
        Input::Stdin => pipeline.spawn_input(|producer, stop| {
            input::run_lines(producer, BufReader::new(tokio::io::stdin()), stop)
        }),
        Input::Synthetic {
            measurement,
            lines,
            seed,
        } => pipeline.spawn_input(move |producer, stop| {
            input::run_synthetic(
                producer,
                Synthetic {
                    measurement,
                    lines,
                    seed,
                },
                stop,
            )
        }),
    }

    let running = tokio::spawn(async {
        let mut interval = time::interval(Duration::from_millis(400));
        loop {
            interval.tick().await;
            gauge!("flurry.running").set(1.0);
        }
    });

    let coordinator = Coordinator::new(config.shutdown_deadline());
    let interrupt = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Unable to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };
    let phase = pipeline.run(&coordinator, interrupt).await;

    running.abort();
    gauge!("flurry.running").set(0.0);
    Ok(phase)
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting flurry {version} run.");

    let opts = Opts::parse();
    let prometheus_addr = opts.prometheus_addr;
    let config = opts.into_config();
    config.validate()?;

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let phase = runtime.block_on(inner_main(config, prometheus_addr))?;
    // Stalled writers are abandoned when the deadline passes, do not wait on
    // them here.
    runtime.shutdown_timeout(Duration::from_millis(100));

    if phase == Phase::Aborted {
        warn!("Shutdown aborted, some data may not have been written.");
    }
    info!("Bye. :)");
    std::process::exit(phase.exit_code());
}
