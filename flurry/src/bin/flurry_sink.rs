use std::{
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
};

use clap::Parser;
use flurry::{
    config::{self, SAMPLE_SINK_CONFIG, SinkConfig},
    pool::BufferPool,
    shutdown::{Coordinator, Phase},
    signals,
    sink::{self, Sink},
    stats::StatsPipeline,
    transport::{self, Http},
};
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{
    runtime::Builder,
    signal,
    time::{self, Duration},
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::Error),
    #[error("Failed to set up stats transport: {0}")]
    Transport(#[from] transport::Error),
    #[error("Sink failed: {0}")]
    Sink(#[from] sink::Error),
    #[error("Failed to install prometheus exporter: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

#[derive(Parser, Debug)]
#[clap(version, about = "Accept line protocol writes and count them", long_about = None)]
struct Opts {
    /// Path to the sink configuration file
    #[clap(long, env = "FLURRY_SINK_CONFIG", default_value = "flurry-sink.yaml")]
    config_path: PathBuf,
    /// Print a sample configuration and exit
    #[clap(long)]
    sample_config: bool,
    /// Seconds allowed for draining on shutdown before giving up
    #[clap(long, default_value_t = 3)]
    shutdown_deadline_seconds: u64,
    /// Address to expose prometheus metrics on
    #[clap(long)]
    prometheus_addr: Option<SocketAddr>,
}

async fn inner_main(
    config: SinkConfig,
    deadline: Duration,
    prometheus_addr: Option<SocketAddr>,
) -> Result<Phase, Error> {
    if let Some(addr) = prometheus_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Prometheus metrics exposed on {addr}");
    }

    let stats = match &config.stats {
        Some(stats_config) => {
            let transport = Http::new(
                &stats_config.target_uri,
                &stats_config.database,
                stats_config.workers.get(),
            )?;
            info!("Reporting ingest statistics to {}", transport.uri());
            let pool = Arc::new(BufferPool::new(4096, stats_config.workers.get() * 2 + 2));
            Some(StatsPipeline::spawn(
                stats_config.settings(),
                pool,
                Arc::new(transport),
            ))
        }
        None => None,
    };

    let (shutdown_watcher, shutdown_broadcast) = signals::signal();
    let mut sink = Sink::bind(&config.http, shutdown_watcher).await?;
    if let Some(stats) = &stats {
        sink = sink.with_recorder(stats.recorder());
    }
    info!("Accepting writes at {}/write", sink.url());
    let tally = sink.tally();
    let mut server = tokio::spawn(sink.run());

    let mut server_done = false;
    let mut interval = time::interval(Duration::from_millis(400));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                gauge!("flurry_sink.running").set(1.0);
            }
            _ = signal::ctrl_c() => {
                info!("received ctrl-c");
                break;
            }
            res = &mut server => {
                server_done = true;
                match res {
                    Ok(Ok(())) => warn!("Sink stopped unexpectedly"),
                    Ok(Err(err)) => error!("Sink failed: {err}"),
                    Err(err) => error!("Could not join the sink task: {err}"),
                }
                break;
            }
        }
    }
    gauge!("flurry_sink.running").set(0.0);

    shutdown_broadcast.signal();
    let coordinator = Coordinator::new(deadline);
    let phase = coordinator
        .drain(async {
            if !server_done {
                match server.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => error!("Sink failed: {err}"),
                    Err(err) => error!("Could not join the sink task: {err}"),
                }
            }
            coordinator.advance(Phase::StatsFlushing);
            if let Some(stats) = stats {
                stats.close().await;
            }
        })
        .await;

    let totals = tally.snapshot();
    info!(
        "Accepted {requests} requests, {lines} lines, {bytes} bytes; rejected {rejected} requests",
        requests = totals.requests,
        lines = totals.lines,
        bytes = totals.bytes,
        rejected = totals.rejected,
    );
    Ok(phase)
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let opts = Opts::parse();
    if opts.sample_config {
        io::stdout().write_all(SAMPLE_SINK_CONFIG.as_bytes())?;
        return Ok(());
    }

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting flurry-sink {version}.");
    let config = SinkConfig::from_path(&opts.config_path)?;
    let deadline = Duration::from_secs(opts.shutdown_deadline_seconds);

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let phase = runtime.block_on(inner_main(config, deadline, opts.prometheus_addr))?;
    runtime.shutdown_timeout(Duration::from_millis(100));

    info!("Bye. :)");
    std::process::exit(phase.exit_code());
}
