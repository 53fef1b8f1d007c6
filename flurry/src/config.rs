//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.
//!
//! The generator is configured from its command line into a [`Config`]; the
//! sink reads a YAML file into a [`SinkConfig`]. Both are validated before any
//! pipeline is built.
use std::{
    fs, io,
    net::SocketAddr,
    num::{NonZeroU64, NonZeroUsize},
    path::{Path, PathBuf},
    time::Duration,
};

use flurry_line::SeriesKey;
use serde::{Deserialize, Serialize};

use crate::{pipeline, stats};

/// Errors produced by [`Config`] and [`SinkConfig`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// The write target has no endpoint.
    #[error("A target endpoint is required")]
    MissingTarget,
    /// The write target has no database.
    #[error("A target database is required")]
    MissingDatabase,
    /// The stats target has no endpoint.
    #[error("A stats endpoint is required")]
    MissingStatsTarget,
    /// The stats target has no database.
    #[error("A stats database is required")]
    MissingStatsDatabase,
    /// The configured buffer capacity does not fit in memory.
    #[error("Buffer capacity of {0} bytes is too large")]
    BufferCapacity(u64),
}

/// Placeholder in series key templates replaced by the process id.
pub const PID_PLACEHOLDER: &str = "{pid}";

/// Expand a series key template, replacing [`PID_PLACEHOLDER`].
#[must_use]
pub fn expand_series_key(template: &str) -> SeriesKey {
    SeriesKey::from_raw(template.replace(PID_PLACEHOLDER, &std::process::id().to_string()))
}

/// Default number of main workers, eight per CPU.
#[must_use]
pub fn default_workers() -> NonZeroUsize {
    NonZeroUsize::new(8 * num_cpus::get()).unwrap_or(NonZeroUsize::MIN)
}

fn default_lines_per_batch() -> NonZeroUsize {
    NonZeroUsize::new(100).unwrap_or(NonZeroUsize::MIN)
}

fn default_stats_workers() -> NonZeroUsize {
    NonZeroUsize::new(4).unwrap_or(NonZeroUsize::MIN)
}

fn default_interval_seconds() -> NonZeroU64 {
    NonZeroU64::new(3).unwrap_or(NonZeroU64::MIN)
}

fn default_shutdown_deadline_seconds() -> u64 {
    3
}

fn default_buffer_capacity() -> byte_unit::Byte {
    byte_unit::Byte::from_u64(4096)
}

fn default_generator_series_key() -> String {
    format!("flurry,pid={PID_PLACEHOLDER}")
}

fn default_sink_series_key() -> String {
    format!("flurry_sink,pid={PID_PLACEHOLDER}")
}

fn default_sink_batch_size() -> NonZeroUsize {
    default_lines_per_batch()
}

fn default_concurrent_requests_max() -> usize {
    100
}

/// A line protocol write destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Endpoint, `host:port` or a full URL
    pub uri: String,
    /// Database named in the write query
    pub database: String,
}

/// Where the generator's lines come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Raw line protocol from standard input
    Stdin,
    /// Generated points
    Synthetic {
        /// Measurement name
        measurement: String,
        /// Points to produce, zero for no limit
        lines: u64,
        /// Seed for generated values
        seed: u64,
    },
}

/// Configuration of the generator's own statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Where stats are written
    pub target: Target,
    /// Series key template, see [`PID_PLACEHOLDER`]
    pub series_key: String,
    /// Seconds between periodic flushes
    pub interval_seconds: NonZeroU64,
    /// Reporter workers
    pub workers: NonZeroUsize,
}

impl Stats {
    /// A [`Stats`] with every optional setting at its default.
    #[must_use]
    pub fn new(target: Target) -> Self {
        Self {
            target,
            series_key: default_generator_series_key(),
            interval_seconds: default_interval_seconds(),
            workers: default_stats_workers(),
        }
    }
}

/// Main configuration struct for the generator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Where lines are written
    pub target: Target,
    /// Lines per batch
    pub lines_per_batch: NonZeroUsize,
    /// Main workers, also the main queue capacity
    pub workers: NonZeroUsize,
    /// Initial capacity of pooled buffers
    pub buffer_capacity: byte_unit::Byte,
    /// Seconds allowed for draining after shutdown starts
    pub shutdown_deadline_seconds: u64,
    /// Self-monitoring
    pub stats: Stats,
    /// Line source
    pub input: Input,
}

impl Config {
    /// A [`Config`] with every optional setting at its default.
    #[must_use]
    pub fn new(target: Target, stats: Stats, input: Input) -> Self {
        Self {
            target,
            lines_per_batch: default_lines_per_batch(),
            workers: default_workers(),
            buffer_capacity: default_buffer_capacity(),
            shutdown_deadline_seconds: default_shutdown_deadline_seconds(),
            stats,
            input,
        }
    }

    /// Reject configurations that cannot run.
    ///
    /// # Errors
    ///
    /// Function will return an error if either target lacks an endpoint or a
    /// database.
    pub fn validate(&self) -> Result<(), Error> {
        if self.target.uri.trim().is_empty() {
            return Err(Error::MissingTarget);
        }
        if self.target.database.trim().is_empty() {
            return Err(Error::MissingDatabase);
        }
        if self.stats.target.uri.trim().is_empty() {
            return Err(Error::MissingStatsTarget);
        }
        if self.stats.target.database.trim().is_empty() {
            return Err(Error::MissingStatsDatabase);
        }
        Ok(())
    }

    /// Time allowed for draining.
    #[must_use]
    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_seconds)
    }

    /// Pipeline sizing derived from this configuration.
    ///
    /// # Errors
    ///
    /// Function will return an error if the buffer capacity does not fit in
    /// `usize`.
    pub fn pipeline_settings(&self) -> Result<pipeline::Settings, Error> {
        let capacity = self.buffer_capacity.as_u64();
        let buffer_capacity =
            usize::try_from(capacity).map_err(|_| Error::BufferCapacity(capacity))?;
        Ok(pipeline::Settings {
            lines_per_batch: self.lines_per_batch,
            workers: self.workers,
            buffer_capacity,
            stats: stats::Settings {
                series_key: expand_series_key(&self.stats.series_key),
                interval: Duration::from_secs(self.stats.interval_seconds.get()),
                batch_size: None,
                workers: self.stats.workers,
            },
        })
    }
}

/// Main configuration struct for the sink
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    /// The HTTP listener
    pub http: SinkHttp,
    /// Optional ingest statistics
    #[serde(default)]
    pub stats: Option<SinkStats>,
}

/// The sink's HTTP listener.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SinkHttp {
    /// Address to bind
    pub binding_addr: SocketAddr,
    /// Maximum concurrent connections, more are shed
    #[serde(default = "default_concurrent_requests_max")]
    pub concurrent_requests_max: usize,
}

/// Where and how often the sink reports what it ingested.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SinkStats {
    /// Stats endpoint
    pub target_uri: String,
    /// Stats database
    pub database: String,
    /// Series key template, see [`PID_PLACEHOLDER`]
    #[serde(default = "default_sink_series_key")]
    pub series_key: String,
    /// Flush as soon as this many records are pending
    #[serde(default = "default_sink_batch_size")]
    pub batch_size: NonZeroUsize,
    /// Reporter workers
    #[serde(default = "default_stats_workers")]
    pub workers: NonZeroUsize,
    /// Seconds between periodic flushes
    #[serde(default = "default_interval_seconds")]
    pub flush_interval_seconds: NonZeroU64,
}

impl SinkStats {
    /// Stats pipeline settings derived from this configuration.
    #[must_use]
    pub fn settings(&self) -> stats::Settings {
        stats::Settings {
            series_key: expand_series_key(&self.series_key),
            interval: Duration::from_secs(self.flush_interval_seconds.get()),
            batch_size: Some(self.batch_size),
            workers: self.workers,
        }
    }
}

impl SinkConfig {
    /// Parse a YAML document.
    ///
    /// # Errors
    ///
    /// Function will return an error if `contents` is not a valid sink
    /// configuration.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse the YAML file at `path`.
    ///
    /// # Errors
    ///
    /// Function will return an error if the file cannot be read or is not a
    /// valid sink configuration.
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Self::from_yaml(&contents)
    }

    /// Reject configurations that cannot run.
    ///
    /// # Errors
    ///
    /// Function will return an error if stats are configured without an
    /// endpoint or database.
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(stats) = &self.stats {
            if stats.target_uri.trim().is_empty() {
                return Err(Error::MissingStatsTarget);
            }
            if stats.database.trim().is_empty() {
                return Err(Error::MissingStatsDatabase);
            }
        }
        Ok(())
    }
}

/// A commented sample sink configuration.
pub const SAMPLE_SINK_CONFIG: &str = r#"# flurry-sink configuration
http:
  # Address the sink listens on for line protocol writes.
  binding_addr: "127.0.0.1:8086"
  # Connections beyond this are shed.
  concurrent_requests_max: 100

# Remove this section to run without reporting ingest statistics.
stats:
  target_uri: "localhost:8087"
  database: "flurry_stats"
  # {pid} is replaced by the sink's process id.
  series_key: "flurry_sink,pid={pid}"
  # Flush once this many ingest records are pending ...
  batch_size: 100
  # ... or this often, whichever comes first.
  flush_interval_seconds: 3
  workers: 4
"#;
