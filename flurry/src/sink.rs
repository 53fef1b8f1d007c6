//! The line protocol sink.
//!
//! A minimal stand-in for a line protocol server. `POST /write?db=<name>`
//! with a non-empty `db` is accepted with `204 No Content` and its bytes and
//! newline-terminated lines are tallied. A missing or empty `db` is answered
//! with `400` and the body `database is required`, any other method on
//! `/write` with `405` and any other path with `404`.
//!
//! When given a stats [`Recorder`] every accepted request is also recorded as
//! an [`IngestRecord`].
//!
//! ## Metrics
//!
//! `bytes_received`: Total bytes received
//! `lines_received`: Total lines received
//! `requests_received`: Total requests received
//! `requests_rejected`: Requests answered with a 4xx status
//!

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use flurry_line::now_nanos;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, combinators::BoxBody};
use metrics::counter;
use serde::Deserialize;
use tokio::{net::TcpListener, time::Instant};
use tracing::error;

use crate::{
    common,
    config::SinkHttp,
    signals::Watcher,
    stats::{IngestRecord, Recorder},
};

/// Errors produced by [`Sink`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Binding the listener failed.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: SocketAddr,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The HTTP server failed.
    #[error(transparent)]
    Common(#[from] common::Error),
}

/// Totals observed by a [`Sink`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Accepted requests
    pub requests: u64,
    /// Bytes in accepted requests
    pub bytes: u64,
    /// Newline characters in accepted requests
    pub lines: u64,
    /// Requests answered with a 4xx status
    pub rejected: u64,
}

/// Live counters of a [`Sink`]. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Tally {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    bytes: AtomicU64,
    lines: AtomicU64,
    rejected: AtomicU64,
}

impl Tally {
    /// Current totals.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            requests: self.inner.requests.load(Ordering::Relaxed),
            bytes: self.inner.bytes.load(Ordering::Relaxed),
            lines: self.inner.lines.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
        }
    }

    fn accepted(&self, bytes: u64, lines: u64) {
        self.inner.requests.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.inner.lines.fetch_add(lines, Ordering::Relaxed);
    }

    fn rejected(&self) {
        self.inner.rejected.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Default, Deserialize)]
struct WriteQuery {
    #[serde(default)]
    db: String,
}

/// The sink server.
#[derive(Debug)]
pub struct Sink {
    listener: TcpListener,
    local_addr: SocketAddr,
    concurrency_limit: usize,
    shutdown: Watcher,
    tally: Tally,
    recorder: Option<Recorder>,
    metric_labels: Vec<(String, String)>,
}

impl Sink {
    /// Bind the listener. Binding to port zero picks a free port, see
    /// [`Sink::local_addr`].
    ///
    /// # Errors
    ///
    /// Function will return an error if the address cannot be bound.
    pub async fn bind(config: &SinkHttp, shutdown: Watcher) -> Result<Self, Error> {
        let listener = TcpListener::bind(config.binding_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: config.binding_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            concurrency_limit: config.concurrent_requests_max,
            shutdown,
            tally: Tally::default(),
            recorder: None,
            metric_labels: vec![
                ("component".to_string(), "sink".to_string()),
                ("component_name".to_string(), "http".to_string()),
            ],
        })
    }

    /// Record every accepted request into `recorder`.
    #[must_use]
    pub fn with_recorder(mut self, recorder: Recorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// The bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Base URL of the sink, suitable as a write endpoint.
    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// A handle on the sink's counters, valid after [`Sink::run`] consumes
    /// the sink.
    #[must_use]
    pub fn tally(&self) -> Tally {
        self.tally.clone()
    }

    /// Serve until the shutdown signal fires.
    ///
    /// # Errors
    ///
    /// Function will return an error if the server fails.
    pub async fn run(self) -> Result<(), Error> {
        let tally = self.tally;
        let recorder = self.recorder;
        let labels = self.metric_labels.clone();
        common::run_httpd(
            self.listener,
            self.concurrency_limit,
            self.shutdown,
            Duration::from_secs(1),
            self.metric_labels,
            move || {
                let tally = tally.clone();
                let recorder = recorder.clone();
                let labels = labels.clone();
                hyper::service::service_fn(move |req| {
                    srv(req, tally.clone(), recorder.clone(), labels.clone())
                })
            },
        )
        .await?;
        Ok(())
    }
}

async fn srv(
    req: Request<hyper::body::Incoming>,
    tally: Tally,
    recorder: Option<Recorder>,
    labels: Vec<(String, String)>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    counter!("requests_received", &labels).increment(1);

    if req.uri().path() != "/write" {
        tally.rejected();
        counter!("requests_rejected", &labels).increment(1);
        return Ok(build_response(StatusCode::NOT_FOUND, Bytes::new()));
    }
    if req.method() != Method::POST {
        tally.rejected();
        counter!("requests_rejected", &labels).increment(1);
        return Ok(build_response(StatusCode::METHOD_NOT_ALLOWED, Bytes::new()));
    }
    let query: WriteQuery =
        serde_qs::from_str(req.uri().query().unwrap_or_default()).unwrap_or_default();
    if query.db.is_empty() {
        tally.rejected();
        counter!("requests_rejected", &labels).increment(1);
        return Ok(build_response(StatusCode::BAD_REQUEST, "database is required"));
    }

    let start = Instant::now();
    let body = req.into_body().collect().await?.to_bytes();
    let latency = start.elapsed();
    let lines = body.iter().filter(|b| **b == b'\n').count();

    counter!("bytes_received", &labels).increment(body.len() as u64);
    counter!("lines_received", &labels).increment(lines as u64);
    tally.accepted(body.len() as u64, lines as u64);
    if let Some(recorder) = &recorder {
        recorder.record(&IngestRecord {
            bytes: body.len(),
            lines,
            latency,
            timestamp: now_nanos(),
        });
    }

    Ok(build_response(StatusCode::NO_CONTENT, Bytes::new()))
}

fn build_response(
    status: StatusCode,
    body: impl Into<Bytes>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut builder = Response::builder().status(status);
    let body = body.into();
    if !body.is_empty() {
        builder = builder.header("content-type", "text/plain");
    }
    match builder.body(crate::full(body)) {
        Ok(resp) => resp,
        Err(e) => {
            error!("Error building response: {e}");
            let mut resp = Response::new(crate::full(Bytes::new()));
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use bytes::BytesMut;
    use flurry_line::SeriesKey;
    use http_body_util::Empty;
    use hyper_util::{client::legacy::Client, rt::TokioExecutor};

    use crate::{
        pool::BufferPool,
        signals,
        stats::{Settings, StatsPipeline},
        transport::{
            Http, Transport,
            memory::{Behavior, Memory},
        },
    };

    use super::*;

    type Running = (
        String,
        Tally,
        signals::Broadcaster,
        tokio::task::JoinHandle<Result<(), Error>>,
    );

    async fn start(recorder: Option<Recorder>) -> Running {
        let config = SinkHttp {
            binding_addr: "127.0.0.1:0".parse().expect("valid addr"),
            concurrent_requests_max: 16,
        };
        let (watcher, broadcaster) = signals::signal();
        let mut sink = Sink::bind(&config, watcher).await.expect("bind");
        if let Some(recorder) = recorder {
            sink = sink.with_recorder(recorder);
        }
        let url = sink.url();
        let tally = sink.tally();
        let handle = tokio::spawn(sink.run());
        (url, tally, broadcaster, handle)
    }

    #[tokio::test]
    async fn missing_database_then_accepted_write() {
        let (url, tally, broadcaster, handle) = start(None).await;

        let missing = Http::new(&url, "", 1).expect("valid uri");
        let write = missing.write(Bytes::from_static(b"a x=1i 1\n")).await;
        match write.result {
            Err(crate::transport::Error::Status { status, body }) => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(body, "database is required");
            }
            other => panic!("expected a 400, got {other:?}"),
        }

        let good = Http::new(&url, "bench", 1).expect("valid uri");
        let write = good
            .write(Bytes::from_static(b"a x=1i 1\nb x=2i 2\nc x=3i 3\n"))
            .await;
        assert!(write.result.is_ok(), "{:?}", write.result);

        assert_eq!(
            tally.snapshot(),
            Snapshot {
                requests: 1,
                bytes: 27,
                lines: 3,
                rejected: 1,
            }
        );

        broadcaster.signal();
        handle.await.expect("sink task panicked").expect("sink ran");
    }

    #[tokio::test]
    async fn wrong_path_and_method() {
        let (url, tally, broadcaster, handle) = start(None).await;
        let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();

        let not_found = client
            .get(format!("{url}/query?db=x").parse().expect("uri"))
            .await
            .expect("response");
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let not_allowed = client
            .get(format!("{url}/write?db=x").parse().expect("uri"))
            .await
            .expect("response");
        assert_eq!(not_allowed.status(), StatusCode::METHOD_NOT_ALLOWED);

        assert_eq!(tally.snapshot().rejected, 2);
        assert_eq!(tally.snapshot().requests, 0);

        drop(client);
        broadcaster.signal();
        handle.await.expect("sink task panicked").expect("sink ran");
    }

    #[tokio::test]
    async fn accepted_writes_are_recorded_as_ingest_stats() {
        let stats_transport = Arc::new(Memory::new(Behavior::Accept));
        let stats = StatsPipeline::spawn(
            Settings {
                series_key: SeriesKey::from_raw("flurry_sink,pid=1"),
                interval: Duration::from_secs(3600),
                batch_size: NonZeroUsize::new(100),
                workers: NonZeroUsize::MIN,
            },
            Arc::new(BufferPool::new(128, 4)),
            Arc::clone(&stats_transport) as Arc<dyn Transport>,
        );
        let (url, _tally, broadcaster, handle) = start(Some(stats.recorder())).await;

        let http = Http::new(&url, "bench", 1).expect("valid uri");
        let body = BytesMut::from(&b"m v=1i 1\nm v=2i 2\n"[..]).freeze();
        assert!(http.write(body).await.result.is_ok());

        broadcaster.signal();
        handle.await.expect("sink task panicked").expect("sink ran");
        stats.close().await;

        let report = String::from_utf8(stats_transport.received()).expect("valid utf-8");
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("flurry_sink,pid=1 latency_ns="));
        assert!(lines[0].contains(",bytes=18i,lines=2i "));
    }
}
