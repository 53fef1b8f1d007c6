//! Where batches go.
//!
//! The [`Transport`] trait is the only thing the worker pools know about the
//! outside world. [`Http`] writes to a line protocol server over HTTP;
//! [`memory::Memory`] keeps everything in process and can be told to fail or
//! hang, for testing.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use http::{
    Method, Request, StatusCode, Uri,
    header::{CONTENT_LENGTH, CONTENT_TYPE},
};
use http_body_util::{BodyExt, combinators::BoxBody};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use serde::Serialize;
use tokio::time::{Duration, Instant};

/// Errors produced by a [`Transport`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The server answered with something other than `204 No Content`.
    #[error("Write rejected with status {status}: {body}")]
    Status {
        /// Response status
        status: StatusCode,
        /// Response body, lossily decoded
        body: String,
    },
    /// The request could not be completed.
    #[error("Failed to send write request to {uri}: {source}")]
    RequestFailed {
        /// Target URI
        uri: String,
        /// Underlying client error
        #[source]
        source: Box<hyper_util::client::legacy::Error>,
    },
    /// Wrapper around [`hyper::Error`].
    #[error("Hyper error: {0}")]
    Hyper(#[from] hyper::Error),
    /// Wrapper around [`http::Error`].
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),
    /// The endpoint did not form a valid URI.
    #[error("Invalid write URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
    /// The write query string could not be encoded.
    #[error("Failed to encode write query: {0}")]
    Query(#[from] serde_qs::Error),
}

/// The outcome of one [`Transport::write`].
#[derive(Debug)]
pub struct Write {
    /// Wall time spent on the write, reported on failure as well
    pub latency: Duration,
    /// Whether the write was accepted
    pub result: Result<(), Error>,
}

/// A destination for batches.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Submit one batch. Never retries.
    async fn write(&self, body: Bytes) -> Write;
}

#[derive(Serialize)]
struct WriteQuery<'a> {
    db: &'a str,
}

/// Line protocol over HTTP.
///
/// Batches are POSTed as `text/plain` to `<endpoint>/write?db=<database>`.
/// Only `204 No Content` counts as success.
#[derive(Debug, Clone)]
pub struct Http {
    uri: Uri,
    client: Client<HttpConnector, BoxBody<Bytes, hyper::Error>>,
}

impl Http {
    /// Create a new [`Http`] transport.
    ///
    /// `endpoint` may omit its scheme, in which case `http://` is assumed.
    ///
    /// # Errors
    ///
    /// Function will return an error if the endpoint and database do not form
    /// a valid URI.
    pub fn new(endpoint: &str, database: &str, max_idle_connections: usize) -> Result<Self, Error> {
        let uri = write_uri(endpoint, database)?;
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(max_idle_connections)
            .retry_canceled_requests(false)
            .build_http();
        Ok(Self { uri, client })
    }

    /// The URI batches are written to.
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    async fn post(&self, body: Bytes) -> Result<(), Error> {
        let length = body.len();
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.uri.clone())
            .header(CONTENT_TYPE, "text/plain")
            .header(CONTENT_LENGTH, length)
            .body(crate::full(body))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|source| Error::RequestFailed {
                uri: self.uri.to_string(),
                source: Box::new(source),
            })?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();

        if status == StatusCode::NO_CONTENT {
            Ok(())
        } else {
            Err(Error::Status {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            })
        }
    }
}

#[async_trait]
impl Transport for Http {
    async fn write(&self, body: Bytes) -> Write {
        let start = Instant::now();
        let result = self.post(body).await;
        Write {
            latency: start.elapsed(),
            result,
        }
    }
}

fn write_uri(endpoint: &str, database: &str) -> Result<Uri, Error> {
    let endpoint = endpoint.trim_end_matches('/');
    let query = serde_qs::to_string(&WriteQuery { db: database })?;
    let uri = if endpoint.contains("://") {
        format!("{endpoint}/write?{query}")
    } else {
        format!("http://{endpoint}/write?{query}")
    };
    Ok(uri.parse()?)
}

pub mod memory {
    //! An in-process [`Transport`] for tests.

    use std::sync::{Mutex, PoisonError};

    use async_trait::async_trait;
    use bytes::Bytes;
    use http::StatusCode;
    use tokio::time::{Duration, Instant};

    use super::{Error, Transport, Write};

    /// How [`Memory`] answers writes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Behavior {
        /// Every write succeeds.
        Accept,
        /// Every write fails with a 500 status.
        Reject,
        /// Every write hangs forever.
        Stall,
    }

    /// Records every body it is handed.
    ///
    /// Bodies are copied so that callers can recycle the originals.
    #[derive(Debug)]
    pub struct Memory {
        behavior: Behavior,
        latency: Duration,
        writes: Mutex<Vec<Bytes>>,
    }

    impl Memory {
        /// Create a new [`Memory`] transport with no added latency.
        #[must_use]
        pub fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                latency: Duration::ZERO,
                writes: Mutex::new(Vec::new()),
            }
        }

        /// Delay every write by `latency`.
        #[must_use]
        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        /// Every body received so far, in arrival order.
        #[must_use]
        pub fn writes(&self) -> Vec<Bytes> {
            self.writes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Every body received so far, concatenated.
        #[must_use]
        pub fn received(&self) -> Vec<u8> {
            self.writes().concat()
        }
    }

    #[async_trait]
    impl Transport for Memory {
        async fn write(&self, body: Bytes) -> Write {
            let start = Instant::now();
            self.writes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Bytes::copy_from_slice(&body));
            drop(body);

            if self.behavior == Behavior::Stall {
                return std::future::pending().await;
            }
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            let result = match self.behavior {
                Behavior::Reject => Err(Error::Status {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    body: "rejected".to_string(),
                }),
                Behavior::Accept | Behavior::Stall => Ok(()),
            };
            Write {
                latency: start.elapsed(),
                result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_without_scheme_gets_http() {
        let uri = write_uri("localhost:8086", "bench").expect("valid uri");
        assert_eq!(uri.to_string(), "http://localhost:8086/write?db=bench");
    }

    #[test]
    fn endpoint_with_scheme_and_trailing_slash() {
        let uri = write_uri("http://10.0.0.1:9999/", "db").expect("valid uri");
        assert_eq!(uri.to_string(), "http://10.0.0.1:9999/write?db=db");
    }

    #[test]
    fn database_is_query_escaped() {
        let uri = write_uri("localhost:8086", "my db&x").expect("valid uri");
        let query = uri.query().expect("query present");
        assert!(!query.contains(' '));
        assert!(!query.contains("&x"));
        assert!(query.starts_with("db=my"));
    }

    #[tokio::test(start_paused = true)]
    async fn memory_reports_latency_and_rejects() {
        let transport = memory::Memory::new(memory::Behavior::Reject)
            .with_latency(Duration::from_millis(25));
        let write = transport.write(Bytes::from_static(b"m a=1i 1\n")).await;

        assert_eq!(write.latency, Duration::from_millis(25));
        assert!(matches!(
            write.result,
            Err(Error::Status { status, .. }) if status == StatusCode::INTERNAL_SERVER_ERROR
        ));
        assert_eq!(transport.received(), b"m a=1i 1\n");
    }
}
