//! The HTTP accept loop shared by servers in this crate.
//!
//! ## Metrics
//!
//! `connection_limit`: Configured maximum of concurrent connections
//! `connections_open`: Connections being served
//! `connections_accepted`: Connections handed to the service
//! `connections_shed`: Connections closed unserved, over the limit
//! `accept_errors`: Failed accepts

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::combinators::BoxBody;
use hyper::{body::Incoming, service::Service};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use metrics::{counter, gauge};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

use crate::signals::Watcher;

/// Errors produced by [`run_httpd`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serve connections accepted on `listener` until `shutdown` fires, then give
/// open connections `linger` to finish before dropping them.
///
/// At most `concurrency_limit` connections are served at once. Connections
/// past the limit are closed as soon as they are accepted.
pub(crate) async fn run_httpd<SF, S>(
    listener: TcpListener,
    concurrency_limit: usize,
    shutdown: Watcher,
    linger: Duration,
    labels: Vec<(String, String)>,
    make_service: SF,
) -> Result<(), Error>
where
    SF: Send + Sync + 'static + Clone + Fn() -> S,
    S: Service<Request<Incoming>, Response = Response<BoxBody<Bytes, hyper::Error>>, Error = hyper::Error>
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    info!("Listening on {}", listener.local_addr()?);
    let permits = Arc::new(Semaphore::new(concurrency_limit));
    let mut connections = JoinSet::new();
    gauge!("connection_limit", &labels).set(concurrency_limit as f64);

    let stop = shutdown.recv();
    tokio::pin!(stop);
    loop {
        gauge!("connections_open", &labels)
            .set((concurrency_limit - permits.available_permits()) as f64);
        let (stream, addr) = tokio::select! {
            () = &mut stop => {
                info!("Shutdown signal received, no longer accepting connections");
                break;
            }
            incoming = listener.accept() => match incoming {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!("Failed to accept connection: {err}");
                    counter!("accept_errors", &labels).increment(1);
                    continue;
                }
            },
        };

        // The permit lives as long as the connection task.
        let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
            warn!("Connection from {addr} over the limit of {concurrency_limit}, closing");
            counter!("connections_shed", &labels).increment(1);
            drop(stream);
            continue;
        };
        counter!("connections_accepted", &labels).increment(1);
        connections.spawn(serve(stream, addr, permit, make_service()));
    }

    drop(listener);
    let drained = tokio::time::timeout(linger, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        debug!("Dropping {} connections still open", connections.len());
        connections.shutdown().await;
    }
    Ok(())
}

async fn serve<S>(stream: TcpStream, addr: SocketAddr, permit: OwnedSemaphorePermit, service: S)
where
    S: Service<Request<Incoming>, Response = Response<BoxBody<Bytes, hyper::Error>>, Error = hyper::Error>
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    debug!("Serving connection from {addr}");
    let builder = auto::Builder::new(TokioExecutor::new());
    if let Err(err) = builder
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        error!("Error serving {addr}: {err}");
    }
    drop(permit);
}
