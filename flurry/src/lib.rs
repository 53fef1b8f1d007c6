//! The flurry write load generator.
//!
//! This library supports the `flurry`, `flurry-sink` and `flurry-linegen`
//! binaries found elsewhere in this project. Lines are encoded into a shared
//! accumulator, flushed in batches onto a bounded queue and written out by a
//! fixed pool of workers. Every write is itself recorded as a line into a
//! second, independent pipeline that reports flurry's own statistics to a
//! remote sink. Shutdown drains both pipelines in order under a deadline.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};

pub mod accumulator;
mod common;
pub mod config;
pub mod dispatch;
pub mod input;
pub mod pipeline;
pub mod pool;
pub mod shutdown;
pub mod signals;
pub mod sink;
pub mod stats;
pub mod transport;
pub mod worker;

pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
