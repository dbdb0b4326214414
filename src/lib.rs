//! A buffered, batching sender for pushing metrics, distributions and tracing spans to
//! Wavefront.
//!
//! ## Basics
//!
//! `metrics-exporter-wavefront` encodes telemetry into the Wavefront line protocol, buffers it
//! in memory and delivers it in batches, either straight to a Wavefront cluster over HTTP(S) or
//! through a Wavefront proxy over TCP.
//!
//! ## High-level features
//!
//! - metric points, distributions (minute/hour/day granularities), tracing spans and span logs
//! - validation and sanitisation of names, sources and tags before anything is buffered
//! - bounded per-kind buffers that never block the caller
//! - byte-capped batching, retries of rejected batches, and permanent disabling of kinds the
//!   account is not entitled to
//! - self-metrics reported through the [`metrics`](https://docs.rs/metrics) facade
//!
//! ## Behavior
//!
//! This sender makes some explicit trade-offs to accomplish its task:
//!
//! - Sending is fire-and-forget: when a buffer is full the entity is dropped and counted
//! - Each flush cycle takes at most a batch of records off each buffer
//! - Batches rejected by the backend (4xx/5xx) are put back at the tail of their buffer
//! - A 401 or 403 for distributions, spans or span logs disables that kind until restart
//! - A transport failure drops the rest of that kind's batch for the cycle
//!
//! ## Usage
//!
//! ```ignore
//! // First, create a builder and point it at a destination.
//! let builder = WavefrontBuilder::new()
//!     .with_direct_ingestion("https://domain.wavefront.com", Some(token))?;
//!
//! // Normally, most users will want to "install" the sender, which spawns the flush loop.
//! //
//! // If you're already inside a Tokio runtime, the loop is spawned on that runtime, and
//! // otherwise, a new background thread will be spawned which a Tokio single-threaded
//! // runtime is launched on to, where the loop then runs:
//! let sender = builder.install()?;
//!
//! sender.send_metric("new-york.power.usage", 42422.0, None, Some("localhost"), None)?;
//!
//! // Flush what is left and stop the loop.
//! sender.close().await;
//!
//! // If you want to schedule the flush loop yourself, build the sender and the loop instead:
//! let (sender, exporter) = builder.build()?;
//!
//! // Or build just the sender and call `flush` when it suits you:
//! let sender = builder.build_sender()?;
//! ```
mod common;
pub use self::common::{
    BuildError, EntityKind, ReportError, ValidationError, HISTOGRAM_FORMAT, METRIC_FORMAT,
    SPAN_LOG_FORMAT, TRACING_SPAN_FORMAT,
};

mod entities;
pub use self::entities::{Centroid, HistogramGranularity, SpanLog, Tags};

mod builder;
pub use self::builder::{ExporterFuture, WavefrontBuilder};

pub mod formatting;

mod buffer;
mod dedup;
pub use self::dedup::MessageDedupingLogger;

mod hostname;
mod recorder;
mod registry;

pub mod transport;
pub use self::transport::{HttpTransport, ProxyTransport, Transport};

pub use self::recorder::{EntityStats, WavefrontSender};
