//! # tidemark-metrics
//!
//! An in-process metrics client with client-side aggregation and buffered
//! shipping to OpenTSDB, StatsD/DogStatsD and SignalFx endpoints.
//!
//! ## Features
//!
//! - **Typed metric objects**: counters, cumulative counters, sampling /
//!   event / snapshot gauges and statistical aggregate gauges, registered
//!   once and updated from any thread
//! - **Tagged families**: per-tag-combination series materialized lazily
//!   from typed tag tuples
//! - **Client-Side Aggregation**: aggregate gauges compute count, sum,
//!   min, max, last and percentiles over each reporting window
//! - **Buffered shipping**: per-endpoint payload buffers with bounded
//!   queues, retry and drop-oldest overflow handling
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tidemark_metrics::{
//!     AggregatorSpec, BufferedHandler, CollectorOptions, MetricSource, MetricsCollector,
//!     OpenTsdbEndpoint, SourceOptions, StatsdEndpoint,
//! };
//!
//! let source = Arc::new(MetricSource::new(SourceOptions::default()).unwrap());
//! let requests = source
//!     .add_counter("requests", "requests", "HTTP requests served", &[])
//!     .unwrap();
//! let latency = source
//!     .add_aggregate_gauge(
//!         "latency",
//!         "milliseconds",
//!         "request latency",
//!         &[],
//!         vec![
//!             AggregatorSpec::average(),
//!             AggregatorSpec::percentile(0.99).unwrap(),
//!             AggregatorSpec::count(),
//!         ],
//!     )
//!     .unwrap();
//!
//! let opentsdb = BufferedHandler::new(
//!     "opentsdb",
//!     OpenTsdbEndpoint::new(Some("http://tsdb.example.com:8070")).unwrap(),
//! );
//! let statsd = BufferedHandler::new(
//!     "statsd",
//!     StatsdEndpoint::new(
//!         "0.0.0.0:0".parse().unwrap(),
//!         Some("127.0.0.1:8125".parse().unwrap()),
//!     )
//!     .unwrap(),
//! )
//! .with_limits(1432, 240);
//!
//! let mut collector = MetricsCollector::new(CollectorOptions {
//!     sources: vec![source.clone()],
//!     endpoints: vec![opentsdb, statsd],
//!     snapshot_interval: Duration::from_secs(30),
//!     ..CollectorOptions::default()
//! });
//! collector.start().unwrap();
//!
//! requests.increment().unwrap();
//! latency.record(12.5).unwrap();
//!
//! collector.stop().unwrap();
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![warn(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

mod collector;
mod error;
mod handler;
mod metrics;
mod options;
mod reading;
mod source;

pub use collector::{
    AfterSendHook, AfterSerializationHook, BeforeSerializationHook, CollectorOptions,
    ExceptionHandler, MetricsCollector, SerializationInfo,
};
pub use error::MetricsError;
pub use handler::{
    AfterSendInfo, BufferedHandler, EndpointEncoder, MetricBatch, OpenTsdbEndpoint, PayloadType,
    PostError, SignalFxEndpoint, StatsdEndpoint, DEFAULT_MAX_PAYLOAD_COUNT,
    DEFAULT_MAX_PAYLOAD_SIZE,
};
pub use metrics::{
    AggregateGauge, AggregateMode, AggregatorSpec, Counter, CumulativeCounter, EventGauge,
    FamilyMetric, Metric, MetricInfo, SamplingGauge, SnapshotCounter, SnapshotGauge, SuffixDef,
    TagDescriptor, TagSet, TagValue, TaggedMetricFamily,
};
pub use options::{default_name_ok, default_value_ok, NameTransformer, NameValidator, SourceOptions};
pub use reading::{Metadata, MetadataKind, MetricType, Reading, ReadingBatch, TagMap};
pub use source::{MetricSource, ScalarMetric};
#[doc(hidden)]
pub use source::Registered;

/// Result type for metric operations.
///
/// Wraps errors that can occur during registration, recording and
/// transmission.
pub type MetricResult<T> = Result<T, MetricsError>;
