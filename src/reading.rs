use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::MetricResult;

/// An ordered tag-name to tag-value mapping.
///
/// Ordering is by tag name, which keeps serialized tag sets stable across
/// snapshots regardless of the order tags were declared in.
pub type TagMap = BTreeMap<Arc<str>, Arc<str>>;

/// The wire-visible kind of a reading, used by encoders to pick the payload
/// type and the remote rate semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    /// A delta counter: each reading carries the increment since the
    /// previous snapshot.
    Counter,
    /// A monotonic counter: each reading carries the running total.
    CumulativeCounter,
    /// A point-in-time measurement.
    Gauge,
}

impl MetricType {
    /// The value of the "rate" metadata fact for this kind.
    #[must_use]
    pub const fn rate_value(self) -> &'static str {
        match self {
            Self::Counter | Self::CumulativeCounter => "counter",
            Self::Gauge => "gauge",
        }
    }
}

/// One immutable sample emitted by a metric at one timestamp.
#[derive(Debug, Clone)]
pub struct Reading {
    /// Full metric name, including the aggregator suffix when present.
    pub name: Arc<str>,
    /// Wire-visible kind.
    pub metric_type: MetricType,
    /// Sample value. Counters are non-negative integers widened to `f64`.
    pub value: f64,
    /// Union of the source's default tags and the metric's own tags, with
    /// the metric's own keys winning on collision.
    pub tags: TagMap,
    /// Capture time of the snapshot tick that produced this reading.
    pub timestamp: SystemTime,
}

impl Reading {
    /// Milliseconds since the Unix epoch, as encoders put on the wire.
    #[must_use]
    pub fn timestamp_millis(&self) -> u64 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

/// The kind of fact a [`Metadata`] entry states about a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKind {
    /// How the remote side should interpret successive values.
    Rate,
    /// Human-readable description.
    Description,
    /// Unit of measurement.
    Unit,
}

impl MetadataKind {
    /// Wire name of this fact kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rate => "rate",
            Self::Description => "desc",
            Self::Unit => "unit",
        }
    }
}

/// One immutable fact about a metric, sent to sinks that support metadata.
#[derive(Debug, Clone)]
pub struct Metadata {
    /// Full metric name the fact applies to, including suffix.
    pub metric: Arc<str>,
    /// Which fact this is.
    pub name: MetadataKind,
    /// The metric's own tags (default tags are not part of metadata).
    pub tags: TagMap,
    /// The fact's value.
    pub value: Arc<str>,
}

/// A consumer of readings produced during one snapshot tick.
///
/// The collector hands every metric a batch that fans readings out to all
/// endpoint buffers; tests can collect into a plain `Vec<Reading>`.
pub trait ReadingBatch {
    /// Accepts one reading.
    ///
    /// # Errors
    /// Returns an error when an endpoint buffer rejects the reading
    /// (encoder refusal or queue overflow). The reading may still have been
    /// accepted by other consumers.
    fn add(&mut self, reading: &Reading) -> MetricResult<()>;
}

impl ReadingBatch for Vec<Reading> {
    fn add(&mut self, reading: &Reading) -> MetricResult<()> {
        self.push(reading.clone());
        Ok(())
    }
}
