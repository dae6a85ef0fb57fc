//! Metric primitives and the tagged-family machinery.
//!
//! Every primitive is cheap to update from any thread and knows how to emit
//! itself into a [`ReadingBatch`] on the collector's snapshot tick.

use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use crate::error::MetricsError;
use crate::reading::{MetricType, Reading, ReadingBatch, TagMap};
use crate::source::SourceShared;
use crate::MetricResult;

mod aggregate;
mod counter;
mod gauge;
mod tagged;

pub use aggregate::{AggregateGauge, AggregateMode, AggregatorSpec};
pub use counter::{Counter, CumulativeCounter, SnapshotCounter};
pub use gauge::{EventGauge, SamplingGauge, SnapshotGauge};
pub use tagged::{FamilyMetric, TagDescriptor, TagSet, TagValue, TaggedMetricFamily};

/// Describes one reading a metric contributes per snapshot tick.
///
/// Scalar metrics have a single empty suffix; aggregate gauges have one
/// suffix per configured aggregator.
#[derive(Debug, Clone)]
pub struct SuffixDef {
    /// Appended to the metric name on every reading (may be empty).
    pub suffix: String,
    /// Extra sentence appended to the metric description in metadata, e.g.
    /// `"(95th percentile)"`. Empty for scalar metrics.
    pub description: String,
    /// Wire-visible kind of the readings carrying this suffix.
    pub metric_type: MetricType,
}

impl SuffixDef {
    pub(crate) fn scalar(metric_type: MetricType) -> Vec<Self> {
        vec![Self {
            suffix: String::new(),
            description: String::new(),
            metric_type,
        }]
    }
}

/// State a metric receives when it is attached to a source.
#[derive(Debug)]
pub(crate) struct Binding {
    /// Transformed metric name.
    pub name: Arc<str>,
    /// Transformed name + suffix, in [`Metric::suffixes`] order.
    pub full_names: Vec<Arc<str>>,
    /// The metric's own transformed tag pairs.
    pub own_tags: TagMap,
    /// The owning source's shared state (options and default tags).
    pub shared: Arc<SourceShared>,
}

impl Binding {
    /// Resolves the tag set for one reading: a single default-tag snapshot
    /// unioned with the metric's own tags, own keys winning.
    pub fn reading_tags(&self) -> TagMap {
        let defaults = self.shared.default_tags.load_full();
        let mut tags = (*defaults).clone();
        for (k, v) in &self.own_tags {
            tags.insert(k.clone(), v.clone());
        }
        tags
    }
}

/// Name, unit, description and own tags shared by every metric primitive.
///
/// Holds the attachment state: a metric constructed directly starts
/// detached and rejects updates with `NotAttached` until it is registered
/// with a [`MetricSource`](crate::MetricSource).
#[derive(Debug)]
pub struct MetricInfo {
    name: String,
    unit: String,
    description: String,
    raw_tags: Vec<(String, String)>,
    binding: OnceLock<Binding>,
}

impl MetricInfo {
    pub(crate) fn new(
        name: impl Into<String>,
        unit: impl Into<String>,
        description: impl Into<String>,
        tags: &[(&str, &str)],
    ) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            description: description.into(),
            raw_tags: tags
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            binding: OnceLock::new(),
        }
    }

    /// The raw (untransformed) metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unit of measurement; empty when not specified.
    #[must_use]
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Human-readable description; empty when not specified.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether the metric has been attached to a source.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.binding.get().is_some()
    }

    pub(crate) fn raw_tags(&self) -> &[(String, String)] {
        &self.raw_tags
    }

    pub(crate) fn bind(&self, binding: Binding) -> MetricResult<()> {
        self.binding.set(binding).map_err(|_| MetricsError::Duplicate {
            name: self.name.clone(),
        })
    }

    pub(crate) fn binding(&self) -> MetricResult<&Binding> {
        self.binding.get().ok_or_else(|| MetricsError::NotAttached {
            name: self.name.clone(),
        })
    }

    /// Builds one reading for the suffix at `index`, or `None` while the
    /// metric is detached.
    pub(crate) fn reading(
        &self,
        index: usize,
        metric_type: MetricType,
        value: f64,
        timestamp: SystemTime,
    ) -> Option<Reading> {
        let binding = self.binding.get()?;
        let name = binding.full_names.get(index)?.clone();
        Some(Reading {
            name,
            metric_type,
            value,
            tags: binding.reading_tags(),
            timestamp,
        })
    }
}

/// A named, typed accumulator attached to one source.
///
/// Implemented by the seven metric primitives and by tagged families. The
/// snapshot loop drives [`Metric::emit`]; updates happen through the
/// concrete types.
pub trait Metric: Send + Sync + 'static {
    /// Identity and attachment state.
    fn info(&self) -> &MetricInfo;

    /// The readings this metric can contribute per tick, one per suffix.
    fn suffixes(&self) -> Vec<SuffixDef>;

    /// Emits readings for the current window into `batch`.
    ///
    /// Called from the snapshot loop; must be consistent with concurrent
    /// updates. Errors from the batch are the batch owner's to route, so
    /// emission itself is infallible.
    fn emit(&self, batch: &mut dyn ReadingBatch, timestamp: SystemTime);
}

pub(crate) fn push_reading(
    batch: &mut dyn ReadingBatch,
    info: &MetricInfo,
    index: usize,
    metric_type: MetricType,
    value: f64,
    timestamp: SystemTime,
) {
    if let Some(reading) = info.reading(index, metric_type, value, timestamp) {
        // Batch-side failures (encoder refusal, queue overflow) are routed
        // by the batch owner, not the metric.
        let _ = batch.add(&reading);
    }
}
