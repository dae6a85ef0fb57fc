use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::metrics::{push_reading, Metric, MetricInfo, SuffixDef};
use crate::reading::{MetricType, ReadingBatch};
use crate::MetricResult;

#[allow(clippy::cast_precision_loss)]
fn widen(value: u64) -> f64 {
    value as f64
}

/// A delta counter.
///
/// Each snapshot emits the increments accumulated since the previous
/// snapshot and resets to zero. A window with no increments emits nothing.
#[derive(Debug)]
pub struct Counter {
    info: MetricInfo,
    delta: AtomicU64,
}

impl Counter {
    /// Creates a detached counter. Updates fail with `NotAttached` until it
    /// is registered with a source.
    #[must_use]
    pub fn new(name: &str, unit: &str, description: &str, tags: &[(&str, &str)]) -> Self {
        Self::from_info(MetricInfo::new(name, unit, description, tags))
    }

    pub(crate) fn from_info(info: MetricInfo) -> Self {
        Self {
            info,
            delta: AtomicU64::new(0),
        }
    }

    /// Increments the counter by one.
    ///
    /// # Errors
    /// `NotAttached` when the counter is not registered with a source.
    pub fn increment(&self) -> MetricResult<()> {
        self.increment_by(1)
    }

    /// Increments the counter by `n`.
    ///
    /// # Errors
    /// `NotAttached` when the counter is not registered with a source.
    pub fn increment_by(&self, n: u64) -> MetricResult<()> {
        self.info.binding()?;
        self.delta.fetch_add(n, Ordering::Relaxed);
        Ok(())
    }
}

impl Metric for Counter {
    fn info(&self) -> &MetricInfo {
        &self.info
    }

    fn suffixes(&self) -> Vec<SuffixDef> {
        SuffixDef::scalar(MetricType::Counter)
    }

    fn emit(&self, batch: &mut dyn ReadingBatch, timestamp: SystemTime) {
        let delta = self.delta.swap(0, Ordering::Relaxed);
        if delta > 0 {
            push_reading(batch, &self.info, 0, MetricType::Counter, widen(delta), timestamp);
        }
    }
}

/// A monotonic counter.
///
/// Each snapshot emits the running total without resetting it. A zero total
/// emits nothing.
pub struct CumulativeCounter {
    info: MetricInfo,
    total: AtomicU64,
}

impl CumulativeCounter {
    /// Creates a detached cumulative counter.
    #[must_use]
    pub fn new(name: &str, unit: &str, description: &str, tags: &[(&str, &str)]) -> Self {
        Self::from_info(MetricInfo::new(name, unit, description, tags))
    }

    pub(crate) fn from_info(info: MetricInfo) -> Self {
        Self {
            info,
            total: AtomicU64::new(0),
        }
    }

    /// Increments the running total by one.
    ///
    /// # Errors
    /// `NotAttached` when the counter is not registered with a source.
    pub fn increment(&self) -> MetricResult<()> {
        self.increment_by(1)
    }

    /// Increments the running total by `n`.
    ///
    /// # Errors
    /// `NotAttached` when the counter is not registered with a source.
    pub fn increment_by(&self, n: u64) -> MetricResult<()> {
        self.info.binding()?;
        self.total.fetch_add(n, Ordering::Relaxed);
        Ok(())
    }
}

impl Metric for CumulativeCounter {
    fn info(&self) -> &MetricInfo {
        &self.info
    }

    fn suffixes(&self) -> Vec<SuffixDef> {
        SuffixDef::scalar(MetricType::CumulativeCounter)
    }

    fn emit(&self, batch: &mut dyn ReadingBatch, timestamp: SystemTime) {
        let total = self.total.load(Ordering::Relaxed);
        if total > 0 {
            push_reading(
                batch,
                &self.info,
                0,
                MetricType::CumulativeCounter,
                widen(total),
                timestamp,
            );
        }
    }
}

/// A counter whose value is pulled from a callback on every snapshot.
///
/// The callback returning `None` or `0` emits nothing.
pub struct SnapshotCounter {
    info: MetricInfo,
    read: Box<dyn Fn() -> Option<i64> + Send + Sync>,
}

impl SnapshotCounter {
    /// Creates a detached snapshot counter around `read`.
    #[must_use]
    pub fn new(
        name: &str,
        unit: &str,
        description: &str,
        tags: &[(&str, &str)],
        read: impl Fn() -> Option<i64> + Send + Sync + 'static,
    ) -> Self {
        Self {
            info: MetricInfo::new(name, unit, description, tags),
            read: Box::new(read),
        }
    }
}

impl Metric for SnapshotCounter {
    fn info(&self) -> &MetricInfo {
        &self.info
    }

    fn suffixes(&self) -> Vec<SuffixDef> {
        SuffixDef::scalar(MetricType::Counter)
    }

    #[allow(clippy::cast_precision_loss)]
    fn emit(&self, batch: &mut dyn ReadingBatch, timestamp: SystemTime) {
        match (self.read)() {
            None | Some(0) => {}
            Some(value) => {
                push_reading(
                    batch,
                    &self.info,
                    0,
                    MetricType::Counter,
                    value as f64,
                    timestamp,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MetricsError;
    use crate::source::MetricSource;
    use crate::SourceOptions;

    #[test]
    fn detached_counter_rejects_updates() {
        let counter = Counter::new("requests", "", "", &[]);
        assert!(matches!(
            counter.increment(),
            Err(MetricsError::NotAttached { name }) if name == "requests"
        ));
    }

    #[test]
    fn counter_emits_delta_and_resets() {
        let source = MetricSource::new(SourceOptions::default()).unwrap();
        let counter = source.add_counter("requests", "", "", &[]).unwrap();
        counter.increment().unwrap();
        counter.increment().unwrap();

        let now = SystemTime::now();
        let mut readings = Vec::new();
        counter.emit(&mut readings, now);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, 2.0);
        assert_eq!(readings[0].metric_type, MetricType::Counter);

        let mut again = Vec::new();
        counter.emit(&mut again, now);
        assert!(again.is_empty(), "zero-valued counters emit nothing");
    }

    #[test]
    fn cumulative_counter_keeps_total() {
        let source = MetricSource::new(SourceOptions::default()).unwrap();
        let counter = source
            .add_cumulative_counter("bytes.total", "bytes", "", &[])
            .unwrap();
        counter.increment_by(3).unwrap();
        counter.increment_by(4).unwrap();

        let now = SystemTime::now();
        let mut first = Vec::new();
        counter.emit(&mut first, now);
        let mut second = Vec::new();
        counter.emit(&mut second, now);

        assert_eq!(first[0].value, 7.0);
        assert_eq!(second[0].value, 7.0);
    }

    #[test]
    fn snapshot_counter_skips_none_and_zero() {
        let source = MetricSource::new(SourceOptions::default()).unwrap();
        let empty = source
            .add_snapshot_counter("queue.depth", "", "", &[], || None)
            .unwrap();
        let zero = source
            .add_snapshot_counter("queue.zero", "", "", &[], || Some(0))
            .unwrap();
        let live = source
            .add_snapshot_counter("queue.live", "", "", &[], || Some(12))
            .unwrap();

        let now = SystemTime::now();
        let mut readings = Vec::new();
        empty.emit(&mut readings, now);
        zero.emit(&mut readings, now);
        live.emit(&mut readings, now);

        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, 12.0);
    }
}
