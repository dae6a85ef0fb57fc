use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::metrics::{push_reading, Metric, MetricInfo, SuffixDef};
use crate::reading::{MetricType, ReadingBatch};
use crate::MetricResult;

/// A last-write-wins gauge.
///
/// Emits the most recently recorded value on every snapshot without
/// resetting it. Recording NaN makes the gauge dormant until a real value
/// arrives.
#[derive(Debug)]
pub struct SamplingGauge {
    info: MetricInfo,
    bits: AtomicU64,
}

impl SamplingGauge {
    /// Creates a detached sampling gauge. It stays silent until the first
    /// recorded value.
    #[must_use]
    pub fn new(name: &str, unit: &str, description: &str, tags: &[(&str, &str)]) -> Self {
        Self::from_info(MetricInfo::new(name, unit, description, tags))
    }

    pub(crate) fn from_info(info: MetricInfo) -> Self {
        Self {
            info,
            bits: AtomicU64::new(f64::NAN.to_bits()),
        }
    }

    /// Records a point-in-time value.
    ///
    /// # Errors
    /// `NotAttached` when the gauge is not registered with a source.
    pub fn record(&self, value: f64) -> MetricResult<()> {
        self.info.binding()?;
        self.bits.store(value.to_bits(), Ordering::Relaxed);
        Ok(())
    }
}

impl Metric for SamplingGauge {
    fn info(&self) -> &MetricInfo {
        &self.info
    }

    fn suffixes(&self) -> Vec<SuffixDef> {
        SuffixDef::scalar(MetricType::Gauge)
    }

    fn emit(&self, batch: &mut dyn ReadingBatch, timestamp: SystemTime) {
        let value = f64::from_bits(self.bits.load(Ordering::Relaxed));
        if !value.is_nan() {
            push_reading(batch, &self.info, 0, MetricType::Gauge, value, timestamp);
        }
    }
}

struct EventSample {
    value: f64,
    timestamp: Option<SystemTime>,
}

/// A gauge that reports every recorded sample.
///
/// Each snapshot emits one reading per sample recorded since the previous
/// snapshot, in arrival order, then clears the sample list.
pub struct EventGauge {
    info: MetricInfo,
    samples: Mutex<Vec<EventSample>>,
}

impl EventGauge {
    /// Creates a detached event gauge.
    #[must_use]
    pub fn new(name: &str, unit: &str, description: &str, tags: &[(&str, &str)]) -> Self {
        Self::from_info(MetricInfo::new(name, unit, description, tags))
    }

    pub(crate) fn from_info(info: MetricInfo) -> Self {
        Self {
            info,
            samples: Mutex::new(Vec::new()),
        }
    }

    /// Records a sample stamped with the snapshot tick's time.
    ///
    /// # Errors
    /// `NotAttached` when the gauge is not registered with a source.
    pub fn record(&self, value: f64) -> MetricResult<()> {
        self.push(value, None)
    }

    /// Records a sample with an explicit timestamp.
    ///
    /// # Errors
    /// `NotAttached` when the gauge is not registered with a source.
    pub fn record_at(&self, value: f64, timestamp: SystemTime) -> MetricResult<()> {
        self.push(value, Some(timestamp))
    }

    fn push(&self, value: f64, timestamp: Option<SystemTime>) -> MetricResult<()> {
        self.info.binding()?;
        self.samples.lock().push(EventSample { value, timestamp });
        Ok(())
    }
}

impl Metric for EventGauge {
    fn info(&self) -> &MetricInfo {
        &self.info
    }

    fn suffixes(&self) -> Vec<SuffixDef> {
        SuffixDef::scalar(MetricType::Gauge)
    }

    fn emit(&self, batch: &mut dyn ReadingBatch, timestamp: SystemTime) {
        // Swap the list for a fresh one so recording never races emission.
        let drained = std::mem::take(&mut *self.samples.lock());
        for sample in drained {
            push_reading(
                batch,
                &self.info,
                0,
                MetricType::Gauge,
                sample.value,
                sample.timestamp.unwrap_or(timestamp),
            );
        }
    }
}

/// A gauge whose value is pulled from a callback on every snapshot.
///
/// The callback returning `None` or NaN emits nothing.
pub struct SnapshotGauge {
    info: MetricInfo,
    read: Box<dyn Fn() -> Option<f64> + Send + Sync>,
}

impl SnapshotGauge {
    /// Creates a detached snapshot gauge around `read`.
    #[must_use]
    pub fn new(
        name: &str,
        unit: &str,
        description: &str,
        tags: &[(&str, &str)],
        read: impl Fn() -> Option<f64> + Send + Sync + 'static,
    ) -> Self {
        Self {
            info: MetricInfo::new(name, unit, description, tags),
            read: Box::new(read),
        }
    }
}

impl Metric for SnapshotGauge {
    fn info(&self) -> &MetricInfo {
        &self.info
    }

    fn suffixes(&self) -> Vec<SuffixDef> {
        SuffixDef::scalar(MetricType::Gauge)
    }

    fn emit(&self, batch: &mut dyn ReadingBatch, timestamp: SystemTime) {
        if let Some(value) = (self.read)() {
            if !value.is_nan() {
                push_reading(batch, &self.info, 0, MetricType::Gauge, value, timestamp);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MetricSource;
    use crate::SourceOptions;

    #[test]
    fn sampling_gauge_repeats_last_value() {
        let source = MetricSource::new(SourceOptions::default()).unwrap();
        let gauge = source.add_sampling_gauge("temp", "celsius", "", &[]).unwrap();

        let now = SystemTime::now();
        let mut silent = Vec::new();
        gauge.emit(&mut silent, now);
        assert!(silent.is_empty(), "unrecorded gauge emits nothing");

        gauge.record(21.5).unwrap();
        let mut first = Vec::new();
        gauge.emit(&mut first, now);
        let mut second = Vec::new();
        gauge.emit(&mut second, now);
        assert_eq!(first[0].value, 21.5);
        assert_eq!(second[0].value, 21.5);

        gauge.record(f64::NAN).unwrap();
        let mut third = Vec::new();
        gauge.emit(&mut third, now);
        assert!(third.is_empty());
    }

    #[test]
    fn event_gauge_emits_each_sample_in_order() {
        let source = MetricSource::new(SourceOptions::default()).unwrap();
        let gauge = source.add_event_gauge("latency", "ms", "", &[]).unwrap();
        gauge.record(5.0).unwrap();
        gauge.record(7.0).unwrap();
        gauge.record(6.0).unwrap();

        let now = SystemTime::now();
        let mut readings = Vec::new();
        gauge.emit(&mut readings, now);
        let values: Vec<f64> = readings.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![5.0, 7.0, 6.0]);

        let mut empty = Vec::new();
        gauge.emit(&mut empty, now);
        assert!(empty.is_empty(), "sample list is cleared on emit");
    }

    #[test]
    fn event_gauge_keeps_explicit_timestamps() {
        let source = MetricSource::new(SourceOptions::default()).unwrap();
        let gauge = source.add_event_gauge("events", "", "", &[]).unwrap();
        let stamp = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        gauge.record_at(1.0, stamp).unwrap();

        let mut readings = Vec::new();
        gauge.emit(&mut readings, SystemTime::now());
        assert_eq!(readings[0].timestamp, stamp);
    }

    #[test]
    fn snapshot_gauge_skips_none_and_nan() {
        let source = MetricSource::new(SourceOptions::default()).unwrap();
        let none = source
            .add_snapshot_gauge("pool.none", "", "", &[], || None)
            .unwrap();
        let nan = source
            .add_snapshot_gauge("pool.nan", "", "", &[], || Some(f64::NAN))
            .unwrap();
        let live = source
            .add_snapshot_gauge("pool.live", "", "", &[], || Some(3.5))
            .unwrap();

        let now = SystemTime::now();
        let mut readings = Vec::new();
        none.emit(&mut readings, now);
        nan.emit(&mut readings, now);
        live.emit(&mut readings, now);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, 3.5);
    }
}
