use std::time::SystemTime;

use parking_lot::Mutex;

use crate::error::MetricsError;
use crate::metrics::{push_reading, Metric, MetricInfo, SuffixDef};
use crate::reading::{MetricType, ReadingBatch};
use crate::MetricResult;

/// The statistic one aggregator computes over a reporting window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AggregateMode {
    /// Arithmetic mean of the window.
    Average,
    /// 50th percentile (nearest rank).
    Median,
    /// Largest recorded value.
    Max,
    /// Smallest recorded value.
    Min,
    /// Most recently recorded value.
    Last,
    /// Number of recorded values.
    Count,
    /// Arbitrary percentile, `p` in `[0, 1]`, nearest rank.
    Percentile(f64),
}

/// One aggregator attached to an [`AggregateGauge`]: a statistic plus the
/// name suffix its readings carry.
#[derive(Debug, Clone)]
pub struct AggregatorSpec {
    mode: AggregateMode,
    suffix: String,
}

impl AggregatorSpec {
    /// Mean of the window, suffix `_avg`.
    #[must_use]
    pub fn average() -> Self {
        Self {
            mode: AggregateMode::Average,
            suffix: "_avg".to_owned(),
        }
    }

    /// Median of the window, suffix `_median`.
    #[must_use]
    pub fn median() -> Self {
        Self {
            mode: AggregateMode::Median,
            suffix: "_median".to_owned(),
        }
    }

    /// Maximum of the window, suffix `_max`.
    #[must_use]
    pub fn max() -> Self {
        Self {
            mode: AggregateMode::Max,
            suffix: "_max".to_owned(),
        }
    }

    /// Minimum of the window, suffix `_min`.
    #[must_use]
    pub fn min() -> Self {
        Self {
            mode: AggregateMode::Min,
            suffix: "_min".to_owned(),
        }
    }

    /// Last value of the window, suffix `_last`.
    #[must_use]
    pub fn last() -> Self {
        Self {
            mode: AggregateMode::Last,
            suffix: "_last".to_owned(),
        }
    }

    /// Count of recorded values, suffix `_count`.
    #[must_use]
    pub fn count() -> Self {
        Self {
            mode: AggregateMode::Count,
            suffix: "_count".to_owned(),
        }
    }

    /// Percentile of the window; `p` must be within `[0, 1]`. The default
    /// suffix is the percentile scaled to 0-100, e.g. `_95` or `_99.9`.
    ///
    /// # Errors
    /// `Custom` when `p` is outside `[0, 1]` or not finite.
    pub fn percentile(p: f64) -> MetricResult<Self> {
        if !p.is_finite() || !(0.0..=1.0).contains(&p) {
            return Err(MetricsError::Custom(format!(
                "Percentile must be within [0, 1], got {p}"
            )));
        }
        Ok(Self {
            mode: AggregateMode::Percentile(p),
            suffix: format!("_{}", percentile_label(p)),
        })
    }

    /// Replaces the default suffix.
    #[must_use]
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// The statistic this aggregator computes.
    #[must_use]
    pub const fn mode(&self) -> AggregateMode {
        self.mode
    }

    /// The name suffix readings of this aggregator carry.
    #[must_use]
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    fn description(&self) -> String {
        match self.mode {
            AggregateMode::Average => "(average)".to_owned(),
            AggregateMode::Median => "(median)".to_owned(),
            AggregateMode::Max => "(maximum)".to_owned(),
            AggregateMode::Min => "(minimum)".to_owned(),
            AggregateMode::Last => "(last)".to_owned(),
            AggregateMode::Count => "(count of recorded events)".to_owned(),
            AggregateMode::Percentile(p) => {
                format!("({} percentile)", ordinal(&percentile_label(p)))
            }
        }
    }
}

/// The percentile scaled to 0-100 with float noise trimmed, e.g. `95` or
/// `99.9`.
fn percentile_label(p: f64) -> String {
    let mut label = format!("{:.4}", p * 100.0);
    while label.ends_with('0') {
        label.pop();
    }
    if label.ends_with('.') {
        label.pop();
    }
    label
}

fn ordinal(label: &str) -> String {
    let Ok(n) = label.parse::<u64>() else {
        return format!("{label}th");
    };
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

#[derive(Debug)]
struct AggregateState {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    last: f64,
    samples: Vec<f64>,
}

impl AggregateState {
    const fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            last: f64::NAN,
            samples: Vec::new(),
        }
    }
}

/// A gauge computing a configurable set of statistics over each reporting
/// window.
///
/// Recording is cheap (one short lock); the snapshot loop atomically
/// snapshots-and-resets the window, then computes percentiles outside the
/// lock. An empty window emits only a zero `_count` reading (when a count
/// aggregator is configured) so quiet windows stay observable.
#[derive(Debug)]
pub struct AggregateGauge {
    info: MetricInfo,
    aggregators: Vec<AggregatorSpec>,
    tracks_sum: bool,
    tracks_last: bool,
    tracks_min: bool,
    tracks_max: bool,
    tracks_samples: bool,
    state: Mutex<AggregateState>,
}

impl AggregateGauge {
    /// Creates a detached aggregate gauge.
    ///
    /// # Errors
    /// `Custom` when `aggregators` is empty or `Duplicate` when two
    /// aggregators share a suffix.
    pub fn new(
        name: &str,
        unit: &str,
        description: &str,
        tags: &[(&str, &str)],
        aggregators: Vec<AggregatorSpec>,
    ) -> MetricResult<Self> {
        validate_aggregators(name, &aggregators)?;
        Ok(Self::from_validated(
            MetricInfo::new(name, unit, description, tags),
            aggregators,
        ))
    }

    pub(crate) fn from_validated(info: MetricInfo, aggregators: Vec<AggregatorSpec>) -> Self {
        let has = |f: fn(&AggregateMode) -> bool| aggregators.iter().any(|a| f(&a.mode));
        Self {
            tracks_sum: has(|m| matches!(m, AggregateMode::Average)),
            tracks_last: has(|m| matches!(m, AggregateMode::Last)),
            tracks_min: has(|m| matches!(m, AggregateMode::Min)),
            tracks_max: has(|m| matches!(m, AggregateMode::Max)),
            tracks_samples: has(|m| {
                matches!(m, AggregateMode::Median | AggregateMode::Percentile(_))
            }),
            info,
            aggregators,
            state: Mutex::new(AggregateState::new()),
        }
    }

    /// Records one value into the current window.
    ///
    /// # Errors
    /// `NotAttached` when the gauge is not registered with a source.
    pub fn record(&self, value: f64) -> MetricResult<()> {
        self.info.binding()?;
        let mut state = self.state.lock();
        state.count += 1;
        if self.tracks_sum {
            state.sum += value;
        }
        if self.tracks_last {
            state.last = value;
        }
        if self.tracks_min {
            state.min = state.min.min(value);
        }
        if self.tracks_max {
            state.max = state.max.max(value);
        }
        if self.tracks_samples {
            state.samples.push(value);
        }
        Ok(())
    }

    pub(crate) fn suffix_defs(aggregators: &[AggregatorSpec]) -> Vec<SuffixDef> {
        aggregators
            .iter()
            .map(|a| SuffixDef {
                suffix: a.suffix.clone(),
                description: a.description(),
                metric_type: MetricType::Gauge,
            })
            .collect()
    }
}

pub(crate) fn validate_aggregators(
    name: &str,
    aggregators: &[AggregatorSpec],
) -> MetricResult<()> {
    if aggregators.is_empty() {
        return Err(MetricsError::Custom(format!(
            "Aggregate gauge {name} needs at least one aggregator"
        )));
    }
    for (i, a) in aggregators.iter().enumerate() {
        if aggregators[..i].iter().any(|b| b.suffix == a.suffix) {
            return Err(MetricsError::Duplicate {
                name: format!("{name}{}", a.suffix),
            });
        }
    }
    Ok(())
}

/// Nearest-rank percentile over a sorted window, with ties rounded to even.
fn percentile_of(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    #[allow(clippy::cast_precision_loss)]
    let rank = p * (sorted.len() - 1) as f64;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let index = rank.round_ties_even() as usize;
    sorted[index.min(sorted.len() - 1)]
}

impl Metric for AggregateGauge {
    fn info(&self) -> &MetricInfo {
        &self.info
    }

    fn suffixes(&self) -> Vec<SuffixDef> {
        Self::suffix_defs(&self.aggregators)
    }

    #[allow(clippy::cast_precision_loss)]
    fn emit(&self, batch: &mut dyn ReadingBatch, timestamp: SystemTime) {
        let snapshot = {
            let mut state = self.state.lock();
            if state.count == 0 {
                drop(state);
                if let Some(index) = self
                    .aggregators
                    .iter()
                    .position(|a| matches!(a.mode, AggregateMode::Count))
                {
                    push_reading(batch, &self.info, index, MetricType::Gauge, 0.0, timestamp);
                }
                return;
            }
            std::mem::replace(&mut *state, AggregateState::new())
        };

        let mut sorted = snapshot.samples;
        if self.tracks_samples {
            sorted.sort_unstable_by(f64::total_cmp);
        }

        for (index, aggregator) in self.aggregators.iter().enumerate() {
            let value = match aggregator.mode {
                AggregateMode::Average => snapshot.sum / snapshot.count as f64,
                AggregateMode::Median => percentile_of(&sorted, 0.5),
                AggregateMode::Max => snapshot.max,
                AggregateMode::Min => snapshot.min,
                AggregateMode::Last => snapshot.last,
                AggregateMode::Count => snapshot.count as f64,
                AggregateMode::Percentile(p) => percentile_of(&sorted, p),
            };
            push_reading(batch, &self.info, index, MetricType::Gauge, value, timestamp);
        }
    }
}
