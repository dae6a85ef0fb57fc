use std::borrow::Cow;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use dashmap::DashMap;

use crate::metrics::aggregate::{validate_aggregators, AggregateGauge, AggregatorSpec};
use crate::metrics::counter::{Counter, CumulativeCounter};
use crate::metrics::gauge::{EventGauge, SamplingGauge};
use crate::metrics::{Binding, Metric, MetricInfo, SuffixDef};
use crate::reading::{MetricType, ReadingBatch};
use crate::MetricResult;

/// A value usable as a tag: strings, enum-like identifiers, integers and
/// booleans. Floating-point types are deliberately not supported, so a tag
/// can never explode into an unbounded set of series by accident.
pub trait TagValue {
    /// Renders the value as it appears in the tag set, before the source's
    /// tag-value transformer runs.
    fn render(&self) -> Cow<'_, str>;
}

impl TagValue for &str {
    fn render(&self) -> Cow<'_, str> {
        Cow::Borrowed(self)
    }
}

impl TagValue for String {
    fn render(&self) -> Cow<'_, str> {
        Cow::Borrowed(self)
    }
}

impl TagValue for Arc<str> {
    fn render(&self) -> Cow<'_, str> {
        Cow::Borrowed(self)
    }
}

impl TagValue for bool {
    fn render(&self) -> Cow<'_, str> {
        Cow::Borrowed(if *self { "true" } else { "false" })
    }
}

macro_rules! impl_tag_value_for_int {
    ($($ty:ty),*) => {
        $(
            impl TagValue for $ty {
                fn render(&self) -> Cow<'_, str> {
                    Cow::Owned(self.to_string())
                }
            }
        )*
    };
}

impl_tag_value_for_int!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

/// A tuple of 1 to 5 [`TagValue`]s identifying one child of a tagged
/// family.
///
/// Tuples must be `'static`: use `String` (or another owned value) for tag
/// values that are not known at compile time.
pub trait TagSet: Send + Sync + 'static {
    /// Number of values in the tuple; matches the family's descriptor
    /// count.
    const ARITY: usize;

    /// Renders each value in declaration order.
    fn render_values(&self) -> Vec<Cow<'_, str>>;
}

macro_rules! impl_tag_set {
    ($arity:literal; $($name:ident : $idx:tt),+) => {
        impl<$($name: TagValue + Send + Sync + 'static),+> TagSet for ($($name,)+) {
            const ARITY: usize = $arity;

            fn render_values(&self) -> Vec<Cow<'_, str>> {
                vec![$(self.$idx.render()),+]
            }
        }
    };
}

impl_tag_set!(1; A: 0);
impl_tag_set!(2; A: 0, B: 1);
impl_tag_set!(3; A: 0, B: 1, C: 2);
impl_tag_set!(4; A: 0, B: 1, C: 2, D: 3);
impl_tag_set!(5; A: 0, B: 1, C: 2, D: 3, E: 4);

/// Declares one tag of a tagged family: the tag's name, paired with the
/// value type carried by the matching [`TagSet`] tuple position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagDescriptor {
    name: String,
}

impl TagDescriptor {
    /// Creates a descriptor for the given tag name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The raw (untransformed) tag name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl From<&str> for TagDescriptor {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A metric kind whose instances can be materialized per tag tuple by a
/// [`TaggedMetricFamily`].
pub trait FamilyMetric: Metric + Sized {
    /// Construction parameters shared by every child of the family.
    type Spec: Send + Sync + 'static;

    /// The suffix set children of this kind contribute, validated against
    /// `spec`.
    ///
    /// # Errors
    /// Propagates spec validation failures (e.g. duplicate aggregator
    /// suffixes).
    fn family_suffixes(name: &str, spec: &Self::Spec) -> MetricResult<Vec<SuffixDef>>;

    /// Builds one child; the family binds it to its tag tuple.
    fn build(info: MetricInfo, spec: &Self::Spec) -> Self;
}

impl FamilyMetric for Counter {
    type Spec = ();

    fn family_suffixes(_name: &str, (): &Self::Spec) -> MetricResult<Vec<SuffixDef>> {
        Ok(SuffixDef::scalar(MetricType::Counter))
    }

    fn build(info: MetricInfo, (): &Self::Spec) -> Self {
        Self::from_info(info)
    }
}

impl FamilyMetric for CumulativeCounter {
    type Spec = ();

    fn family_suffixes(_name: &str, (): &Self::Spec) -> MetricResult<Vec<SuffixDef>> {
        Ok(SuffixDef::scalar(MetricType::CumulativeCounter))
    }

    fn build(info: MetricInfo, (): &Self::Spec) -> Self {
        Self::from_info(info)
    }
}

impl FamilyMetric for SamplingGauge {
    type Spec = ();

    fn family_suffixes(_name: &str, (): &Self::Spec) -> MetricResult<Vec<SuffixDef>> {
        Ok(SuffixDef::scalar(MetricType::Gauge))
    }

    fn build(info: MetricInfo, (): &Self::Spec) -> Self {
        Self::from_info(info)
    }
}

impl FamilyMetric for EventGauge {
    type Spec = ();

    fn family_suffixes(_name: &str, (): &Self::Spec) -> MetricResult<Vec<SuffixDef>> {
        Ok(SuffixDef::scalar(MetricType::Gauge))
    }

    fn build(info: MetricInfo, (): &Self::Spec) -> Self {
        Self::from_info(info)
    }
}

impl FamilyMetric for AggregateGauge {
    type Spec = Vec<AggregatorSpec>;

    fn family_suffixes(name: &str, spec: &Self::Spec) -> MetricResult<Vec<SuffixDef>> {
        validate_aggregators(name, spec)?;
        Ok(Self::suffix_defs(spec))
    }

    fn build(info: MetricInfo, spec: &Self::Spec) -> Self {
        Self::from_validated(info, spec.clone())
    }
}

/// Maps tuples of tag values to lazily created metric instances.
///
/// Children are created on first [`get`](Self::get) and live as long as the
/// family. The family itself registers with the source under the tag names
/// of its descriptors; children share the family's name, unit, description
/// and suffixes.
pub struct TaggedMetricFamily<K: TagSet, M: FamilyMetric> {
    info: MetricInfo,
    descriptors: Vec<TagDescriptor>,
    resolved_names: OnceLock<Vec<Arc<str>>>,
    spec: M::Spec,
    suffix_defs: Vec<SuffixDef>,
    children: DashMap<Vec<Arc<str>>, Arc<M>>,
    _values: PhantomData<fn(K) -> K>,
}

impl<K: TagSet, M: FamilyMetric> TaggedMetricFamily<K, M> {
    pub(crate) fn new(
        info: MetricInfo,
        descriptors: Vec<TagDescriptor>,
        spec: M::Spec,
    ) -> MetricResult<Self> {
        let suffix_defs = M::family_suffixes(info.name(), &spec)?;
        Ok(Self {
            info,
            descriptors,
            resolved_names: OnceLock::new(),
            spec,
            suffix_defs,
            children: DashMap::new(),
            _values: PhantomData,
        })
    }

    pub(crate) fn bind_descriptor_names(&self, names: Vec<Arc<str>>) {
        // Set once by the source during registration.
        let _ = self.resolved_names.set(names);
    }

    /// The family's tag descriptors, in declaration order.
    #[must_use]
    pub fn descriptors(&self) -> &[TagDescriptor] {
        &self.descriptors
    }

    /// Number of children materialized so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether no child has been materialized yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Returns the child bound to `values`, creating it on first use.
    ///
    /// Tag values are transformed and validated before the lookup, so two
    /// raw values mapping to the same transformed value share one child.
    ///
    /// # Errors
    /// `InvalidTagValue` when a transformed value fails validation;
    /// `NotAttached` when the family is not registered with a source.
    pub fn get(&self, values: K) -> MetricResult<Arc<M>> {
        let binding = self.info.binding()?;
        let names = self
            .resolved_names
            .get()
            .ok_or_else(|| crate::MetricsError::NotAttached {
                name: self.info.name().to_owned(),
            })?;

        let rendered = values.render_values();
        let options = &binding.shared.options;
        let mut resolved: Vec<Arc<str>> = Vec::with_capacity(rendered.len());
        for (name, value) in names.iter().zip(&rendered) {
            resolved.push(Arc::from(options.resolve_tag_value(name, value)?));
        }

        if let Some(child) = self.children.get(resolved.as_slice()) {
            return Ok(Arc::clone(&child));
        }

        let child = self.children.entry(resolved.clone()).or_insert_with(|| {
            let metric = M::build(
                MetricInfo::new(
                    self.info.name(),
                    self.info.unit(),
                    self.info.description(),
                    &[],
                ),
                &self.spec,
            );
            let child_binding = Binding {
                name: binding.name.clone(),
                full_names: binding.full_names.clone(),
                own_tags: names.iter().cloned().zip(resolved.iter().cloned()).collect(),
                shared: binding.shared.clone(),
            };
            // The metric is freshly constructed, so the bind cannot
            // already be set.
            let _ = metric.info().bind(child_binding);
            Arc::new(metric)
        });
        Ok(Arc::clone(&child))
    }
}

impl<K: TagSet, M: FamilyMetric> Metric for TaggedMetricFamily<K, M> {
    fn info(&self) -> &MetricInfo {
        &self.info
    }

    fn suffixes(&self) -> Vec<SuffixDef> {
        self.suffix_defs.clone()
    }

    fn emit(&self, batch: &mut dyn ReadingBatch, timestamp: SystemTime) {
        for child in self.children.iter() {
            child.value().emit(batch, timestamp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MetricsError;
    use crate::source::MetricSource;
    use crate::{Reading, SourceOptions};

    #[derive(Clone, Copy)]
    enum Shard {
        A,
        B,
    }

    impl TagValue for Shard {
        fn render(&self) -> Cow<'_, str> {
            Cow::Borrowed(match self {
                Self::A => "A",
                Self::B => "B",
            })
        }
    }

    fn tag(readings: &[Reading], index: usize, name: &str) -> String {
        readings[index].tags[name].to_string()
    }

    #[test]
    fn children_fan_out_per_tag_tuple() {
        let source = MetricSource::new(SourceOptions::default()).unwrap();
        let family = source
            .add_tagged_counters::<(&str, Shard)>(
                "requests",
                "",
                "",
                vec!["route".into(), "shard".into()],
            )
            .unwrap();

        family.get(("x", Shard::A)).unwrap().increment().unwrap();
        family.get(("x", Shard::A)).unwrap().increment().unwrap();
        family.get(("y", Shard::B)).unwrap().increment().unwrap();
        assert_eq!(family.len(), 2);

        let mut readings = Vec::new();
        family.emit(&mut readings, SystemTime::now());
        readings.sort_by(|a, b| b.value.total_cmp(&a.value));

        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].value, 2.0);
        assert_eq!(tag(&readings, 0, "route"), "x");
        assert_eq!(tag(&readings, 0, "shard"), "A");
        assert_eq!(readings[1].value, 1.0);
        assert_eq!(tag(&readings, 1, "route"), "y");
        assert_eq!(tag(&readings, 1, "shard"), "B");
    }

    #[test]
    fn same_tuple_returns_same_child() {
        let source = MetricSource::new(SourceOptions::default()).unwrap();
        let family = source
            .add_tagged_counters::<(bool,)>("hits", "", "", vec!["cached".into()])
            .unwrap();
        let a = family.get((true,)).unwrap();
        let b = family.get((true,)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn invalid_tag_value_is_rejected() {
        let source = MetricSource::new(SourceOptions::default()).unwrap();
        let family = source
            .add_tagged_counters::<(&str,)>("hits", "", "", vec!["host".into()])
            .unwrap();
        let err = family.get(("bad value",)).unwrap_err();
        assert!(matches!(err, MetricsError::InvalidTagValue { name, .. } if name == "host"));
    }

    #[test]
    fn aggregate_families_share_one_aggregator_set() {
        let source = MetricSource::new(SourceOptions::default()).unwrap();
        let family = source
            .add_tagged_aggregate_gauges::<(&str,)>(
                "latency",
                "ms",
                "",
                vec!["route".into()],
                vec![AggregatorSpec::count(), AggregatorSpec::max()],
            )
            .unwrap();

        family.get(("a",)).unwrap().record(5.0).unwrap();
        family.get(("a",)).unwrap().record(9.0).unwrap();

        let mut readings = Vec::new();
        family.emit(&mut readings, SystemTime::now());
        assert_eq!(readings.len(), 2);
        assert!(readings.iter().any(|r| r.name.ends_with("_max") && r.value == 9.0));
        assert!(readings.iter().any(|r| r.name.ends_with("_count") && r.value == 2.0));
    }
}
