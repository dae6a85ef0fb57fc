use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::error::MetricsError;
use crate::metrics::{
    AggregateGauge, AggregatorSpec, Binding, Counter, CumulativeCounter, EventGauge, FamilyMetric,
    Metric, MetricInfo, SamplingGauge, SnapshotCounter, SnapshotGauge, SuffixDef, TagDescriptor,
    TagSet, TaggedMetricFamily,
};
use crate::options::SourceOptions;
use crate::reading::{Metadata, MetadataKind, ReadingBatch, TagMap};
use crate::MetricResult;

/// State shared between a source, its metrics and its tagged families.
#[derive(Debug)]
pub(crate) struct SourceShared {
    pub(crate) options: SourceOptions,
    /// Write-through snapshot of the default tags: every mutation publishes
    /// a complete replacement map, so readers capture one consistent
    /// snapshot per reading.
    pub(crate) default_tags: ArcSwap<TagMap>,
    defaults_write: Mutex<()>,
    watchers: Mutex<Vec<Weak<AtomicBool>>>,
}

impl SourceShared {
    fn mutate_defaults(&self, mutate: impl FnOnce(&mut TagMap)) {
        let _guard = self.defaults_write.lock();
        let mut map = (**self.default_tags.load()).clone();
        mutate(&mut map);
        self.default_tags.store(Arc::new(map));
    }

    fn notify_registration(&self) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| {
            w.upgrade().is_some_and(|flag| {
                flag.store(true, Ordering::Relaxed);
                true
            })
        });
    }
}

/// A registered metric, dispatched by kind rather than through a trait
/// object wherever the kind is statically known.
#[doc(hidden)]
#[derive(Clone)]
pub enum Registered {
    Counter(Arc<Counter>),
    CumulativeCounter(Arc<CumulativeCounter>),
    SamplingGauge(Arc<SamplingGauge>),
    EventGauge(Arc<EventGauge>),
    SnapshotGauge(Arc<SnapshotGauge>),
    SnapshotCounter(Arc<SnapshotCounter>),
    AggregateGauge(Arc<AggregateGauge>),
    Family {
        metric: Arc<dyn Metric>,
        any: Arc<dyn Any + Send + Sync>,
    },
}

impl Registered {
    fn emit(&self, batch: &mut dyn ReadingBatch, timestamp: SystemTime) {
        match self {
            Self::Counter(m) => m.emit(batch, timestamp),
            Self::CumulativeCounter(m) => m.emit(batch, timestamp),
            Self::SamplingGauge(m) => m.emit(batch, timestamp),
            Self::EventGauge(m) => m.emit(batch, timestamp),
            Self::SnapshotGauge(m) => m.emit(batch, timestamp),
            Self::SnapshotCounter(m) => m.emit(batch, timestamp),
            Self::AggregateGauge(m) => m.emit(batch, timestamp),
            Self::Family { metric, .. } => metric.emit(batch, timestamp),
        }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for crate::metrics::Counter {}
    impl Sealed for crate::metrics::CumulativeCounter {}
    impl Sealed for crate::metrics::SamplingGauge {}
    impl Sealed for crate::metrics::EventGauge {}
    impl Sealed for crate::metrics::SnapshotGauge {}
    impl Sealed for crate::metrics::SnapshotCounter {}
    impl Sealed for crate::metrics::AggregateGauge {}
}

/// A metric primitive that can be attached to a [`MetricSource`] as a
/// non-tagged (scalar) registration.
pub trait ScalarMetric: Metric + Sized + sealed::Sealed {
    #[doc(hidden)]
    fn into_registered(this: Arc<Self>) -> Registered;
    #[doc(hidden)]
    fn from_registered(registered: &Registered) -> Option<Arc<Self>>;
}

macro_rules! impl_scalar_metric {
    ($($ty:ident),*) => {
        $(
            impl ScalarMetric for $ty {
                fn into_registered(this: Arc<Self>) -> Registered {
                    Registered::$ty(this)
                }

                fn from_registered(registered: &Registered) -> Option<Arc<Self>> {
                    match registered {
                        Registered::$ty(m) => Some(m.clone()),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_scalar_metric!(
    Counter,
    CumulativeCounter,
    SamplingGauge,
    EventGauge,
    SnapshotGauge,
    SnapshotCounter,
    AggregateGauge
);

struct Entry {
    registered: Registered,
    unit: String,
    own_tags: TagMap,
    suffixes: Vec<String>,
    metadata: Vec<Metadata>,
}

#[derive(Hash, PartialEq, Eq)]
struct MetricKey {
    name: Arc<str>,
    tag_names: Vec<Arc<str>>,
}

#[derive(Default)]
struct Registry {
    entries: Vec<Entry>,
    by_key: HashMap<MetricKey, usize>,
    /// Full (name + suffix) to root name, for cross-metric collision
    /// detection.
    name_and_suffix: HashMap<Arc<str>, Arc<str>>,
}

/// Factory and registry of metric objects under one options context.
///
/// Applications hold `Arc` handles to the metrics they create here; the
/// collector periodically asks the source to emit every registered metric
/// into a batch.
pub struct MetricSource {
    shared: Arc<SourceShared>,
    registry: Mutex<Registry>,
}

impl MetricSource {
    /// Creates a source, transforming and validating the configured default
    /// tags.
    ///
    /// # Errors
    /// `InvalidTagName` / `InvalidTagValue` when a configured default tag
    /// fails validation.
    pub fn new(options: SourceOptions) -> MetricResult<Self> {
        let mut defaults = TagMap::new();
        for (name, value) in &options.default_tags {
            let name = options.resolve_tag_name(name)?;
            let value = options.resolve_tag_value(&name, value)?;
            defaults.insert(Arc::from(name), Arc::from(value));
        }
        Ok(Self {
            shared: Arc::new(SourceShared {
                options,
                default_tags: ArcSwap::new(Arc::new(defaults)),
                defaults_write: Mutex::new(()),
                watchers: Mutex::new(Vec::new()),
            }),
            registry: Mutex::new(Registry::default()),
        })
    }

    /// Registers a delta counter.
    ///
    /// # Errors
    /// See [`MetricSource::attach`].
    pub fn add_counter(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: &[(&str, &str)],
    ) -> MetricResult<Arc<Counter>> {
        self.attach(Counter::new(name, unit, description, tags))
    }

    /// Registers a monotonic counter.
    ///
    /// # Errors
    /// See [`MetricSource::attach`].
    pub fn add_cumulative_counter(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: &[(&str, &str)],
    ) -> MetricResult<Arc<CumulativeCounter>> {
        self.attach(CumulativeCounter::new(name, unit, description, tags))
    }

    /// Registers a last-write-wins gauge.
    ///
    /// # Errors
    /// See [`MetricSource::attach`].
    pub fn add_sampling_gauge(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: &[(&str, &str)],
    ) -> MetricResult<Arc<SamplingGauge>> {
        self.attach(SamplingGauge::new(name, unit, description, tags))
    }

    /// Registers a gauge that reports every recorded sample.
    ///
    /// # Errors
    /// See [`MetricSource::attach`].
    pub fn add_event_gauge(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: &[(&str, &str)],
    ) -> MetricResult<Arc<EventGauge>> {
        self.attach(EventGauge::new(name, unit, description, tags))
    }

    /// Registers a gauge polled from `read` on every snapshot.
    ///
    /// # Errors
    /// See [`MetricSource::attach`].
    pub fn add_snapshot_gauge(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: &[(&str, &str)],
        read: impl Fn() -> Option<f64> + Send + Sync + 'static,
    ) -> MetricResult<Arc<SnapshotGauge>> {
        self.attach(SnapshotGauge::new(name, unit, description, tags, read))
    }

    /// Registers a counter polled from `read` on every snapshot.
    ///
    /// # Errors
    /// See [`MetricSource::attach`].
    pub fn add_snapshot_counter(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: &[(&str, &str)],
        read: impl Fn() -> Option<i64> + Send + Sync + 'static,
    ) -> MetricResult<Arc<SnapshotCounter>> {
        self.attach(SnapshotCounter::new(name, unit, description, tags, read))
    }

    /// Registers a statistical aggregate gauge.
    ///
    /// # Errors
    /// Aggregator validation failures, plus everything
    /// [`MetricSource::attach`] can return.
    pub fn add_aggregate_gauge(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        tags: &[(&str, &str)],
        aggregators: Vec<AggregatorSpec>,
    ) -> MetricResult<Arc<AggregateGauge>> {
        self.attach(AggregateGauge::new(name, unit, description, tags, aggregators)?)
    }

    /// Attaches a detached metric primitive to this source.
    ///
    /// Re-registering an identical metric (same name, kind, unit, suffixes
    /// and tags) returns the existing handle; `metric` is dropped in that
    /// case.
    ///
    /// # Errors
    /// `InvalidName` / `InvalidTagName` / `InvalidTagValue` when
    /// transformation output fails validation; `Duplicate` when the full
    /// key is already bound to a different registration or any name +
    /// suffix collides with an existing one.
    pub fn attach<M: ScalarMetric>(&self, metric: M) -> MetricResult<Arc<M>> {
        let suffix_defs = metric.suffixes();
        let (name, own_tags) = self.resolve_identity(metric.info())?;
        let key_tag_names: Vec<Arc<str>> = own_tags.keys().cloned().collect();

        let unit = metric.info().unit().to_owned();
        let description = metric.info().description().to_owned();

        let mut registry = self.registry.lock();
        let key = MetricKey {
            name: name.clone(),
            tag_names: key_tag_names,
        };
        if let Some(&index) = registry.by_key.get(&key) {
            let entry = &registry.entries[index];
            if entry_matches(entry, &unit, &suffix_defs, &own_tags) {
                if let Some(existing) = M::from_registered(&entry.registered) {
                    return Ok(existing);
                }
            }
            return Err(MetricsError::Duplicate {
                name: name.to_string(),
            });
        }

        let full_names = check_suffixes(&registry, &name, &suffix_defs)?;

        metric.info().bind(Binding {
            name: name.clone(),
            full_names: full_names.clone(),
            own_tags: own_tags.clone(),
            shared: self.shared.clone(),
        })?;
        let handle = Arc::new(metric);
        self.insert_entry(
            &mut registry,
            key,
            M::into_registered(handle.clone()),
            &full_names,
            suffix_defs,
            unit,
            description,
            own_tags,
        );
        drop(registry);
        self.shared.notify_registration();
        Ok(handle)
    }

    /// Registers a tagged family of `M` metrics keyed by the tag tuple `K`.
    ///
    /// # Errors
    /// `InvalidTagName` for a rejected descriptor name, `Custom` when the
    /// descriptor count does not match the tuple arity, plus the
    /// registration errors of [`MetricSource::attach`].
    pub fn add_tagged<K: TagSet, M: FamilyMetric>(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        descriptors: Vec<TagDescriptor>,
        spec: M::Spec,
    ) -> MetricResult<Arc<TaggedMetricFamily<K, M>>> {
        if descriptors.is_empty() || descriptors.len() != K::ARITY {
            return Err(MetricsError::Custom(format!(
                "Family {name} declares {} descriptors but the tag tuple has {} values",
                descriptors.len(),
                K::ARITY
            )));
        }

        let mut resolved_names: Vec<Arc<str>> = Vec::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            let resolved = self.shared.options.resolve_tag_name(descriptor.name())?;
            if resolved_names.iter().any(|n| **n == *resolved) {
                return Err(MetricsError::InvalidTagName { name: resolved });
            }
            resolved_names.push(Arc::from(resolved));
        }

        let family = TaggedMetricFamily::<K, M>::new(
            MetricInfo::new(name, unit, description, &[]),
            descriptors,
            spec,
        )?;
        let suffix_defs = family.suffixes();
        let metric_name: Arc<str> = Arc::from(self.shared.options.resolve_metric_name(name)?);

        let mut key_tag_names = resolved_names.clone();
        key_tag_names.sort_unstable();

        let mut registry = self.registry.lock();
        let key = MetricKey {
            name: metric_name.clone(),
            tag_names: key_tag_names,
        };
        if let Some(&index) = registry.by_key.get(&key) {
            let entry = &registry.entries[index];
            if entry_matches(entry, unit, &suffix_defs, &TagMap::new()) {
                if let Registered::Family { any, .. } = &entry.registered {
                    if let Ok(existing) = any.clone().downcast::<TaggedMetricFamily<K, M>>() {
                        return Ok(existing);
                    }
                }
            }
            return Err(MetricsError::Duplicate {
                name: metric_name.to_string(),
            });
        }

        let full_names = check_suffixes(&registry, &metric_name, &suffix_defs)?;

        family.info().bind(Binding {
            name: metric_name.clone(),
            full_names: full_names.clone(),
            own_tags: TagMap::new(),
            shared: self.shared.clone(),
        })?;
        family.bind_descriptor_names(resolved_names);

        let handle = Arc::new(family);
        self.insert_entry(
            &mut registry,
            key,
            Registered::Family {
                metric: handle.clone(),
                any: handle.clone(),
            },
            &full_names,
            suffix_defs,
            unit.to_owned(),
            description.to_owned(),
            TagMap::new(),
        );
        drop(registry);
        self.shared.notify_registration();
        Ok(handle)
    }

    /// Registers a tagged family of delta counters.
    ///
    /// # Errors
    /// See [`MetricSource::add_tagged`].
    pub fn add_tagged_counters<K: TagSet>(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        descriptors: Vec<TagDescriptor>,
    ) -> MetricResult<Arc<TaggedMetricFamily<K, Counter>>> {
        self.add_tagged::<K, Counter>(name, unit, description, descriptors, ())
    }

    /// Registers a tagged family of monotonic counters.
    ///
    /// # Errors
    /// See [`MetricSource::add_tagged`].
    pub fn add_tagged_cumulative_counters<K: TagSet>(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        descriptors: Vec<TagDescriptor>,
    ) -> MetricResult<Arc<TaggedMetricFamily<K, CumulativeCounter>>> {
        self.add_tagged::<K, CumulativeCounter>(name, unit, description, descriptors, ())
    }

    /// Registers a tagged family of last-write-wins gauges.
    ///
    /// # Errors
    /// See [`MetricSource::add_tagged`].
    pub fn add_tagged_sampling_gauges<K: TagSet>(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        descriptors: Vec<TagDescriptor>,
    ) -> MetricResult<Arc<TaggedMetricFamily<K, SamplingGauge>>> {
        self.add_tagged::<K, SamplingGauge>(name, unit, description, descriptors, ())
    }

    /// Registers a tagged family of event gauges.
    ///
    /// # Errors
    /// See [`MetricSource::add_tagged`].
    pub fn add_tagged_event_gauges<K: TagSet>(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        descriptors: Vec<TagDescriptor>,
    ) -> MetricResult<Arc<TaggedMetricFamily<K, EventGauge>>> {
        self.add_tagged::<K, EventGauge>(name, unit, description, descriptors, ())
    }

    /// Registers a tagged family of aggregate gauges sharing one aggregator
    /// set.
    ///
    /// # Errors
    /// See [`MetricSource::add_tagged`].
    pub fn add_tagged_aggregate_gauges<K: TagSet>(
        &self,
        name: &str,
        unit: &str,
        description: &str,
        descriptors: Vec<TagDescriptor>,
        aggregators: Vec<AggregatorSpec>,
    ) -> MetricResult<Arc<TaggedMetricFamily<K, AggregateGauge>>> {
        self.add_tagged::<K, AggregateGauge>(name, unit, description, descriptors, aggregators)
    }

    /// Emits every registered metric into `batch`, stamped with
    /// `timestamp`. Cross-metric ordering is unspecified.
    ///
    /// The registry lock is released before emission so registrations are
    /// never blocked behind a snapshot.
    pub fn write_readings(&self, batch: &mut dyn ReadingBatch, timestamp: SystemTime) {
        let metrics: Vec<Registered> = {
            let registry = self.registry.lock();
            registry.entries.iter().map(|e| e.registered.clone()).collect()
        };
        for metric in &metrics {
            metric.emit(batch, timestamp);
        }
    }

    /// All metadata facts known to this source.
    #[must_use]
    pub fn metadata(&self) -> Vec<Metadata> {
        let registry = self.registry.lock();
        registry
            .entries
            .iter()
            .flat_map(|e| e.metadata.iter().cloned())
            .collect()
    }

    /// Sets or replaces a default tag; readers observe the change as one
    /// atomic snapshot swap.
    ///
    /// # Errors
    /// `InvalidTagName` / `InvalidTagValue` on validation failure.
    pub fn set_default_tag(&self, name: &str, value: &str) -> MetricResult<()> {
        let name = self.shared.options.resolve_tag_name(name)?;
        let value = self.shared.options.resolve_tag_value(&name, value)?;
        self.shared.mutate_defaults(|map| {
            map.insert(Arc::from(name.as_str()), Arc::from(value.as_str()));
        });
        Ok(())
    }

    /// Removes a default tag; returns whether it was present.
    ///
    /// # Errors
    /// `InvalidTagName` on validation failure.
    pub fn remove_default_tag(&self, name: &str) -> MetricResult<bool> {
        let name = self.shared.options.resolve_tag_name(name)?;
        let mut removed = false;
        self.shared.mutate_defaults(|map| {
            removed = map.remove(name.as_str()).is_some();
        });
        Ok(removed)
    }

    /// The current default-tag snapshot.
    #[must_use]
    pub fn default_tags(&self) -> Arc<TagMap> {
        self.shared.default_tags.load_full()
    }

    /// Registers an edge-triggered flag the source sets on every new metric
    /// registration. The collector uses this to refresh metadata.
    pub(crate) fn subscribe_registrations(&self, flag: &Arc<AtomicBool>) {
        self.shared.watchers.lock().push(Arc::downgrade(flag));
    }

    fn resolve_identity(&self, info: &MetricInfo) -> MetricResult<(Arc<str>, TagMap)> {
        let name: Arc<str> = Arc::from(self.shared.options.resolve_metric_name(info.name())?);
        let mut own_tags = TagMap::new();
        for (tag_name, tag_value) in info.raw_tags() {
            let tag_name = self.shared.options.resolve_tag_name(tag_name)?;
            let tag_value = self.shared.options.resolve_tag_value(&tag_name, tag_value)?;
            own_tags.insert(Arc::from(tag_name), Arc::from(tag_value));
        }
        Ok((name, own_tags))
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_entry(
        &self,
        registry: &mut Registry,
        key: MetricKey,
        registered: Registered,
        full_names: &[Arc<str>],
        suffix_defs: Vec<SuffixDef>,
        unit: String,
        description: String,
        own_tags: TagMap,
    ) {
        let metadata = build_metadata(full_names, &suffix_defs, &unit, &description, &own_tags);
        for full in full_names {
            registry
                .name_and_suffix
                .insert(full.clone(), key.name.clone());
        }
        registry.by_key.insert(key, registry.entries.len());
        registry.entries.push(Entry {
            registered,
            unit,
            own_tags,
            suffixes: suffix_defs.into_iter().map(|d| d.suffix).collect(),
            metadata,
        });
    }
}

fn entry_matches(entry: &Entry, unit: &str, suffix_defs: &[SuffixDef], own_tags: &TagMap) -> bool {
    entry.unit == unit
        && entry.own_tags == *own_tags
        && entry.suffixes.len() == suffix_defs.len()
        && entry
            .suffixes
            .iter()
            .zip(suffix_defs)
            .all(|(have, want)| *have == want.suffix)
}

/// First pass of the check-then-insert discipline: every full name must be
/// free before any of them is recorded, so the registry never observes a
/// partial insert.
fn check_suffixes(
    registry: &Registry,
    name: &Arc<str>,
    suffix_defs: &[SuffixDef],
) -> MetricResult<Vec<Arc<str>>> {
    let mut full_names = Vec::with_capacity(suffix_defs.len());
    for def in suffix_defs {
        let full: Arc<str> = if def.suffix.is_empty() {
            name.clone()
        } else {
            Arc::from(format!("{name}{}", def.suffix))
        };
        if registry.name_and_suffix.contains_key(&full) {
            return Err(MetricsError::Duplicate {
                name: full.to_string(),
            });
        }
        full_names.push(full);
    }
    Ok(full_names)
}

fn build_metadata(
    full_names: &[Arc<str>],
    suffix_defs: &[SuffixDef],
    unit: &str,
    description: &str,
    own_tags: &TagMap,
) -> Vec<Metadata> {
    let mut facts = Vec::new();
    for (full, def) in full_names.iter().zip(suffix_defs) {
        facts.push(Metadata {
            metric: full.clone(),
            name: MetadataKind::Rate,
            tags: own_tags.clone(),
            value: Arc::from(def.metric_type.rate_value()),
        });
        let described = match (description.is_empty(), def.description.is_empty()) {
            (true, true) => String::new(),
            (true, false) => def.description.clone(),
            (false, true) => description.to_owned(),
            (false, false) => format!("{description} {}", def.description),
        };
        if !described.is_empty() {
            facts.push(Metadata {
                metric: full.clone(),
                name: MetadataKind::Description,
                tags: own_tags.clone(),
                value: Arc::from(described),
            });
        }
        if !unit.is_empty() {
            facts.push(Metadata {
                metric: full.clone(),
                name: MetadataKind::Unit,
                tags: own_tags.clone(),
                value: Arc::from(unit),
            });
        }
    }
    facts
}
