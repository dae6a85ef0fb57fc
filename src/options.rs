use std::fmt;
use std::sync::Arc;

use crate::error::MetricsError;
use crate::MetricResult;

/// A pure function applied to metric names, tag names or tag values before
/// validation.
pub type NameTransformer = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// A predicate deciding whether a transformed name or value is acceptable.
pub type NameValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Configuration for a [`MetricSource`](crate::MetricSource).
///
/// Transformers run before validators. Default tags are folded into every
/// reading the source's metrics emit; the metric's own tags win on
/// collision.
#[derive(Clone)]
pub struct SourceOptions {
    /// Applied to metric names before validation and registration.
    pub metric_name_transformer: NameTransformer,
    /// Applied to tag names before validation.
    pub tag_name_transformer: NameTransformer,
    /// Applied to tag values before validation.
    pub tag_value_transformer: NameTransformer,
    /// Rejecting a metric name fails registration with `InvalidName`.
    pub metric_name_validator: NameValidator,
    /// Rejecting a tag name fails registration with `InvalidTagName`.
    pub tag_name_validator: NameValidator,
    /// Rejecting a tag value fails the update with `InvalidTagValue`.
    pub tag_value_validator: NameValidator,
    /// Tags injected into every reading, as raw (untransformed) pairs.
    pub default_tags: Vec<(String, String)>,
}

impl fmt::Debug for SourceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceOptions")
            .field("default_tags", &self.default_tags)
            .finish_non_exhaustive()
    }
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            metric_name_transformer: Arc::new(str::to_owned),
            tag_name_transformer: Arc::new(str::to_owned),
            tag_value_transformer: Arc::new(str::to_owned),
            metric_name_validator: Arc::new(default_name_ok),
            tag_name_validator: Arc::new(default_name_ok),
            tag_value_validator: Arc::new(default_value_ok),
            default_tags: Vec::new(),
        }
    }
}

impl SourceOptions {
    pub(crate) fn resolve_metric_name(&self, raw: &str) -> MetricResult<String> {
        let name = (self.metric_name_transformer)(raw);
        if (self.metric_name_validator)(&name) {
            Ok(name)
        } else {
            Err(MetricsError::InvalidName { name })
        }
    }

    pub(crate) fn resolve_tag_name(&self, raw: &str) -> MetricResult<String> {
        let name = (self.tag_name_transformer)(raw);
        if (self.tag_name_validator)(&name) {
            Ok(name)
        } else {
            Err(MetricsError::InvalidTagName { name })
        }
    }

    pub(crate) fn resolve_tag_value(&self, tag: &str, raw: &str) -> MetricResult<String> {
        let value = (self.tag_value_transformer)(raw);
        if (self.tag_value_validator)(&value) {
            Ok(value)
        } else {
            Err(MetricsError::InvalidTagValue {
                name: tag.to_owned(),
                value,
            })
        }
    }
}

/// Default validator for metric and tag names: non-empty, limited to
/// alphanumerics plus `_`, `-`, `.` and `/`.
#[must_use]
pub fn default_name_ok(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
}

/// Default validator for tag values: non-empty and free of characters that
/// break the wire formats (whitespace, `,`, `:`, `|`, `#`).
#[must_use]
pub fn default_value_ok(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| !c.is_whitespace() && !matches!(c, ',' | ':' | '|' | '#'))
}
