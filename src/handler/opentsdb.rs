use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Url;
use serde::Serialize;

use crate::handler::transport::{parse_base_url, HttpSink, DEFAULT_HTTP_TIMEOUT};
use crate::handler::{EndpointEncoder, PayloadType, PostError};
use crate::reading::{Metadata, Reading};
use crate::MetricResult;

#[derive(Serialize)]
struct DataPoint<'a> {
    metric: &'a str,
    value: f64,
    tags: BTreeMap<&'a str, &'a str>,
    timestamp: u64,
}

#[derive(Serialize)]
struct MetadataEntry<'a> {
    metric: &'a str,
    name: &'a str,
    value: &'a str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    tags: BTreeMap<&'a str, &'a str>,
}

fn tag_view(tags: &crate::reading::TagMap) -> BTreeMap<&str, &str> {
    tags.iter().map(|(k, v)| (k.as_ref(), v.as_ref())).collect()
}

/// OpenTSDB-compatible HTTP endpoint.
///
/// Readings are posted as a gzipped JSON array to `{base}/api/put`;
/// metadata goes to `{base}/api/metadata/put` uncompressed. A `None` base
/// URL produces a disabled endpoint that discards everything.
pub struct OpenTsdbEndpoint {
    base_url: Option<Url>,
    sink: HttpSink,
}

impl OpenTsdbEndpoint {
    /// Creates the endpoint with the default transport timeout.
    ///
    /// # Errors
    /// URL parse failures and HTTP client construction failures.
    pub fn new(base_url: Option<&str>) -> MetricResult<Self> {
        Self::with_timeout(base_url, DEFAULT_HTTP_TIMEOUT)
    }

    /// Creates the endpoint with an explicit transport timeout.
    ///
    /// # Errors
    /// URL parse failures and HTTP client construction failures.
    pub fn with_timeout(base_url: Option<&str>, timeout: Duration) -> MetricResult<Self> {
        Ok(Self {
            base_url: base_url.map(parse_base_url).transpose()?,
            sink: HttpSink::new(timeout)?,
        })
    }
}

impl EndpointEncoder for OpenTsdbEndpoint {
    fn serialize_reading(&self, out: &mut Vec<u8>, reading: &Reading) -> MetricResult<()> {
        let point = DataPoint {
            metric: &reading.name,
            value: reading.value,
            tags: tag_view(&reading.tags),
            timestamp: reading.timestamp_millis(),
        };
        // Entries are comma-prefixed; prepare_sequence swaps the leading
        // comma for the array brackets.
        out.push(b',');
        serde_json::to_writer(&mut *out, &point)
            .map_err(|err| crate::MetricsError::Encoder(format!("OpenTSDB reading: {err}")))?;
        Ok(())
    }

    fn serialize_metadata(&self, out: &mut Vec<u8>, metadata: &[Metadata]) -> MetricResult<()> {
        for fact in metadata {
            let entry = MetadataEntry {
                metric: &fact.metric,
                name: fact.name.as_str(),
                value: &fact.value,
                tags: tag_view(&fact.tags),
            };
            out.push(b',');
            serde_json::to_writer(&mut *out, &entry)
                .map_err(|err| crate::MetricsError::Encoder(format!("OpenTSDB metadata: {err}")))?;
        }
        Ok(())
    }

    fn prepare_sequence(&self, bytes: Vec<u8>, _payload_type: PayloadType) -> Vec<u8> {
        if bytes.is_empty() {
            return bytes;
        }
        let mut payload = Vec::with_capacity(bytes.len() + 2);
        payload.push(b'[');
        payload.extend_from_slice(&bytes[1..]);
        payload.push(b']');
        payload
    }

    fn send(&self, payload_type: PayloadType, bytes: &[u8]) -> Result<(), PostError> {
        let Some(base) = &self.base_url else {
            return Ok(());
        };
        let (path, gzip) = if payload_type == PayloadType::Metadata {
            ("api/metadata/put", false)
        } else {
            ("api/put", true)
        };
        let url = base
            .join(path)
            .map_err(|err| PostError::fatal(format!("Bad endpoint path {path}: {err}")))?;
        self.sink.post_json(&url, bytes, gzip, &[])
    }
}
