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
    dimensions: BTreeMap<&'a str, &'a str>,
    timestamp: u64,
}

/// SignalFx HTTP endpoint.
///
/// Each payload is one POST of a datapoint envelope keyed by the payload's
/// kind (`counter`, `cumulative_counter` or `gauge`). SignalFx has no
/// metadata API here, so metadata is discarded. A `None` URL produces a
/// disabled endpoint.
pub struct SignalFxEndpoint {
    url: Option<Url>,
    access_token: Option<String>,
    sink: HttpSink,
}

impl SignalFxEndpoint {
    /// Creates the endpoint with the default transport timeout.
    ///
    /// # Errors
    /// URL parse failures and HTTP client construction failures.
    pub fn new(url: Option<&str>, access_token: Option<&str>) -> MetricResult<Self> {
        Self::with_timeout(url, access_token, DEFAULT_HTTP_TIMEOUT)
    }

    /// Creates the endpoint with an explicit transport timeout.
    ///
    /// # Errors
    /// URL parse failures and HTTP client construction failures.
    pub fn with_timeout(
        url: Option<&str>,
        access_token: Option<&str>,
        timeout: Duration,
    ) -> MetricResult<Self> {
        Ok(Self {
            url: url.map(parse_base_url).transpose()?,
            access_token: access_token.map(str::to_owned),
            sink: HttpSink::new(timeout)?,
        })
    }

    const fn envelope_key(payload_type: PayloadType) -> &'static str {
        match payload_type {
            PayloadType::Counter => "counter",
            PayloadType::CumulativeCounter => "cumulative_counter",
            PayloadType::Gauge | PayloadType::Metadata => "gauge",
        }
    }
}

impl EndpointEncoder for SignalFxEndpoint {
    fn serialize_reading(&self, out: &mut Vec<u8>, reading: &Reading) -> MetricResult<()> {
        let point = DataPoint {
            metric: &reading.name,
            value: reading.value,
            dimensions: reading
                .tags
                .iter()
                .map(|(k, v)| (k.as_ref(), v.as_ref()))
                .collect(),
            timestamp: reading.timestamp_millis(),
        };
        out.push(b',');
        serde_json::to_writer(&mut *out, &point)
            .map_err(|err| crate::MetricsError::Encoder(format!("SignalFx reading: {err}")))?;
        Ok(())
    }

    fn serialize_metadata(&self, _out: &mut Vec<u8>, _metadata: &[Metadata]) -> MetricResult<()> {
        Ok(())
    }

    fn supports_metadata(&self) -> bool {
        false
    }

    fn prepare_sequence(&self, bytes: Vec<u8>, payload_type: PayloadType) -> Vec<u8> {
        if bytes.is_empty() {
            return bytes;
        }
        let key = Self::envelope_key(payload_type);
        let mut payload = Vec::with_capacity(bytes.len() + key.len() + 8);
        payload.push(b'{');
        payload.push(b'"');
        payload.extend_from_slice(key.as_bytes());
        payload.extend_from_slice(b"\":[");
        payload.extend_from_slice(&bytes[1..]);
        payload.extend_from_slice(b"]}");
        payload
    }

    fn send(&self, _payload_type: PayloadType, bytes: &[u8]) -> Result<(), PostError> {
        let Some(url) = &self.url else {
            return Ok(());
        };
        let headers: Vec<(&str, &str)> = self
            .access_token
            .iter()
            .map(|token| ("X-SF-Token", token.as_str()))
            .collect();
        self.sink.post_json(url, bytes, false, &headers)
    }
}
