use std::io::Write;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::Url;

use crate::error::MetricsError;
use crate::handler::PostError;
use crate::MetricResult;

pub(crate) const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Blocking JSON-over-HTTP transport shared by the HTTP endpoints.
///
/// Status classification follows the retry contract: network errors,
/// timeouts and 5xx responses are retriable; 4xx responses are fatal.
pub(crate) struct HttpSink {
    client: Client,
}

impl HttpSink {
    pub fn new(timeout: Duration) -> MetricResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| MetricsError::Custom(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self { client })
    }

    pub fn post_json(
        &self,
        url: &Url,
        body: &[u8],
        gzip: bool,
        headers: &[(&str, &str)],
    ) -> Result<(), PostError> {
        let mut request = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json");

        let body = if gzip {
            request = request.header(CONTENT_ENCODING, "gzip");
            gzip_bytes(body)?
        } else {
            body.to_vec()
        };
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request
            .body(body)
            .send()
            .map_err(|err| PostError::retriable(format!("{url}: {err}")))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(PostError::fatal(format!("{url}: HTTP {status}")))
        } else {
            Err(PostError::retriable(format!("{url}: HTTP {status}")))
        }
    }
}

fn gzip_bytes(body: &[u8]) -> Result<Vec<u8>, PostError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
    encoder
        .write_all(body)
        .and_then(|()| encoder.finish())
        .map_err(|err| PostError::fatal(format!("gzip failed: {err}")))
}

/// Parses a base URL, normalizing it to end with `/` so joins append
/// instead of replacing the last path segment.
pub(crate) fn parse_base_url(raw: &str) -> MetricResult<Url> {
    let normalized = if raw.ends_with('/') {
        raw.to_owned()
    } else {
        format!("{raw}/")
    };
    Url::parse(&normalized)
        .map_err(|err| MetricsError::Custom(format!("Invalid endpoint URL {raw}: {err}")))
}
