use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use flate2::read::GzDecoder;
use tidemark_metrics::{
    AfterSendInfo, BufferedHandler, CollectorOptions, MetricSource, MetricsCollector,
    OpenTsdbEndpoint, SourceOptions,
};

// ============================================================================
// Minimal HTTP acceptor: records requests, replies from a scripted status
// list, closes each connection
// ============================================================================

#[derive(Debug)]
struct RecordedRequest {
    path: String,
    gzip: bool,
    body: Vec<u8>,
}

impl RecordedRequest {
    fn json(&self) -> serde_json::Value {
        let bytes = if self.gzip {
            let mut decoder = GzDecoder::new(&self.body[..]);
            let mut decoded = Vec::new();
            decoder.read_to_end(&mut decoded).expect("gzip body");
            decoded
        } else {
            self.body.clone()
        };
        serde_json::from_slice(&bytes).expect("JSON body")
    }
}

fn handle_connection(stream: TcpStream, status: u16) -> RecordedRequest {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).expect("request line");
    let path = request_line.split_whitespace().nth(1).expect("path").to_owned();

    let mut content_length = 0usize;
    let mut gzip = false;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).expect("header line");
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        match name.to_ascii_lowercase().as_str() {
            "content-length" => content_length = value.trim().parse().expect("content length"),
            "content-encoding" => gzip = value.trim().eq_ignore_ascii_case("gzip"),
            _ => {}
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).expect("body");

    let reason = match status {
        200 => "OK",
        500 => "Internal Server Error",
        400 => "Bad Request",
        _ => "No Content",
    };
    let mut stream = reader.into_inner();
    write!(
        stream,
        "HTTP/1.1 {status} {reason}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
    )
    .expect("response");
    stream.flush().expect("flush response");

    RecordedRequest { path, gzip, body }
}

/// Accepts `expected` connections, answering the n-th with `statuses[n]`
/// (200 once the script runs out).
fn spawn_http_server(statuses: Vec<u16>, expected: usize) -> (String, JoinHandle<Vec<RecordedRequest>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let base_url = format!("http://{}", listener.local_addr().expect("listener addr"));
    let handle = std::thread::spawn(move || {
        let mut recorded = Vec::new();
        for index in 0..expected {
            let (stream, _) = listener.accept().expect("accept");
            let status = statuses.get(index).copied().unwrap_or(200);
            recorded.push(handle_connection(stream, status));
        }
        recorded
    });
    (base_url, handle)
}

fn collector_for(source: &Arc<MetricSource>, base_url: &str) -> MetricsCollector {
    let endpoint = BufferedHandler::new(
        "opentsdb",
        OpenTsdbEndpoint::new(Some(base_url)).unwrap(),
    );
    MetricsCollector::new(CollectorOptions {
        sources: vec![source.clone()],
        endpoints: vec![endpoint],
        snapshot_interval: Duration::from_millis(100),
        flush_interval: Duration::from_millis(50),
        retry_interval: Duration::from_millis(50),
        ..CollectorOptions::default()
    })
}

// ============================================================================
// End-to-end pipeline tests
// ============================================================================

#[test]
fn readings_and_metadata_post_to_their_routes() {
    let (base_url, server) = spawn_http_server(vec![200, 200], 2);

    let source = Arc::new(MetricSource::new(SourceOptions::default()).unwrap());
    let counter = source
        .add_counter("c", "requests", "served requests", &[("host", "A")])
        .unwrap();
    counter.increment().unwrap();
    counter.increment().unwrap();

    let mut collector = collector_for(&source, &base_url);
    collector.start().unwrap();
    let recorded = server.join().unwrap();
    collector.stop().unwrap();

    let put = recorded
        .iter()
        .find(|r| r.path == "/api/put")
        .expect("readings request");
    assert!(put.gzip, "readings are gzipped");
    let points = put.json();
    let points = points.as_array().unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0]["metric"], "c");
    assert_eq!(points[0]["value"], 2.0);
    assert_eq!(points[0]["tags"]["host"], "A");
    assert!(points[0]["timestamp"].as_u64().is_some());

    let metadata = recorded
        .iter()
        .find(|r| r.path == "/api/metadata/put")
        .expect("metadata request");
    assert!(!metadata.gzip, "metadata is not gzipped");
    let facts = metadata.json();
    let facts = facts.as_array().unwrap();
    assert!(facts
        .iter()
        .any(|f| f["metric"] == "c" && f["name"] == "rate" && f["value"] == "counter"));
    assert!(facts
        .iter()
        .any(|f| f["metric"] == "c" && f["name"] == "unit" && f["value"] == "requests"));
    assert!(facts
        .iter()
        .any(|f| f["metric"] == "c" && f["name"] == "desc" && f["value"] == "served requests"));
}

#[test]
fn metadata_is_not_resent_within_the_refresh_window() {
    let (base_url, server) = spawn_http_server(vec![200, 200, 200], 3);

    let source = Arc::new(MetricSource::new(SourceOptions::default()).unwrap());
    let gauge = source.add_sampling_gauge("g", "", "", &[]).unwrap();
    gauge.record(1.0).unwrap();

    let mut collector = collector_for(&source, &base_url);
    collector.start().unwrap();
    // A sampling gauge re-emits every snapshot, so three requests arrive:
    // one metadata post plus at least two reading posts.
    let recorded = server.join().unwrap();
    collector.stop().unwrap();

    let metadata_posts = recorded
        .iter()
        .filter(|r| r.path == "/api/metadata/put")
        .count();
    assert_eq!(metadata_posts, 1, "{recorded:?}");
}

#[test]
fn retriable_failures_retry_and_preserve_the_payload() {
    let (base_url, server) = spawn_http_server(vec![500, 200, 200], 3);

    let sends: Arc<Mutex<Vec<AfterSendInfo>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = sends.clone();

    let source = Arc::new(MetricSource::new(SourceOptions::default()).unwrap());
    let counter = source.add_counter("c", "", "", &[]).unwrap();
    counter.increment().unwrap();

    let endpoint = BufferedHandler::new(
        "opentsdb",
        OpenTsdbEndpoint::new(Some(base_url.as_str())).unwrap(),
    );
    let mut collector = MetricsCollector::new(CollectorOptions {
        sources: vec![source.clone()],
        endpoints: vec![endpoint],
        snapshot_interval: Duration::from_millis(100),
        flush_interval: Duration::from_millis(50),
        retry_interval: Duration::from_millis(50),
        after_send: vec![Arc::new(move |info: &AfterSendInfo| {
            sink.lock().unwrap().push(info.clone());
        })],
        ..CollectorOptions::default()
    });

    collector.start().unwrap();
    let recorded = server.join().unwrap();
    // AfterSend hooks run on detached threads; give them a moment.
    std::thread::sleep(Duration::from_millis(200));
    collector.stop().unwrap();

    let puts: Vec<&RecordedRequest> = recorded.iter().filter(|r| r.path == "/api/put").collect();
    assert_eq!(puts.len(), 2, "failed send is retried: {recorded:?}");
    assert_eq!(puts[0].json(), puts[1].json(), "the same payload is retried");

    let sends = sends.lock().unwrap();
    let put_outcomes: Vec<bool> = sends
        .iter()
        .filter(|info| info.payload_type == tidemark_metrics::PayloadType::Counter)
        .map(|info| info.success)
        .collect();
    assert_eq!(
        put_outcomes,
        vec![true],
        "one delivery outcome per payload, not per attempt"
    );
}
