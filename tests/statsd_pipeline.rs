use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tidemark_metrics::{
    AggregatorSpec, BufferedHandler, CollectorOptions, MetricSource, MetricsCollector,
    SourceOptions, StatsdEndpoint, TagValue,
};

// ============================================================================
// Helper functions to reduce test code duplication
// ============================================================================

/// Binds a UDP receiver and returns its address plus a thread collecting all
/// datagrams until a quiet period elapses.
fn spawn_udp_receiver() -> (SocketAddr, JoinHandle<Vec<String>>) {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("couldn't bind to address");
    let addr = socket.local_addr().expect("local_addr failed");
    let handle = std::thread::spawn(move || {
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("set_read_timeout failed");
        let mut buf = [0; 10000];
        let mut received = Vec::<String>::new();
        while let Ok((number_of_bytes, _)) = socket.recv_from(&mut buf) {
            let filled_buf = &buf[..number_of_bytes];
            received.push(String::from_utf8(filled_buf.to_vec()).unwrap());
        }
        received
    });
    (addr, handle)
}

fn statsd_collector(source: &Arc<MetricSource>, destination: SocketAddr) -> MetricsCollector {
    let endpoint = BufferedHandler::new(
        "statsd",
        StatsdEndpoint::new("127.0.0.1:0".parse().unwrap(), Some(destination)).unwrap(),
    )
    .with_limits(1432, 64);

    MetricsCollector::new(CollectorOptions {
        sources: vec![source.clone()],
        endpoints: vec![endpoint],
        snapshot_interval: Duration::from_millis(100),
        flush_interval: Duration::from_millis(50),
        retry_interval: Duration::from_millis(50),
        ..CollectorOptions::default()
    })
}

fn run_for(collector: &mut MetricsCollector, duration: Duration) {
    collector.start().unwrap();
    std::thread::sleep(duration);
    collector.stop().unwrap();
}

// ============================================================================
// End-to-end pipeline tests
// ============================================================================

#[test]
fn counter_increments_reach_the_wire_once() {
    let (addr, receiver) = spawn_udp_receiver();

    let source = Arc::new(MetricSource::new(SourceOptions::default()).unwrap());
    let counter = source.add_counter("c", "", "", &[("host", "A")]).unwrap();
    counter.increment().unwrap();
    counter.increment().unwrap();

    let mut collector = statsd_collector(&source, addr);
    run_for(&mut collector, Duration::from_millis(400));

    let all_text = receiver.join().unwrap().join("");
    assert_eq!(
        all_text.matches("c:2.00000|c|#host:A\n").count(),
        1,
        "the delta ships once and the counter resets: {all_text:?}"
    );
    assert_eq!(
        all_text.matches("c:0").count(),
        0,
        "zero-valued counters emit nothing"
    );
}

#[test]
fn aggregate_gauges_ship_every_suffix() {
    let (addr, receiver) = spawn_udp_receiver();

    let source = Arc::new(MetricSource::new(SourceOptions::default()).unwrap());
    let gauge = source
        .add_aggregate_gauge(
            "lat",
            "ms",
            "",
            &[],
            vec![
                AggregatorSpec::average(),
                AggregatorSpec::max(),
                AggregatorSpec::min(),
                AggregatorSpec::median(),
                AggregatorSpec::percentile(0.95).unwrap(),
                AggregatorSpec::percentile(0.99).unwrap(),
                AggregatorSpec::count(),
            ],
        )
        .unwrap();
    for value in [2.4, 1.2, 4.8, 38.4, 19.2, 9.6] {
        gauge.record(value).unwrap();
    }

    let mut collector = statsd_collector(&source, addr);
    run_for(&mut collector, Duration::from_millis(400));

    let all_text = receiver.join().unwrap().join("");
    assert!(all_text.contains("lat_avg:12.60000|g"), "{all_text:?}");
    assert!(all_text.contains("lat_max:38.40000|g"));
    assert!(all_text.contains("lat_min:1.20000|g"));
    assert!(all_text.contains("lat_median:4.80000|g"));
    assert!(all_text.contains("lat_95:38.40000|g"));
    assert!(all_text.contains("lat_99:38.40000|g"));
    assert!(all_text.contains("lat_count:6.00000|g"));
    // Later (empty) windows stay observable through the zero count.
    assert!(all_text.contains("lat_count:0.00000|g"));
}

#[derive(Clone, Copy)]
enum Shard {
    A,
    B,
}

impl TagValue for Shard {
    fn render(&self) -> std::borrow::Cow<'_, str> {
        std::borrow::Cow::Borrowed(match self {
            Shard::A => "A",
            Shard::B => "B",
        })
    }
}

#[test]
fn tagged_family_fans_out_per_tuple() {
    let (addr, receiver) = spawn_udp_receiver();

    let source = Arc::new(MetricSource::new(SourceOptions::default()).unwrap());
    let family = source
        .add_tagged_counters::<(&str, Shard)>(
            "fam",
            "",
            "",
            vec!["route".into(), "shard".into()],
        )
        .unwrap();
    family.get(("x", Shard::A)).unwrap().increment().unwrap();
    family.get(("x", Shard::A)).unwrap().increment().unwrap();
    family.get(("y", Shard::B)).unwrap().increment().unwrap();

    let mut collector = statsd_collector(&source, addr);
    run_for(&mut collector, Duration::from_millis(400));

    let all_text = receiver.join().unwrap().join("");
    assert!(all_text.contains("fam:2.00000|c|#route:x,shard:A"), "{all_text:?}");
    assert!(all_text.contains("fam:1.00000|c|#route:y,shard:B"));
}

#[test]
fn default_tags_are_folded_into_every_reading() {
    let (addr, receiver) = spawn_udp_receiver();

    let options = SourceOptions {
        default_tags: vec![("host".into(), "web1".into())],
        ..SourceOptions::default()
    };
    let source = Arc::new(MetricSource::new(options).unwrap());
    let counter = source.add_counter("hits", "", "", &[]).unwrap();
    counter.increment().unwrap();

    let mut collector = statsd_collector(&source, addr);
    run_for(&mut collector, Duration::from_millis(400));

    let all_text = receiver.join().unwrap().join("");
    assert!(all_text.contains("hits:1.00000|c|#host:web1"), "{all_text:?}");
}
