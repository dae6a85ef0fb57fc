use std::sync::Arc;
use std::time::SystemTime;

use tidemark_metrics::{AggregatorSpec, MetricSource, Reading, SourceOptions};

const THREADS: usize = 8;
const UPDATES_PER_THREAD: u64 = 10_000;

/// Counter deltas must be conserved across snapshots taken while producer
/// threads are still incrementing: every increment shows up in exactly one
/// snapshot.
#[test]
fn counter_deltas_are_conserved_under_contention() {
    let source = Arc::new(MetricSource::new(SourceOptions::default()).unwrap());
    let counter = source.add_counter("stress.hits", "", "", &[]).unwrap();

    let producers: Vec<_> = (0..THREADS)
        .map(|_| {
            let counter = counter.clone();
            std::thread::spawn(move || {
                for _ in 0..UPDATES_PER_THREAD {
                    counter.increment().unwrap();
                }
            })
        })
        .collect();

    // Snapshot concurrently with the producers.
    let mut readings: Vec<Reading> = Vec::new();
    while producers.iter().any(|p| !p.is_finished()) {
        source.write_readings(&mut readings, SystemTime::now());
    }
    for producer in producers {
        producer.join().unwrap();
    }
    // One final snapshot collects whatever the last mid-flight pass missed.
    source.write_readings(&mut readings, SystemTime::now());

    let total: f64 = readings.iter().map(|r| r.value).sum();
    assert_eq!(total, (THREADS as u64 * UPDATES_PER_THREAD) as f64);
}

#[test]
fn aggregate_counts_are_conserved_under_contention() {
    let source = Arc::new(MetricSource::new(SourceOptions::default()).unwrap());
    let gauge = source
        .add_aggregate_gauge(
            "stress.latency",
            "ms",
            "",
            &[],
            vec![AggregatorSpec::count(), AggregatorSpec::max()],
        )
        .unwrap();

    let producers: Vec<_> = (0..THREADS)
        .map(|t| {
            let gauge = gauge.clone();
            std::thread::spawn(move || {
                for i in 0..UPDATES_PER_THREAD {
                    gauge.record((t as u64 * UPDATES_PER_THREAD + i) as f64).unwrap();
                }
            })
        })
        .collect();

    let mut readings: Vec<Reading> = Vec::new();
    while producers.iter().any(|p| !p.is_finished()) {
        source.write_readings(&mut readings, SystemTime::now());
    }
    for producer in producers {
        producer.join().unwrap();
    }
    source.write_readings(&mut readings, SystemTime::now());

    let total_count: f64 = readings
        .iter()
        .filter(|r| r.name.ends_with("_count"))
        .map(|r| r.value)
        .sum();
    assert_eq!(total_count, (THREADS as u64 * UPDATES_PER_THREAD) as f64);

    let overall_max = readings
        .iter()
        .filter(|r| r.name.ends_with("_max"))
        .map(|r| r.value)
        .fold(f64::NEG_INFINITY, f64::max);
    assert_eq!(overall_max, (THREADS as u64 * UPDATES_PER_THREAD - 1) as f64);
}
