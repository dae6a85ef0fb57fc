use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crossbeam::channel::{tick, unbounded, Receiver, Sender, TryRecvError};
use crossbeam::select;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::MetricsError;
use crate::handler::{AfterSendInfo, BufferedHandler, MetricBatch};
use crate::reading::{Metadata, Reading, ReadingBatch};
use crate::source::MetricSource;
use crate::MetricResult;

/// Receives every background error, after the `throw_on_*` gates.
pub type ExceptionHandler = Arc<dyn Fn(&MetricsError) + Send + Sync>;

/// Runs at the start of every snapshot tick; errors go to the exception
/// handler.
pub type BeforeSerializationHook = Arc<dyn Fn() -> MetricResult<()> + Send + Sync>;

/// Runs at the end of every snapshot tick with that tick's totals.
pub type AfterSerializationHook = Arc<dyn Fn(&SerializationInfo) + Send + Sync>;

/// Runs after every payload delivery outcome, on a detached thread so
/// listener latency cannot stall flushing.
pub type AfterSendHook = Arc<dyn Fn(&AfterSendInfo) + Send + Sync>;

/// Metadata is re-sent this long after the previous metadata flush even
/// when no new metric was registered.
const METADATA_REFRESH: Duration = Duration::from_secs(24 * 60 * 60);

/// Totals of one snapshot tick, handed to `AfterSerialization` hooks.
#[derive(Debug, Clone)]
pub struct SerializationInfo {
    /// Bytes appended across all endpoint buffers.
    pub bytes_written: usize,
    /// Readings produced by all sources.
    pub readings_written: usize,
    /// Wall time the tick took.
    pub duration: Duration,
    /// When the tick started.
    pub start_time: SystemTime,
}

/// Configuration for a [`MetricsCollector`].
pub struct CollectorOptions {
    /// The sources whose metrics are sampled every snapshot tick.
    pub sources: Vec<Arc<MetricSource>>,
    /// The endpoints readings are shipped to, flushed in this order.
    pub endpoints: Vec<BufferedHandler>,
    /// Period between reading-emission passes.
    pub snapshot_interval: Duration,
    /// Period between endpoint drains.
    pub flush_interval: Duration,
    /// Delay between failed sends.
    pub retry_interval: Duration,
    /// Max consecutive retries per flush pass.
    pub retry_count: u32,
    /// Deliver post failures to the exception handler.
    pub throw_on_post_fail: bool,
    /// Deliver queue-overflow drops to the exception handler.
    pub throw_on_queue_full: bool,
    /// Receives background errors; when absent they are logged.
    pub exception_handler: Option<ExceptionHandler>,
    /// Hooks run before each snapshot tick serializes.
    pub before_serialization: Vec<BeforeSerializationHook>,
    /// Hooks run after each snapshot tick serializes.
    pub after_serialization: Vec<AfterSerializationHook>,
    /// Hooks run after each payload delivery outcome.
    pub after_send: Vec<AfterSendHook>,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            endpoints: Vec::new(),
            snapshot_interval: Duration::from_secs(30),
            flush_interval: Duration::from_secs(1),
            retry_interval: Duration::from_secs(5),
            retry_count: 3,
            throw_on_post_fail: false,
            throw_on_queue_full: false,
            exception_handler: None,
            before_serialization: Vec::new(),
            after_serialization: Vec::new(),
            after_send: Vec::new(),
        }
    }
}

struct CollectorShared {
    sources: Vec<Arc<MetricSource>>,
    endpoints: Vec<BufferedHandler>,
    snapshot_interval: Duration,
    flush_interval: Duration,
    retry_interval: Duration,
    retry_count: u32,
    throw_on_post_fail: bool,
    throw_on_queue_full: bool,
    exception_handler: Option<ExceptionHandler>,
    before_serialization: Vec<BeforeSerializationHook>,
    after_serialization: Vec<AfterSerializationHook>,
    after_send: Vec<AfterSendHook>,
    has_new_metadata: Arc<AtomicBool>,
    last_metadata_flush: Mutex<Option<Instant>>,
}

impl CollectorShared {
    /// Routes a background error through the suppression gates to the
    /// exception handler.
    fn report(&self, err: MetricsError) {
        let suppressed = match &err {
            MetricsError::PostFailure { .. } => !self.throw_on_post_fail,
            MetricsError::QueueFull { .. } => !self.throw_on_queue_full,
            _ => false,
        };
        if suppressed {
            debug!("Suppressed background error: {err}");
            return;
        }
        match &self.exception_handler {
            Some(handler) => handler(&err),
            None => error!("Background error: {err}"),
        }
    }
}

/// Fans one reading out to every endpoint's batch, routing per-endpoint
/// failures to the exception handler so one bad endpoint cannot starve the
/// others.
struct CompositeBatch<'a, 'b> {
    shared: &'a CollectorShared,
    batches: &'b mut [MetricBatch<'a>],
    readings_written: &'b mut usize,
}

impl ReadingBatch for CompositeBatch<'_, '_> {
    fn add(&mut self, reading: &Reading) -> MetricResult<()> {
        *self.readings_written += 1;
        for batch in self.batches.iter_mut() {
            if let Err(err) = batch.add(reading) {
                self.shared.report(err);
            }
        }
        Ok(())
    }
}

fn run_snapshot(shared: &CollectorShared) {
    let start_time = SystemTime::now();
    let started = Instant::now();

    for hook in &shared.before_serialization {
        if let Err(err) = hook() {
            shared.report(err);
        }
    }

    let now = SystemTime::now();
    let mut batches: Vec<MetricBatch<'_>> = shared
        .endpoints
        .iter()
        .map(BufferedHandler::begin_batch)
        .collect();
    let mut readings_written = 0usize;
    {
        let mut composite = CompositeBatch {
            shared,
            batches: &mut batches,
            readings_written: &mut readings_written,
        };
        for source in &shared.sources {
            source.write_readings(&mut composite, now);
        }
    }
    let bytes_written: usize = batches.iter().map(MetricBatch::bytes_written).sum();
    drop(batches);

    // Metadata follows the tick's readings so it never describes a metric
    // whose first reading has not been serialized yet.
    let mut refresh = shared.has_new_metadata.swap(false, Ordering::Relaxed);
    if !refresh {
        refresh = shared
            .last_metadata_flush
            .lock()
            .is_none_or(|last| last.elapsed() >= METADATA_REFRESH);
    }
    if refresh {
        let metadata: Vec<Metadata> = shared.sources.iter().flat_map(|s| s.metadata()).collect();
        for endpoint in &shared.endpoints {
            if let Err(err) = endpoint.serialize_metadata(&metadata) {
                shared.report(err);
            }
        }
        *shared.last_metadata_flush.lock() = Some(Instant::now());
    }

    let info = SerializationInfo {
        bytes_written,
        readings_written,
        duration: started.elapsed(),
        start_time,
    };
    for hook in &shared.after_serialization {
        hook(&info);
    }
}

/// Invokes `AfterSend` hooks on a detached thread; a panicking hook is
/// caught and ignored so it cannot take the flush loop down.
fn dispatch_after_send(shared: &Arc<CollectorShared>, info: AfterSendInfo) {
    if shared.after_send.is_empty() {
        return;
    }
    let hooks = shared.after_send.clone();
    std::thread::spawn(move || {
        for hook in &hooks {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(&info)));
        }
    });
}

fn shutdown_requested(shutdown: &Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}

fn snapshot_loop(shared: &Arc<CollectorShared>, shutdown: &Receiver<()>) {
    let ticker = tick(shared.snapshot_interval);
    loop {
        select! {
            recv(ticker) -> _ => {}
            recv(shutdown) -> _ => return,
        }
        run_snapshot(shared);
    }
}

fn flush_loop(shared: &Arc<CollectorShared>, shutdown: &Receiver<()>) {
    let ticker = tick(shared.flush_interval);
    loop {
        select! {
            recv(ticker) -> _ => {}
            recv(shutdown) -> _ => return,
        }
        for endpoint in &shared.endpoints {
            if shutdown_requested(shutdown) {
                return;
            }
            endpoint.flush(
                shared.retry_interval,
                shared.retry_count,
                &|info| dispatch_after_send(shared, info),
                &|err| shared.report(err),
                Some(shutdown),
            );
        }
    }
}

/// Owns sources and endpoints and runs the two background loops: the
/// snapshot loop samples every metric into the endpoint buffers, the flush
/// loop drains the buffers to the network. The loops are independent; there
/// is no barrier between them.
pub struct MetricsCollector {
    shared: Arc<CollectorShared>,
    shutdown: Option<Sender<()>>,
    snapshot_handle: Option<JoinHandle<()>>,
    flush_handle: Option<JoinHandle<()>>,
    started: bool,
}

impl MetricsCollector {
    /// Creates a collector; nothing runs until [`start`](Self::start).
    #[must_use]
    pub fn new(options: CollectorOptions) -> Self {
        Self {
            shared: Arc::new(CollectorShared {
                sources: options.sources,
                endpoints: options.endpoints,
                snapshot_interval: options.snapshot_interval,
                flush_interval: options.flush_interval,
                retry_interval: options.retry_interval,
                retry_count: options.retry_count,
                throw_on_post_fail: options.throw_on_post_fail,
                throw_on_queue_full: options.throw_on_queue_full,
                exception_handler: options.exception_handler,
                before_serialization: options.before_serialization,
                after_serialization: options.after_serialization,
                after_send: options.after_send,
                // True from the start so the first snapshot tick sends
                // metadata for everything registered before start().
                has_new_metadata: Arc::new(AtomicBool::new(true)),
                last_metadata_flush: Mutex::new(None),
            }),
            shutdown: None,
            snapshot_handle: None,
            flush_handle: None,
            started: false,
        }
    }

    /// Spawns the snapshot and flush loops.
    ///
    /// # Errors
    /// `InvalidState` when the collector was already started.
    pub fn start(&mut self) -> MetricResult<()> {
        if self.started {
            return Err(MetricsError::InvalidState("collector already started"));
        }
        self.started = true;

        for source in &self.shared.sources {
            source.subscribe_registrations(&self.shared.has_new_metadata);
        }

        let (shutdown_tx, shutdown_rx) = unbounded::<()>();
        let snapshot_shared = self.shared.clone();
        let snapshot_rx = shutdown_rx.clone();
        self.snapshot_handle = Some(std::thread::spawn(move || {
            snapshot_loop(&snapshot_shared, &snapshot_rx);
        }));
        let flush_shared = self.shared.clone();
        self.flush_handle = Some(std::thread::spawn(move || {
            flush_loop(&flush_shared, &shutdown_rx);
        }));
        self.shutdown = Some(shutdown_tx);
        Ok(())
    }

    /// Cancels both loops, joins them, and drains every endpoint: active
    /// buffers are sealed and each remaining payload is attempted once with
    /// no retry.
    ///
    /// # Errors
    /// `InvalidState` when the collector was never started or was already
    /// stopped.
    pub fn stop(&mut self) -> MetricResult<()> {
        if !self.started {
            return Err(MetricsError::InvalidState("collector was never started"));
        }
        let Some(shutdown) = self.shutdown.take() else {
            return Err(MetricsError::InvalidState("collector already stopped"));
        };
        // Dropping the sender disconnects the channel, which interrupts the
        // pending interval wait in both loops.
        drop(shutdown);
        if let Some(handle) = self.snapshot_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.flush_handle.take() {
            let _ = handle.join();
        }
        for endpoint in &self.shared.endpoints {
            endpoint.drain();
        }
        Ok(())
    }
}

impl Drop for MetricsCollector {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SourceOptions;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn stop_before_start_is_invalid() {
        let mut collector = MetricsCollector::new(CollectorOptions::default());
        assert!(matches!(
            collector.stop(),
            Err(MetricsError::InvalidState(_))
        ));
    }

    #[test]
    fn double_start_is_invalid() {
        let mut collector = MetricsCollector::new(CollectorOptions::default());
        collector.start().unwrap();
        assert!(matches!(
            collector.start(),
            Err(MetricsError::InvalidState(_))
        ));
        collector.stop().unwrap();
    }

    #[test]
    fn double_stop_is_invalid() {
        let mut collector = MetricsCollector::new(CollectorOptions::default());
        collector.start().unwrap();
        collector.stop().unwrap();
        assert!(matches!(
            collector.stop(),
            Err(MetricsError::InvalidState(_))
        ));
    }

    #[test]
    fn before_serialization_errors_reach_the_exception_handler() {
        let seen: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let source = Arc::new(MetricSource::new(SourceOptions::default()).unwrap());
        let options = CollectorOptions {
            sources: vec![source],
            exception_handler: Some(Arc::new(move |err| {
                sink.lock().unwrap().push(err.to_string());
            })),
            before_serialization: vec![Arc::new(|| Err(MetricsError::Custom("boom".into())))],
            ..CollectorOptions::default()
        };
        let collector = MetricsCollector::new(options);

        run_snapshot(&collector.shared);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("boom"));
    }

    #[test]
    fn serialization_hooks_observe_tick_totals() {
        let infos: Arc<StdMutex<Vec<SerializationInfo>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = infos.clone();
        let source = Arc::new(MetricSource::new(SourceOptions::default()).unwrap());
        let counter = source.add_counter("hits", "", "", &[]).unwrap();
        counter.increment().unwrap();

        let options = CollectorOptions {
            sources: vec![source],
            after_serialization: vec![Arc::new(move |info: &SerializationInfo| {
                sink.lock().unwrap().push(info.clone());
            })],
            ..CollectorOptions::default()
        };
        let collector = MetricsCollector::new(options);

        run_snapshot(&collector.shared);
        let infos = infos.lock().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].readings_written, 1);
    }
}
