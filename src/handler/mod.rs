//! The buffered handler pipeline: per-endpoint serialization buffers,
//! payload chunking, and the retrying drain.
//!
//! Serialization (fast, under a short lock) is decoupled from network I/O
//! (slow, can block): the snapshot loop appends readings into per-type
//! active buffers, sealed into bounded payload queues; the flush loop
//! drains those queues through the endpoint's transport.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};
use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use crate::error::MetricsError;
use crate::reading::{Metadata, MetricType, Reading, ReadingBatch};
use crate::MetricResult;

mod opentsdb;
mod signalfx;
mod statsd;
mod transport;

pub use opentsdb::OpenTsdbEndpoint;
pub use signalfx::SignalFxEndpoint;
pub use statsd::StatsdEndpoint;

/// Default seal threshold for active buffers, in bytes.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 8000;

/// Default bound on each pending payload queue.
pub const DEFAULT_MAX_PAYLOAD_COUNT: usize = 240;

/// The buffer a serialized reading or metadata fact lands in. Each type has
/// its own active buffer and pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadType {
    /// Delta counter readings.
    Counter,
    /// Monotonic counter readings.
    CumulativeCounter,
    /// Gauge readings.
    Gauge,
    /// Metadata facts.
    Metadata,
}

impl PayloadType {
    /// Every payload type, in the stable order flushes drain them.
    pub const ALL: [Self; 4] = [
        Self::Counter,
        Self::CumulativeCounter,
        Self::Gauge,
        Self::Metadata,
    ];

    const fn index(self) -> usize {
        match self {
            Self::Counter => 0,
            Self::CumulativeCounter => 1,
            Self::Gauge => 2,
            Self::Metadata => 3,
        }
    }
}

/// A transport failure reported by an encoder's `send`.
#[derive(Debug)]
pub struct PostError {
    /// Whether the payload should be re-enqueued and retried (network
    /// errors, timeouts and 5xx responses) or dropped (4xx responses).
    pub retriable: bool,
    /// Failure description.
    pub reason: String,
}

impl PostError {
    /// A retriable transport failure.
    #[must_use]
    pub fn retriable(reason: impl Into<String>) -> Self {
        Self {
            retriable: true,
            reason: reason.into(),
        }
    }

    /// A fatal transport failure; the payload is dropped.
    #[must_use]
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            retriable: false,
            reason: reason.into(),
        }
    }
}

/// The contract a concrete endpoint implements against the buffered
/// pipeline: serialization of readings and metadata, payload finalization
/// and the blocking transport.
pub trait EndpointEncoder: Send + Sync + 'static {
    /// Maps a reading's kind to the buffer it serializes into.
    fn payload_type_for(&self, metric_type: MetricType) -> PayloadType {
        match metric_type {
            MetricType::Counter => PayloadType::Counter,
            MetricType::CumulativeCounter => PayloadType::CumulativeCounter,
            MetricType::Gauge => PayloadType::Gauge,
        }
    }

    /// Appends one serialized reading to `out`.
    ///
    /// # Errors
    /// `Encoder` when this sink cannot represent the reading; the batch
    /// continues with the remaining readings.
    fn serialize_reading(&self, out: &mut Vec<u8>, reading: &Reading) -> MetricResult<()>;

    /// Appends serialized metadata facts to `out`.
    ///
    /// # Errors
    /// `Encoder` when the facts cannot be represented.
    fn serialize_metadata(&self, out: &mut Vec<u8>, metadata: &[Metadata]) -> MetricResult<()>;

    /// Whether this sink has a representation for metadata. When `false`,
    /// metadata handed to the handler is silently discarded.
    fn supports_metadata(&self) -> bool {
        true
    }

    /// Adjusts a sealed buffer into its final payload form (e.g. trims a
    /// trailing separator, wraps a JSON array).
    fn prepare_sequence(&self, bytes: Vec<u8>, payload_type: PayloadType) -> Vec<u8> {
        let _ = payload_type;
        bytes
    }

    /// Delivers one payload to the remote sink, blocking until the
    /// transport finishes. Implementations carry their own timeout;
    /// expiration surfaces as a retriable failure.
    ///
    /// # Errors
    /// [`PostError`] describing whether the payload may be retried.
    fn send(&self, payload_type: PayloadType, bytes: &[u8]) -> Result<(), PostError>;
}

/// Outcome of one payload delivery, handed to `AfterSend` listeners.
#[derive(Debug, Clone)]
pub struct AfterSendInfo {
    /// Name of the endpoint that sent.
    pub endpoint: Arc<str>,
    /// The payload type delivered.
    pub payload_type: PayloadType,
    /// Size of the payload in bytes.
    pub bytes_written: usize,
    /// Wall time the final transport attempt took.
    pub duration: Duration,
    /// Whether the payload was delivered.
    pub success: bool,
}

struct Payload {
    bytes: Vec<u8>,
    metric_count: u32,
}

#[derive(Default)]
struct ActiveBuffer {
    bytes: Vec<u8>,
    metric_count: u32,
}

/// One telemetry endpoint: an encoder plus the buffering, chunking, retry
/// and overflow machinery around it.
pub struct BufferedHandler {
    name: Arc<str>,
    encoder: Box<dyn EndpointEncoder>,
    max_payload_size: usize,
    max_payload_count: usize,
    active: [Mutex<ActiveBuffer>; 4],
    pending: [Mutex<VecDeque<Payload>>; 4],
}

impl BufferedHandler {
    /// Wraps `encoder` with the default payload limits.
    #[must_use]
    pub fn new(name: impl Into<String>, encoder: impl EndpointEncoder) -> Self {
        Self {
            name: Arc::from(name.into()),
            encoder: Box::new(encoder),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_payload_count: DEFAULT_MAX_PAYLOAD_COUNT,
            active: std::array::from_fn(|_| Mutex::new(ActiveBuffer::default())),
            pending: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
        }
    }

    /// Overrides the seal threshold and the pending-queue bound.
    #[must_use]
    pub fn with_limits(mut self, max_payload_size: usize, max_payload_count: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self.max_payload_count = max_payload_count;
        self
    }

    /// The endpoint's display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of sealed payloads waiting to be sent for `payload_type`.
    #[must_use]
    pub fn pending_payloads(&self, payload_type: PayloadType) -> usize {
        self.pending[payload_type.index()].lock().len()
    }

    /// Opens a batch for one snapshot tick. Each payload type's buffer lock
    /// is taken on first use and held until the batch is dropped.
    #[must_use]
    pub fn begin_batch(&self) -> MetricBatch<'_> {
        MetricBatch {
            handler: self,
            guards: [None, None, None],
            bytes_written: 0,
        }
    }

    /// Serializes metadata facts and seals them into a payload immediately.
    ///
    /// Sinks without a metadata representation discard the facts silently.
    ///
    /// # Errors
    /// Encoder failures, or `QueueFull` when sealing overflowed the pending
    /// queue (the facts themselves were kept; the oldest payload was
    /// dropped).
    pub fn serialize_metadata(&self, metadata: &[Metadata]) -> MetricResult<()> {
        if !self.encoder.supports_metadata() || metadata.is_empty() {
            return Ok(());
        }
        let index = PayloadType::Metadata.index();
        let mut active = self.active[index].lock();
        self.encoder.serialize_metadata(&mut active.bytes, metadata)?;
        active.metric_count += u32::try_from(metadata.len()).unwrap_or(u32::MAX);
        self.seal(PayloadType::Metadata, &mut active)
    }

    /// Seals `active` into the pending queue, dropping the oldest payload
    /// on overflow.
    fn seal(&self, payload_type: PayloadType, active: &mut ActiveBuffer) -> MetricResult<()> {
        if active.bytes.is_empty() {
            return Ok(());
        }
        let sealed = std::mem::take(&mut *active);
        let payload = Payload {
            bytes: self.encoder.prepare_sequence(sealed.bytes, payload_type),
            metric_count: sealed.metric_count,
        };

        let mut pending = self.pending[payload_type.index()].lock();
        pending.push_back(payload);
        if pending.len() > self.max_payload_count {
            if let Some(dropped) = pending.pop_front() {
                return Err(MetricsError::QueueFull {
                    payload_type,
                    metrics_count: dropped.metric_count,
                });
            }
        }
        Ok(())
    }

    /// Drains every payload type in stable order, sending each pending
    /// payload to the remote sink.
    ///
    /// A retriable failure re-enqueues the payload at the head and retries
    /// after `retry_interval`; once more than `retry_count` consecutive
    /// attempts have failed the flush gives up. Fatal failures drop the
    /// payload. All failures are reported through `on_error`; delivery
    /// outcomes go to `on_after_send`.
    pub fn flush(
        &self,
        retry_interval: Duration,
        retry_count: u32,
        on_after_send: &dyn Fn(AfterSendInfo),
        on_error: &dyn Fn(MetricsError),
        cancel: Option<&Receiver<()>>,
    ) {
        let mut consecutive_failures = 0u32;
        for payload_type in PayloadType::ALL {
            {
                let mut active = self.active[payload_type.index()].lock();
                if let Err(err) = self.seal(payload_type, &mut active) {
                    on_error(err);
                }
            }

            loop {
                if is_cancelled(cancel) {
                    return;
                }
                let Some(payload) = self.pending[payload_type.index()].lock().pop_front() else {
                    break;
                };

                let started = Instant::now();
                match self.encoder.send(payload_type, &payload.bytes) {
                    Ok(()) => {
                        consecutive_failures = 0;
                        on_after_send(AfterSendInfo {
                            endpoint: self.name.clone(),
                            payload_type,
                            bytes_written: payload.bytes.len(),
                            duration: started.elapsed(),
                            success: true,
                        });
                    }
                    Err(err) if err.retriable => {
                        // Not yet delivered: back to the head of the queue.
                        self.pending[payload_type.index()]
                            .lock()
                            .push_front(payload);
                        consecutive_failures += 1;
                        if consecutive_failures > retry_count {
                            on_error(MetricsError::PostFailure {
                                endpoint: self.name.to_string(),
                                retriable: true,
                                reason: err.reason,
                            });
                            return;
                        }
                        if !sleep_unless_cancelled(retry_interval, cancel) {
                            return;
                        }
                    }
                    Err(err) => {
                        on_after_send(AfterSendInfo {
                            endpoint: self.name.clone(),
                            payload_type,
                            bytes_written: payload.bytes.len(),
                            duration: started.elapsed(),
                            success: false,
                        });
                        on_error(MetricsError::PostFailure {
                            endpoint: self.name.to_string(),
                            retriable: false,
                            reason: err.reason,
                        });
                    }
                }
            }
        }
    }

    /// Shutdown drain: seals the active buffers and attempts each remaining
    /// payload once, with no retry.
    pub fn drain(&self) {
        for payload_type in PayloadType::ALL {
            {
                let mut active = self.active[payload_type.index()].lock();
                if let Err(err) = self.seal(payload_type, &mut active) {
                    warn!("{}: dropped payload while draining: {err}", self.name);
                }
            }
            loop {
                let Some(payload) = self.pending[payload_type.index()].lock().pop_front() else {
                    break;
                };
                if let Err(err) = self.encoder.send(payload_type, &payload.bytes) {
                    warn!(
                        "{}: final send of {payload_type:?} payload failed: {}",
                        self.name, err.reason
                    );
                }
            }
        }
    }
}

/// Accepts the readings of one snapshot tick for one endpoint.
///
/// Dropping the batch releases the buffer locks; bytes appended so far are
/// either still in the active buffers or sealed into pending payloads.
pub struct MetricBatch<'a> {
    handler: &'a BufferedHandler,
    guards: [Option<MutexGuard<'a, ActiveBuffer>>; 3],
    bytes_written: usize,
}

impl MetricBatch<'_> {
    /// Bytes this batch has appended across all payload types.
    #[must_use]
    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }
}

impl ReadingBatch for MetricBatch<'_> {
    fn add(&mut self, reading: &Reading) -> MetricResult<()> {
        let payload_type = self.handler.encoder.payload_type_for(reading.metric_type);
        let index = payload_type.index();
        let guard = match &mut self.guards[index] {
            Some(guard) => guard,
            slot => slot.insert(self.handler.active[index].lock()),
        };

        let before = guard.bytes.len();
        if let Err(err) = self.handler.encoder.serialize_reading(&mut guard.bytes, reading) {
            guard.bytes.truncate(before);
            return Err(err);
        }
        guard.metric_count += 1;
        self.bytes_written += guard.bytes.len() - before;

        if guard.bytes.len() >= self.handler.max_payload_size {
            self.handler.seal(payload_type, guard)?;
        }
        Ok(())
    }
}

fn is_cancelled(cancel: Option<&Receiver<()>>) -> bool {
    cancel.is_some_and(|rx| !matches!(rx.try_recv(), Err(TryRecvError::Empty)))
}

/// Returns `false` when the wait was interrupted by cancellation.
fn sleep_unless_cancelled(interval: Duration, cancel: Option<&Receiver<()>>) -> bool {
    match cancel {
        None => {
            std::thread::sleep(interval);
            true
        }
        Some(rx) => matches!(rx.recv_timeout(interval), Err(RecvTimeoutError::Timeout)),
    }
}
