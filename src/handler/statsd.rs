use std::io::Write;
use std::net::{SocketAddr, UdpSocket};

use crate::handler::{EndpointEncoder, PayloadType, PostError};
use crate::reading::{Metadata, MetricType, Reading};
use crate::MetricResult;

/// StatsD / DogStatsD UDP endpoint.
///
/// Each reading becomes one UTF-8 line, `name:value|{c|g}|#tag:val,...`,
/// with the value formatted as fixed-point with 5 decimal digits. Each
/// sealed payload is sent as one datagram, so the handler's
/// `max_payload_size` should stay within the path MTU. The format has no
/// representation for metadata, so metadata is discarded.
pub struct StatsdEndpoint {
    destination: Option<(UdpSocket, SocketAddr)>,
}

impl StatsdEndpoint {
    /// Binds a local UDP socket targeting `destination`. A `None`
    /// destination produces a disabled endpoint that discards everything.
    ///
    /// # Errors
    /// Socket bind failures.
    pub fn new(bind_addr: SocketAddr, destination: Option<SocketAddr>) -> MetricResult<Self> {
        let destination = match destination {
            Some(addr) => Some((UdpSocket::bind(bind_addr)?, addr)),
            None => None,
        };
        Ok(Self { destination })
    }
}

fn push_value(out: &mut Vec<u8>, value: f64) {
    // Counters and most gauges are integral; itoa plus a constant fraction
    // is cheaper than float formatting.
    #[allow(clippy::cast_possible_truncation)]
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 {
        let mut buffer = itoa::Buffer::new();
        out.extend_from_slice(buffer.format(value as i64).as_bytes());
        out.extend_from_slice(b".00000");
    } else {
        // Writing into a Vec cannot fail.
        let _ = write!(out, "{value:.5}");
    }
}

impl EndpointEncoder for StatsdEndpoint {
    fn serialize_reading(&self, out: &mut Vec<u8>, reading: &Reading) -> MetricResult<()> {
        out.extend_from_slice(reading.name.as_bytes());
        out.push(b':');
        push_value(out, reading.value);
        out.push(b'|');
        out.push(match reading.metric_type {
            MetricType::Counter | MetricType::CumulativeCounter => b'c',
            MetricType::Gauge => b'g',
        });
        if !reading.tags.is_empty() {
            out.extend_from_slice(b"|#");
            for (i, (name, value)) in reading.tags.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(name.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
        }
        out.push(b'\n');
        Ok(())
    }

    fn serialize_metadata(&self, _out: &mut Vec<u8>, _metadata: &[Metadata]) -> MetricResult<()> {
        Ok(())
    }

    fn supports_metadata(&self) -> bool {
        false
    }

    fn send(&self, _payload_type: PayloadType, bytes: &[u8]) -> Result<(), PostError> {
        let Some((socket, destination)) = &self.destination else {
            return Ok(());
        };
        socket
            .send_to(bytes, destination)
            .map_err(|err| PostError::retriable(format!("UDP send to {destination}: {err}")))?;
        Ok(())
    }
}
