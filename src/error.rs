use crate::handler::PayloadType;
use thiserror::Error;

/// Errors that can occur during metric registration, recording and shipping.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// A metric name failed validation after transformation.
    #[error("Invalid metric name: {name}")]
    InvalidName {
        /// The offending (transformed) name.
        name: String,
    },

    /// A tag name failed validation after transformation.
    #[error("Invalid tag name: {name}")]
    InvalidTagName {
        /// The offending (transformed) tag name.
        name: String,
    },

    /// A tag value failed validation after transformation.
    #[error("Invalid tag value for tag {name}: {value}")]
    InvalidTagValue {
        /// The tag the value was supplied for.
        name: String,
        /// The offending (transformed) value.
        value: String,
    },

    /// A metric with the same full key is already registered with a
    /// different shape (kind, unit or suffix set), or a name+suffix
    /// combination collides with an existing registration.
    #[error("Metric already registered with a different shape: {name}")]
    Duplicate {
        /// The colliding metric name.
        name: String,
    },

    /// An update was attempted on a metric that has not been attached to a
    /// source.
    #[error("Metric {name} is not attached to a source")]
    NotAttached {
        /// The detached metric's name.
        name: String,
    },

    /// A payload could not be delivered to the remote sink.
    #[error("Post to {endpoint} failed (retriable: {retriable}): {reason}")]
    PostFailure {
        /// Name of the endpoint that failed.
        endpoint: String,
        /// Whether the payload was re-enqueued for a later attempt.
        retriable: bool,
        /// Transport-level failure description.
        reason: String,
    },

    /// The pending payload queue overflowed and the oldest payload was
    /// dropped.
    #[error("Payload queue full for {payload_type:?}: dropped {metrics_count} readings")]
    QueueFull {
        /// The payload type whose queue overflowed.
        payload_type: PayloadType,
        /// Number of readings contained in the dropped payload.
        metrics_count: u32,
    },

    /// An encoder refused to serialize a reading or metadata fact.
    #[error("Encoder error: {0}")]
    Encoder(String),

    /// The collector was driven through an invalid lifecycle transition.
    #[error("Invalid collector state: {0}")]
    InvalidState(&'static str),

    /// A custom error with a free-form message.
    #[error("Custom error: {0}")]
    Custom(String),

    /// An I/O error from the standard library.
    #[error("Std Io error: {0}")]
    StdIo(#[from] std::io::Error),
}

impl From<String> for MetricsError {
    fn from(value: String) -> Self {
        Self::Custom(value)
    }
}

impl From<&str> for MetricsError {
    fn from(value: &str) -> Self {
        Self::Custom(value.to_string())
    }
}
