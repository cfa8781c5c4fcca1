//! Error model.

use thiserror::Error;

/// Result type used across the broker layer.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Broker-level error.
///
/// Handler outcomes (retry requests, handler failures) are not represented
/// here: they never leave the consumption loop and are converted into an
/// ack, a delayed retry or a reject.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Connecting to the broker failed (network, TLS, authentication).
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// A message body could not be decoded into an event.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A handler asked for another retry but the registration's budget is spent.
    #[error("exceeded max retries ({max_retries}) for {routing_key} event")]
    RetriesExhausted { routing_key: String, max_retries: u32 },

    /// A replay decision was neither retry, discard nor leave.
    #[error("invalid replay decision: {0}")]
    InvalidReplayDecision(String),

    /// The broker refused a declare, bind, publish or acknowledgement.
    #[error("broker protocol error: {0}")]
    Protocol(String),

    /// The connection was closed; a fresh instance is required.
    #[error("connection is closed")]
    Disconnected,

    /// A queue name was registered twice on the same subscriber.
    #[error("queue `{0}` is already registered")]
    DuplicateRegistration(String),

    /// The handler worker thread is gone.
    #[error("handler worker stopped: {0}")]
    Worker(String),
}

impl BrokerError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::BrokerUnavailable(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPayload(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn invalid_decision(msg: impl Into<String>) -> Self {
        Self::InvalidReplayDecision(msg.into())
    }

    pub fn retries_exhausted(routing_key: impl Into<String>, max_retries: u32) -> Self {
        Self::RetriesExhausted {
            routing_key: routing_key.into(),
            max_retries,
        }
    }
}

/// Configuration error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A broker address was neither an AMQP URL nor the disabled sentinel.
    #[error("invalid broker address `{0}` (expected amqp:// or amqps:// URL, or `disabled`)")]
    InvalidAddress(String),

    /// A setting had an unusable value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}
