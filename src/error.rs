//! Error types for kaflink
//!
//! This module defines the main error type used throughout the crate plus
//! structured domain errors for the wire protocol and the response size
//! prefix, where the extra context matters for diagnosing misconfigured
//! endpoints.

use thiserror::Error;

/// Result type alias for kaflink operations
pub type Result<T> = std::result::Result<T, KaflinkError>;

/// Structured protocol error domain
#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    #[error("{operation}: {detail}")]
    Operation { operation: String, detail: String },
    #[error("expected {expected}, got {got}")]
    Unexpected { expected: String, got: String },
    #[error("short response: {0} bytes")]
    ShortResponse(usize),
    #[error("{0}")]
    Message(String),
}

impl ProtocolError {
    pub fn operation(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    pub fn unexpected(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::Unexpected {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

impl From<String> for ProtocolError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<&str> for ProtocolError {
    fn from(value: &str) -> Self {
        Self::Message(value.to_string())
    }
}

/// Structured response-size error domain.
///
/// A response length prefix that exceeds the configured ceiling usually
/// means the client is talking to something that is not a plaintext Kafka
/// listener, so the variants carry hints for the two common mistakes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadSizeError {
    #[error("invalid negative response size {0}")]
    Negative(i32),
    #[error(
        "invalid large response size {size} > limit {limit}; the four size bytes are 'HTTP' in \
         ascii, the beginning of an HTTP response; is your broker port correct?"
    )]
    LooksLikeHttp { size: i32, limit: i32 },
    #[error(
        "invalid large response size {size} > limit {limit}; the first three bytes received \
         appear to be a tls alert record for {version}; is this a plaintext connection speaking \
         to a tls endpoint?"
    )]
    LooksLikeTls { size: i32, limit: i32, version: &'static str },
    #[error("invalid large response size {size} > limit {limit}")]
    TooLarge { size: i32, limit: i32 },
}

/// Main error type for kaflink
#[derive(Error, Debug)]
pub enum KaflinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid response size: {0}")]
    InvalidResponseSize(#[from] ReadSizeError),

    /// Request api key is out of range or excluded by the configured
    /// version pins.
    #[error("request key {0} is unknown")]
    UnknownRequestKey(i16),

    /// The broker's maximum version for this key is below what the client
    /// requires.
    #[error("broker is too old for request key {key}")]
    BrokerTooOld { key: i16 },

    /// The broker or one of its queues was terminated before the request
    /// could complete.
    #[error("the chosen broker is dead")]
    ChosenBrokerDead,

    /// A wire reply arrived out of order; fatal for the connection it
    /// arrived on.
    #[error("correlation ID mismatch: wrote {expected}, read {got}")]
    CorrelationIdMismatch { expected: i32, got: i32 },

    /// The client's lifetime ended while this request was in flight.
    #[error("client closed")]
    ClientClosed,

    /// The caller's per-request context was cancelled.
    #[error("request context cancelled")]
    Cancelled,

    /// A read or write missed its deadline.
    #[error("timed out while {0}")]
    Timeout(&'static str),

    /// More than 15 SASL reauthentications were required to dispatch a
    /// single request.
    #[error(
        "the broker has repeatedly given us short sasl lifetimes; killing the connection to \
         retry on a new connection"
    )]
    SaslReauthLoop,

    #[error("SASL authentication failed: {0}")]
    Sasl(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KaflinkError {
    /// Create a protocol error from a message string
    pub fn protocol_msg(msg: impl Into<String>) -> Self {
        KaflinkError::Protocol(ProtocolError::Message(msg.into()))
    }

    /// Create a protocol error with operation context
    pub fn protocol(operation: &str, detail: impl Into<String>) -> Self {
        KaflinkError::Protocol(ProtocolError::operation(operation, detail))
    }

    /// Create a SASL error
    pub fn sasl(detail: impl Into<String>) -> Self {
        KaflinkError::Sasl(detail.into())
    }

    /// True when the client's own lifetime ended.
    pub fn is_client_closed(&self) -> bool {
        matches!(self, KaflinkError::ClientClosed)
    }

    /// True for errors that killed (or must kill) the connection they
    /// occurred on. The caller may retry on a freshly dialed connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            KaflinkError::Io(_)
                | KaflinkError::Timeout(_)
                | KaflinkError::CorrelationIdMismatch { .. }
                | KaflinkError::InvalidResponseSize(_)
                | KaflinkError::ChosenBrokerDead
        )
    }

    /// True when the caller cancelled the request rather than the request
    /// failing on its own.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, KaflinkError::Cancelled | KaflinkError::ClientClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_hint_message() {
        let err = ReadSizeError::LooksLikeHttp {
            size: 0x48545450,
            limit: 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("HTTP"));
        assert!(msg.contains("is your broker port correct?"));
    }

    #[test]
    fn tls_hint_message() {
        let err = ReadSizeError::LooksLikeTls {
            size: 0x1503_0300,
            limit: 1024,
            version: "TLS v1.2",
        };
        let msg = err.to_string();
        assert!(msg.contains("tls alert record"));
        assert!(msg.contains("TLS v1.2"));
    }

    #[test]
    fn connection_error_classification() {
        assert!(KaflinkError::ChosenBrokerDead.is_connection_error());
        assert!(KaflinkError::CorrelationIdMismatch { expected: 0, got: 1 }.is_connection_error());
        assert!(!KaflinkError::Cancelled.is_connection_error());
        assert!(KaflinkError::Cancelled.is_cancellation());
        assert!(KaflinkError::ClientClosed.is_cancellation());
    }
}
