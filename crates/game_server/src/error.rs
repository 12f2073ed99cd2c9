//! Error types and handling for the game server.
//!
//! This module defines the error types that can occur during server operations,
//! providing clear categorization of different failure modes. Each layer of the
//! engine owns its own error enum so callers can decide which failures are
//! fatal for a connection and which degrade gracefully.

/// Enumeration of possible server errors.
///
/// Categorizes errors into network-related, configuration, lifecycle and
/// internal server errors to help with debugging and error handling.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Network-related errors such as binding failures or connection issues
    #[error("Network error: {0}")]
    Network(String),

    /// Invalid or inconsistent configuration values
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server errors including handler and store failures
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors produced while framing the byte stream.
///
/// Every variant except [`CodecError::Io`] is a protocol violation and is
/// fatal for the connection that produced it.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Underlying socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Declared payload length exceeds the configured maximum
    #[error("frame payload of {length} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { length: usize, max: usize },

    /// Declared payload length is negative
    #[error("negative payload length {0}")]
    NegativeLength(i32),

    /// Outer length does not agree with the inner header
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),
}

impl CodecError {
    /// Returns true when the error was caused by the peer breaking the protocol.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, CodecError::Io(_))
    }
}

/// Errors raised while sending to or closing a client connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The connection has already been closed
    #[error("connection {0} is closed")]
    Closed(u64),

    /// The outbound queue is full; the peer is not draining fast enough
    #[error("outbound queue for connection {0} is full")]
    QueueFull(u64),
}

/// Errors returned by message handlers.
///
/// The dispatch boundary converts every variant into an error response for
/// the client; none of them close the connection.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The payload could not be decoded into the expected message type
    #[error("failed to decode payload: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The request was understood but refused by business logic
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Any other handler failure
    #[error("handler failed: {0}")]
    Internal(String),
}

/// Errors from the distributed session backend.
///
/// These never reach callers of the session store; the store logs them and
/// falls back to local-only semantics.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or was forced offline
    #[error("distributed backend unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within the configured timeout
    #[error("distributed backend call timed out after {0}ms")]
    Timeout(u64),

    /// The circuit breaker short-circuited the call
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    /// Session data could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis returned an error
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stored value did not parse into a session id
    #[error("corrupt session index entry for {0}")]
    CorruptIndex(String),
}

impl StoreError {
    /// Convenience constructor used when a session id cannot be parsed.
    pub fn corrupt(id: impl std::fmt::Display) -> Self {
        StoreError::CorruptIndex(id.to_string())
    }
}

/// Result type for the distributed backend.
pub type StoreResult<T> = Result<T, StoreError>;

