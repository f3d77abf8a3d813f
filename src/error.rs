//! Error handling for the matchmaker

use std::fmt;

/// Result type alias for matchmaker operations
pub type Result<T> = std::result::Result<T, TandemError>;

/// Matchmaker error types
#[derive(Debug, Clone)]
pub enum TandemError {
    /// Network-related errors
    Network(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// Protocol errors (bad frame, unexpected state)
    Protocol(String),
    /// Connection errors
    Connection(String),
    /// Authentication errors (invalid or expired token)
    Auth(String),
    /// Malformed event or out-of-range field
    Validation(String),
    /// Operation precondition not met (not a participant, already ended, double rate)
    Precondition(String),
    /// Chat/user/search id absent
    NotFound(String),
    /// Store unreachable or write conflict
    StoreUnavailable(String),
    /// Server internal error
    Internal(String),
    /// Configuration error
    Config(String),
    /// Timeout error
    Timeout(String),
}

impl TandemError {
    /// Get error code for this error type
    pub fn code(&self) -> u32 {
        match self {
            TandemError::Network(_) => 1000,
            TandemError::Serialization(_) => 1001,
            TandemError::Protocol(_) => 1002,
            TandemError::Connection(_) => 1003,
            TandemError::Auth(_) => 1004,
            TandemError::Validation(_) => 1005,
            TandemError::Precondition(_) => 1006,
            TandemError::NotFound(_) => 1007,
            TandemError::StoreUnavailable(_) => 1008,
            TandemError::Internal(_) => 1009,
            TandemError::Config(_) => 1010,
            TandemError::Timeout(_) => 1011,
        }
    }

    /// Get human-readable error message
    pub fn message(&self) -> &str {
        match self {
            TandemError::Network(msg) => msg,
            TandemError::Serialization(msg) => msg,
            TandemError::Protocol(msg) => msg,
            TandemError::Connection(msg) => msg,
            TandemError::Auth(msg) => msg,
            TandemError::Validation(msg) => msg,
            TandemError::Precondition(msg) => msg,
            TandemError::NotFound(msg) => msg,
            TandemError::StoreUnavailable(msg) => msg,
            TandemError::Internal(msg) => msg,
            TandemError::Config(msg) => msg,
            TandemError::Timeout(msg) => msg,
        }
    }

    /// Whether the circuit breaker should count this error as a downstream failure
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TandemError::StoreUnavailable(_) | TandemError::Internal(_)
        )
    }

    /// Create a network error
    pub fn network<T: Into<String>>(msg: T) -> Self {
        TandemError::Network(msg.into())
    }

    /// Create a serialization error
    pub fn serialization<T: Into<String>>(msg: T) -> Self {
        TandemError::Serialization(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        TandemError::Protocol(msg.into())
    }

    /// Create a connection error
    pub fn connection<T: Into<String>>(msg: T) -> Self {
        TandemError::Connection(msg.into())
    }

    /// Create an authentication error
    pub fn auth<T: Into<String>>(msg: T) -> Self {
        TandemError::Auth(msg.into())
    }

    /// Create a validation error
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        TandemError::Validation(msg.into())
    }

    /// Create a precondition error
    pub fn precondition<T: Into<String>>(msg: T) -> Self {
        TandemError::Precondition(msg.into())
    }

    /// Create a not-found error
    pub fn not_found<T: Into<String>>(entity: T) -> Self {
        TandemError::NotFound(format!("{} not found", entity.into()))
    }

    /// Create a store-unavailable error
    pub fn store_unavailable<T: Into<String>>(msg: T) -> Self {
        TandemError::StoreUnavailable(msg.into())
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        TandemError::Internal(msg.into())
    }

    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        TandemError::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        TandemError::Timeout(msg.into())
    }
}

impl fmt::Display for TandemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TandemError::Network(msg) => write!(f, "Network error: {}", msg),
            TandemError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            TandemError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            TandemError::Connection(msg) => write!(f, "Connection error: {}", msg),
            TandemError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            TandemError::Validation(msg) => write!(f, "Validation error: {}", msg),
            TandemError::Precondition(msg) => write!(f, "Precondition failed: {}", msg),
            TandemError::NotFound(msg) => write!(f, "{}", msg),
            TandemError::StoreUnavailable(msg) => write!(f, "Store unavailable: {}", msg),
            TandemError::Internal(msg) => write!(f, "Internal error: {}", msg),
            TandemError::Config(msg) => write!(f, "Configuration error: {}", msg),
            TandemError::Timeout(msg) => write!(f, "Timeout: {}", msg),
        }
    }
}

impl std::error::Error for TandemError {}

impl From<std::io::Error> for TandemError {
    fn from(err: std::io::Error) -> Self {
        TandemError::Network(format!("IO error: {}", err))
    }
}

impl From<quinn::ConnectError> for TandemError {
    fn from(err: quinn::ConnectError) -> Self {
        TandemError::Connection(format!("QUIC connection error: {}", err))
    }
}

impl From<quinn::ConnectionError> for TandemError {
    fn from(err: quinn::ConnectionError) -> Self {
        TandemError::Connection(format!("QUIC connection error: {}", err))
    }
}

impl From<quinn::ReadError> for TandemError {
    fn from(err: quinn::ReadError) -> Self {
        TandemError::Network(format!("QUIC read error: {}", err))
    }
}

impl From<quinn::WriteError> for TandemError {
    fn from(err: quinn::WriteError) -> Self {
        TandemError::Network(format!("QUIC write error: {}", err))
    }
}

impl From<quinn::ClosedStream> for TandemError {
    fn from(err: quinn::ClosedStream) -> Self {
        TandemError::Connection(format!("Stream closed: {}", err))
    }
}

impl From<serde_json::Error> for TandemError {
    fn from(err: serde_json::Error) -> Self {
        TandemError::Serialization(format!("JSON error: {}", err))
    }
}

impl From<uuid::Error> for TandemError {
    fn from(err: uuid::Error) -> Self {
        TandemError::Internal(format!("UUID error: {}", err))
    }
}

impl From<anyhow::Error> for TandemError {
    fn from(err: anyhow::Error) -> Self {
        TandemError::Internal(format!("Anyhow error: {}", err))
    }
}
