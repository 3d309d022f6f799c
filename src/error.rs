// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every stage of the ingestion pipeline. Designed for:
// - Clear categorization (transient / throttling / credentials / query / circuit)
// - Propagation with `?` and `#[from]` conversions
// - Recovery hints that drive retry and stale-serving decisions
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Crate Errors
// ----------------------------------------------------------------------------

/// The main error type of the ingestion pipeline.
/// Every subsystem error converts into it.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Query failed: {0}")]
    Query(#[from] QueryFailure),

    #[error("{0}")]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("Entity discovery failed on page {page}: {source}")]
    Discovery {
        page: u32,
        #[source]
        source: QueryFailure,
    },

    #[error("Refresh deadline elapsed during {stage}")]
    DeadlineExceeded { stage: &'static str },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl IngestError {
    /// Check if a later attempt could succeed without operator action
    pub fn is_recoverable(&self) -> bool {
        match self {
            IngestError::Config(_) => false,
            IngestError::Query(failure) => failure.kind.is_recoverable(),
            IngestError::CircuitOpen(_) => true,
            IngestError::Discovery { source, .. } => source.kind.is_recoverable(),
            IngestError::DeadlineExceeded { .. } => true,
            IngestError::Storage(e) => e.is_recoverable(),
            IngestError::Internal(_) => false,
            IngestError::ShuttingDown => false,
        }
    }

    /// Error category for logging and diagnosis
    pub fn category(&self) -> &'static str {
        match self {
            IngestError::Config(_) => "config",
            IngestError::Query(failure) => failure.kind.category(),
            IngestError::CircuitOpen(_) => "circuit_open",
            IngestError::Discovery { source, .. } => match source.kind {
                FailureKind::Authentication | FailureKind::CircuitOpen => source.kind.category(),
                _ => "discovery",
            },
            IngestError::DeadlineExceeded { .. } => "deadline",
            IngestError::Storage(_) => "storage",
            IngestError::Internal(_) => "internal",
            IngestError::ShuttingDown => "shutdown",
        }
    }

    /// Suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            IngestError::Config(_) => RecoveryHint::FixConfiguration,
            IngestError::Query(failure) => failure.kind.recovery_hint(),
            IngestError::CircuitOpen(_) => RecoveryHint::ServeStale,
            IngestError::Discovery { source, .. } => match source.kind.recovery_hint() {
                RecoveryHint::Skip => RecoveryHint::ServeStale,
                hint => hint,
            },
            IngestError::DeadlineExceeded { .. } => RecoveryHint::ServeStale,
            IngestError::Storage(_) => RecoveryHint::RetryWithBackoff,
            IngestError::Internal(_) | IngestError::ShuttingDown => RecoveryHint::None,
        }
    }

    /// Failures that end the current refresh cycle instead of being contained
    /// to a single metric query.
    pub fn is_cycle_fatal(&self) -> bool {
        match self {
            IngestError::Query(failure) => failure.kind.is_cycle_fatal(),
            IngestError::Discovery { .. } | IngestError::CircuitOpen(_) => true,
            IngestError::DeadlineExceeded { .. } => true,
            IngestError::ShuttingDown => true,
            _ => false,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Keep serving the last good snapshot and try on the next cycle
    ServeStale,
    /// Credentials are wrong; retrying will not help
    FixCredentials,
    /// Fix configuration and restart
    FixConfiguration,
    /// Drop this query and continue
    Skip,
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Query Failures
// ----------------------------------------------------------------------------

/// Classification of a failed query attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// HTTP 429 or an embedded throttling error
    RateLimited,
    /// HTTP 401 / 403
    Authentication,
    /// HTTP 5xx
    ServerError,
    /// Timeout, connection refused or reset
    Transport,
    /// Transport succeeded but the query itself was rejected
    QueryRejected,
    /// 2xx body that is not the expected envelope
    Decode,
    /// Any other non-2xx status
    UnexpectedStatus,
    /// Admission refused the attempt; nothing was sent
    CircuitOpen,
}

impl FailureKind {
    /// Whether the executor should spend another attempt on this kind
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::RateLimited
                | FailureKind::ServerError
                | FailureKind::Transport
                | FailureKind::Decode
                | FailureKind::UnexpectedStatus
        )
    }

    /// Whether admission should weight this failure as throttling
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, FailureKind::RateLimited)
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FailureKind::Authentication | FailureKind::QueryRejected)
    }

    /// Kinds that abort a whole refresh cycle rather than one metric
    pub fn is_cycle_fatal(&self) -> bool {
        matches!(self, FailureKind::Authentication | FailureKind::CircuitOpen)
    }

    pub fn category(&self) -> &'static str {
        match self {
            FailureKind::RateLimited => "throttling",
            FailureKind::Authentication => "authentication",
            FailureKind::ServerError => "server",
            FailureKind::Transport => "transport",
            FailureKind::QueryRejected => "query",
            FailureKind::Decode => "decode",
            FailureKind::UnexpectedStatus => "http",
            FailureKind::CircuitOpen => "circuit_open",
        }
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            FailureKind::RateLimited
            | FailureKind::ServerError
            | FailureKind::Transport
            | FailureKind::Decode
            | FailureKind::UnexpectedStatus => RecoveryHint::RetryWithBackoff,
            FailureKind::Authentication => RecoveryHint::FixCredentials,
            FailureKind::QueryRejected => RecoveryHint::Skip,
            FailureKind::CircuitOpen => RecoveryHint::ServeStale,
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.category())
    }
}

/// Terminal failure of one query, after the retry policy gave up.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind} failure after {attempts} attempt(s): {message}")]
pub struct QueryFailure {
    pub kind: FailureKind,
    pub message: String,
    /// HTTP status of the last attempt, when there was a response
    pub status: Option<u16>,
    /// Upstream retry hint carried by the last attempt
    pub retry_after: Option<Duration>,
    /// Attempts that actually reached the transport
    pub attempts: u32,
}

impl QueryFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
            attempts: 0,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

impl From<CircuitOpenError> for QueryFailure {
    fn from(err: CircuitOpenError) -> Self {
        QueryFailure::new(FailureKind::CircuitOpen, err.to_string()).with_retry_after(Some(err.retry_in))
    }
}

// ----------------------------------------------------------------------------
// Admission Errors
// ----------------------------------------------------------------------------

/// Admission refused: the circuit is open and the cool-down has not elapsed.
/// Callers should serve stale data and try again later.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Circuit breaker open, upstream calls suspended for another {}", humantime::format_duration(*.retry_in))]
pub struct CircuitOpenError {
    /// Time left until a half-open trial request is allowed
    pub retry_in: Duration,
}

// ----------------------------------------------------------------------------
// Storage Errors
// ----------------------------------------------------------------------------

/// Errors around the durable snapshot file
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to serialize snapshot: {message}")]
    SerializationFailed { message: String },

    #[error("Snapshot file {path} is corrupt: {message}")]
    DataCorruption { path: PathBuf, message: String },

    #[error("Write to {path} failed: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Read of {path} failed: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StorageError::DataCorruption { .. })
    }
}

// ----------------------------------------------------------------------------
// Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for ingestion operations
pub type IngestResult<T> = Result<T, IngestError>;

/// Result type for snapshot storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_fatal_kinds() {
        assert!(FailureKind::Authentication.is_cycle_fatal());
        assert!(FailureKind::CircuitOpen.is_cycle_fatal());
        assert!(!FailureKind::RateLimited.is_cycle_fatal());
        assert!(!FailureKind::QueryRejected.is_cycle_fatal());

        let err = IngestError::from(QueryFailure::new(FailureKind::Authentication, "denied"));
        assert!(err.is_cycle_fatal());
        assert!(!err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::FixCredentials);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(FailureKind::RateLimited.is_retryable());
        assert!(FailureKind::ServerError.is_retryable());
        assert!(FailureKind::Transport.is_retryable());
        assert!(!FailureKind::Authentication.is_retryable());
        assert!(!FailureKind::QueryRejected.is_retryable());
        assert!(!FailureKind::CircuitOpen.is_retryable());
    }

    #[test]
    fn test_discovery_error_hints() {
        let err = IngestError::Discovery {
            page: 2,
            source: QueryFailure::new(FailureKind::QueryRejected, "bad cursor"),
        };
        assert_eq!(err.category(), "discovery");
        assert_eq!(err.recovery_hint(), RecoveryHint::ServeStale);
        assert!(err.is_cycle_fatal());
    }

    #[test]
    fn test_circuit_open_converts_to_failure() {
        let failure: QueryFailure = CircuitOpenError { retry_in: Duration::from_secs(42) }.into();
        assert_eq!(failure.kind, FailureKind::CircuitOpen);
        assert_eq!(failure.retry_after, Some(Duration::from_secs(42)));
        assert_eq!(failure.attempts, 0);
        assert!(failure.message.contains("42s"));
    }
}
