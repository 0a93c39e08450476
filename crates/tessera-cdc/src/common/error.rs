//! Error types for incremental snapshot and log-merge operations
//!
//! Errors are classified so that callers can decide between retrying a
//! single chunk, reopening the change log, or failing the whole job.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Source database errors (connection, bulk reads)
    Source,
    /// Change log errors (purged positions, lost connections)
    Log,
    /// Chunk splitting and merge errors
    Snapshot,
    /// Schema and key-type errors
    Schema,
    /// Configuration errors
    Configuration,
    /// Serialization and persistence errors
    Persistence,
    /// Other/unknown errors
    Other,
}

/// Errors raised by the snapshot/merge engine.
#[derive(Error, Debug)]
pub enum CdcError {
    /// The primary key cannot be totally ordered.
    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// The source database could not be reached.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// A chunk bulk read was interrupted.
    #[error("Chunk read error on {split_id}: {message}")]
    ChunkReadError { split_id: String, message: String },

    /// The requested log position was purged from the change log.
    #[error("Log position {0} is no longer available")]
    LogPositionNotAvailable(String),

    /// The change log connection dropped.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The merge window of a chunk could not be observed completely.
    #[error("Incomplete merge window for {split_id}: {message}")]
    IncompleteMergeWindow { split_id: String, message: String },

    /// Key arithmetic or comparison between incompatible key kinds.
    #[error("Key arithmetic error: {0}")]
    KeyArithmetic(String),

    /// Schema error (missing key column, bad row shape)
    #[error("Schema error: {0}")]
    Schema(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid state transition
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A split failed; carries the split identifier and the underlying cause.
    #[error("Split {split_id} failed: {source}")]
    Split {
        split_id: String,
        #[source]
        source: Box<CdcError>,
    },
}

impl CdcError {
    /// Create an unsupported key type error
    pub fn unsupported_key_type(msg: impl Into<String>) -> Self {
        Self::UnsupportedKeyType(msg.into())
    }

    /// Create a source unavailable error
    pub fn source_unavailable(msg: impl Into<String>) -> Self {
        Self::SourceUnavailable(msg.into())
    }

    /// Create a chunk read error
    pub fn chunk_read(split_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ChunkReadError {
            split_id: split_id.into(),
            message: msg.into(),
        }
    }

    /// Create a log position not available error
    pub fn log_position_not_available(position: impl ToString) -> Self {
        Self::LogPositionNotAvailable(position.to_string())
    }

    /// Create a connection lost error
    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::ConnectionLost(msg.into())
    }

    /// Create an incomplete merge window error
    pub fn incomplete_merge_window(split_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::IncompleteMergeWindow {
            split_id: split_id.into(),
            message: msg.into(),
        }
    }

    /// Create a key arithmetic error
    pub fn key_arithmetic(msg: impl Into<String>) -> Self {
        Self::KeyArithmetic(msg.into())
    }

    /// Create a schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Wrap an error with the identifier of the split it belongs to.
    pub fn for_split(self, split_id: impl Into<String>) -> Self {
        match self {
            Self::Split { .. } => self,
            other => Self::Split {
                split_id: split_id.into(),
                source: Box::new(other),
            },
        }
    }

    /// Unwrap a [`CdcError::Split`] to its underlying cause.
    pub fn root_cause(&self) -> &CdcError {
        match self {
            Self::Split { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Check if this error is transient.
    ///
    /// Transient errors are retried with backoff by the operation that
    /// raised them (reopening the log, re-querying the source).
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::SourceUnavailable(_)
            | Self::ConnectionLost(_)
            | Self::ChunkReadError { .. }
            | Self::Timeout(_) => true,

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            Self::Split { source, .. } => source.is_retriable(),

            Self::UnsupportedKeyType(_)
            | Self::LogPositionNotAvailable(_)
            | Self::IncompleteMergeWindow { .. }
            | Self::KeyArithmetic(_)
            | Self::Schema(_)
            | Self::Config(_)
            | Self::InvalidState(_)
            | Self::Json(_) => false,
        }
    }

    /// Check if a chunk that failed with this error may be restarted.
    ///
    /// A restart discards the in-flight snapshot and recaptures a fresh low
    /// watermark, which also recovers from an incomplete merge window.
    pub fn is_chunk_retriable(&self) -> bool {
        match self.root_cause() {
            Self::IncompleteMergeWindow { .. } => true,
            other => other.is_retriable(),
        }
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::SourceUnavailable(_) | Self::ChunkReadError { .. } => ErrorCategory::Source,
            Self::LogPositionNotAvailable(_) | Self::ConnectionLost(_) => ErrorCategory::Log,
            Self::IncompleteMergeWindow { .. } | Self::KeyArithmetic(_) => ErrorCategory::Snapshot,
            Self::UnsupportedKeyType(_) | Self::Schema(_) => ErrorCategory::Schema,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Json(_) | Self::Io(_) => ErrorCategory::Persistence,
            Self::Timeout(_) => ErrorCategory::Source,
            Self::InvalidState(_) => ErrorCategory::Other,
            Self::Split { source, .. } => source.category(),
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnsupportedKeyType(_) => "unsupported_key_type",
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::ChunkReadError { .. } => "chunk_read_error",
            Self::LogPositionNotAvailable(_) => "log_position_not_available",
            Self::ConnectionLost(_) => "connection_lost",
            Self::IncompleteMergeWindow { .. } => "incomplete_merge_window",
            Self::KeyArithmetic(_) => "key_arithmetic",
            Self::Schema(_) => "schema_error",
            Self::Config(_) => "config_error",
            Self::InvalidState(_) => "invalid_state",
            Self::Timeout(_) => "timeout",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            Self::Split { source, .. } => source.error_code(),
        }
    }
}

/// Result type for CDC operations
pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CdcError::chunk_read("orders:3", "socket closed");
        assert!(err.to_string().contains("orders:3"));
        assert!(err.to_string().contains("socket closed"));

        let err = CdcError::log_position_not_available("0/1A");
        assert_eq!(err.to_string(), "Log position 0/1A is no longer available");
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(CdcError::source_unavailable("db down").is_retriable());
        assert!(CdcError::connection_lost("reset").is_retriable());
        assert!(CdcError::chunk_read("s", "x").is_retriable());

        assert!(!CdcError::unsupported_key_type("json").is_retriable());
        assert!(!CdcError::log_position_not_available("0/1").is_retriable());
        assert!(!CdcError::incomplete_merge_window("s", "gap").is_retriable());
        assert!(!CdcError::config("bad").is_retriable());
    }

    #[test]
    fn test_chunk_retriable() {
        assert!(CdcError::incomplete_merge_window("s", "gap").is_chunk_retriable());
        assert!(CdcError::chunk_read("s", "x").is_chunk_retriable());
        assert!(!CdcError::log_position_not_available("0/1").is_chunk_retriable());
        assert!(!CdcError::unsupported_key_type("json").is_chunk_retriable());
    }

    #[test]
    fn test_split_wrapper() {
        let err = CdcError::connection_lost("reset").for_split("orders:1");
        assert!(err.to_string().contains("orders:1"));
        assert!(err.is_retriable());
        assert_eq!(err.error_code(), "connection_lost");
        assert_eq!(err.category(), ErrorCategory::Log);

        // Wrapping twice keeps the innermost split id
        let err = err.for_split("orders:2");
        match err {
            CdcError::Split { split_id, .. } => assert_eq!(split_id, "orders:1"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            CdcError::source_unavailable("x").category(),
            ErrorCategory::Source
        );
        assert_eq!(
            CdcError::log_position_not_available("x").category(),
            ErrorCategory::Log
        );
        assert_eq!(
            CdcError::incomplete_merge_window("s", "x").category(),
            ErrorCategory::Snapshot
        );
        assert_eq!(
            CdcError::unsupported_key_type("x").category(),
            ErrorCategory::Schema
        );
        assert_eq!(
            CdcError::config("x").category(),
            ErrorCategory::Configuration
        );
    }

    #[test]
    fn test_error_code() {
        assert_eq!(
            CdcError::unsupported_key_type("x").error_code(),
            "unsupported_key_type"
        );
        assert_eq!(CdcError::timeout("x").error_code(), "timeout");
        assert_eq!(CdcError::config("x").error_code(), "config_error");
    }
}
