// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for fixture-sync.
//!
//! Errors are grouped by where the failure came from (network, origin API,
//! local storage, caller input) so that [`crate::classifier::classify`] can
//! map them onto an [`ErrorCategory`](crate::classifier::ErrorCategory)
//! without guessing.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Network` | Yes | Connection refused/reset, DNS failure |
//! | `Offline` | Yes | Device has no connectivity |
//! | `Timeout` | Yes | A bounded network call ran out of time |
//! | `RateLimited` | Yes | Origin or local limiter refused the call |
//! | `CircuitOpen` | Yes | Breaker is failing fast for the resource |
//! | `Api` | 5xx only | Origin answered with an error status |
//! | `Database` | Transient only | Remote mirror query failed |
//! | `Storage` | Busy/locked only | Local SQLite failure |
//! | `Authentication` | No | Credentials rejected or expired |
//! | `Validation` | No | Malformed payload or caller input |
//! | `Serialization` | No | JSON encode/decode failure |
//! | `RetriesExhausted` | No | Terminal outcome of a retried operation |
//! | `NonRetryable` | No | Terminal outcome of a non-retryable failure |
//! | `CacheMiss` | No | No tier held data and the origin failed |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Lifecycle violation |
//! | `Shutdown` | No | Service is shutting down |
//! | `Upstream` | Unknown | Foreign failure, classified by message |
//! | `Internal` | No | Unexpected internal error |

use crate::classifier::ErrorCategory;
use thiserror::Error;

/// Result type alias for fixture-sync operations.
pub type Result<T> = std::result::Result<T, FixtureSyncError>;

/// Errors that can occur in the cache, queue, breaker and subscription layers.
#[derive(Error, Debug)]
pub enum FixtureSyncError {
    /// Transport-level failure talking to a remote service.
    #[error("Network error ({operation}): {message}")]
    Network { operation: String, message: String },

    /// The device is offline; network tiers were skipped.
    #[error("Offline: {0}")]
    Offline(String),

    /// Credentials were rejected or have expired.
    ///
    /// Never retried automatically: the user must sign in again.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Origin API responded with an error status.
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Remote database mirror failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Local SQLite failure (local tier, offline snapshots, dead letters).
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A bounded call did not finish in time.
    #[error("Timeout ({operation}) after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    /// Rate limited by the origin or by the local token bucket.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Payload or input failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// JSON encode/decode failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Circuit breaker refused the call.
    #[error("Circuit '{circuit}' open: {reason}")]
    CircuitOpen { circuit: String, reason: String },

    /// A retried operation ran out of attempts and was dead-lettered.
    #[error("Retries exhausted for {operation} after {attempts} attempts ({category}): {message}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        category: ErrorCategory,
        message: String,
    },

    /// A non-retryable failure was dead-lettered on first occurrence.
    #[error("Non-retryable failure for {operation} ({category}): {message}")]
    NonRetryable {
        operation: String,
        category: ErrorCategory,
        message: String,
    },

    /// No tier held data for the key and the origin could not be reached.
    #[error("No cached data for '{key}' and origin failed: {message}")]
    CacheMiss { key: String, message: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle violation (e.g. `start()` twice).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Failure reported by an external collaborator without a typed cause.
    ///
    /// The classifier inspects the message to decide the category.
    #[error("{0}")]
    Upstream(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FixtureSyncError {
    /// Create a network error.
    pub fn network(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an API status error.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create a timeout error from the elapsed bound.
    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }

    /// Create an untyped upstream error.
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    /// Check if this error is retryable.
    ///
    /// `Upstream` errors are not retryable by this check; run them through
    /// the classifier, which looks at the message.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Offline(_) => true,
            Self::Timeout { .. } => true,
            Self::RateLimited(_) => true,
            Self::CircuitOpen { .. } => true,
            Self::Api { status, .. } => (500..=599).contains(status),
            Self::Database(msg) => crate::classifier::is_transient_database_message(msg),
            Self::Storage(e) => crate::storage::is_sqlite_busy_error(e),
            Self::Authentication(_) => false,
            Self::Validation(_) => false,
            Self::Serialization(_) => false,
            Self::RetriesExhausted { .. } => false,
            Self::NonRetryable { .. } => false,
            Self::CacheMiss { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Upstream(_) => false,
            Self::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_network_is_retryable() {
        let err = FixtureSyncError::network("fetch_fixture", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("fetch_fixture"));
    }

    #[test]
    fn test_api_retryable_only_for_5xx() {
        assert!(FixtureSyncError::api(503, "unavailable").is_retryable());
        assert!(!FixtureSyncError::api(404, "not found").is_retryable());
        assert!(!FixtureSyncError::api(422, "bad body").is_retryable());
    }

    #[test]
    fn test_database_transient_subset() {
        assert!(FixtureSyncError::Database("deadlock detected".into()).is_retryable());
        assert!(!FixtureSyncError::Database("relation \"matches\" does not exist".into()).is_retryable());
    }

    #[test]
    fn test_not_retryable_auth_and_validation() {
        assert!(!FixtureSyncError::Authentication("jwt expired".into()).is_retryable());
        assert!(!FixtureSyncError::Validation("missing field".into()).is_retryable());
    }

    #[test]
    fn test_timeout_formatting() {
        let err = FixtureSyncError::timeout("origin_api", Duration::from_millis(1500));
        let msg = err.to_string();
        assert!(msg.contains("origin_api"));
        assert!(msg.contains("1500ms"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_terminal_errors_not_retryable() {
        let err = FixtureSyncError::RetriesExhausted {
            operation: "refresh:{}".into(),
            attempts: 3,
            category: ErrorCategory::Network,
            message: "connection refused".into(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("3 attempts"));
        assert!(!FixtureSyncError::Shutdown.is_retryable());
    }

    #[test]
    fn test_invalid_state_formatting() {
        let err = FixtureSyncError::InvalidState {
            expected: "Created".into(),
            actual: "Running".into(),
        };
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Running"));
    }
}
