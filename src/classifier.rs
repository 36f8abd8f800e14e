// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error classification.
//!
//! [`classify`] turns any error into a [`ClassifiedError`]: a category, a
//! severity and a retry decision. Every failure that reaches the retry
//! executor, the sync queue or the dead-letter store goes through here, so
//! the retry policy lives in exactly one place.
//!
//! # Classification Order
//!
//! Checks run in a fixed priority order and the first match wins:
//!
//! ```text
//! network → authentication → API status → database → timeout → rate limit → validation → unknown
//! ```
//!
//! Typed [`FixtureSyncError`] variants map directly onto a category. Foreign
//! errors (and `Upstream` messages) are matched on their lowercased message
//! chain plus the status code carried in the [`OperationContext`].
//!
//! # Retry Defaults
//!
//! | Category | Retryable | Severity |
//! |----------|-----------|----------|
//! | `NETWORK` | Yes | Medium |
//! | `AUTHENTICATION` | No | High |
//! | `API_RESPONSE` | 5xx only | High (5xx) / Medium (4xx) |
//! | `DATABASE` | Deadlock, busy, pool exhaustion | High |
//! | `TIMEOUT` | Yes | Medium |
//! | `RATE_LIMIT` | Yes | Low |
//! | `DATA_VALIDATION` | No | Medium |
//! | `UNKNOWN` | No | High |

use crate::error::FixtureSyncError;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;

/// Broad failure family used for retry policy and dead-letter cooldowns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Network,
    Authentication,
    ApiResponse,
    Database,
    Timeout,
    RateLimit,
    DataValidation,
    Unknown,
}

impl ErrorCategory {
    /// Stable lowercase label for metrics and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Authentication => "authentication",
            Self::ApiResponse => "api_response",
            Self::Database => "database",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::DataValidation => "data_validation",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Network => "NETWORK",
            Self::Authentication => "AUTHENTICATION",
            Self::ApiResponse => "API_RESPONSE",
            Self::Database => "DATABASE",
            Self::Timeout => "TIMEOUT",
            Self::RateLimit => "RATE_LIMIT",
            Self::DataValidation => "DATA_VALIDATION",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

/// How loudly a failure should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// What the caller was doing when the error happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext {
    pub operation: String,
    pub resource: Option<String>,
    /// HTTP status observed by the caller, if any.
    pub status_code: Option<u16>,
    /// 1-indexed attempt number.
    pub attempt: u32,
}

impl OperationContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            resource: None,
            status_code: None,
            attempt: 1,
        }
    }

    #[must_use]
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// Result of classifying a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    /// Specific failure type, e.g. `connection_refused` or `http_503`.
    pub error_type: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub retryable: bool,
    pub message: String,
    pub operation: String,
    pub status_code: Option<u16>,
}

impl ClassifiedError {
    fn new(
        error_type: impl Into<String>,
        category: ErrorCategory,
        severity: Severity,
        retryable: bool,
        message: &str,
        context: &OperationContext,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            category,
            severity,
            retryable,
            message: message.to_string(),
            operation: context.operation.clone(),
            status_code: context.status_code,
        }
    }
}

// Pattern tables, checked against the lowercased message chain.

const NETWORK_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection closed",
    "connection aborted",
    "econnrefused",
    "econnreset",
    "enotfound",
    "network",
    "dns",
    "unreachable",
    "failed to fetch",
    "fetch failed",
    "socket hang up",
    "broken pipe",
    "offline",
];

const AUTH_PATTERNS: &[&str] = &[
    "unauthorized",
    "unauthenticated",
    "forbidden",
    "jwt",
    "token expired",
    "invalid token",
    "invalid credentials",
    "permission denied",
    "not authorized",
    "authentication",
];

const DATABASE_PATTERNS: &[&str] = &[
    "deadlock",
    "database",
    "sqlite",
    "postgres",
    "pgrst",
    "duplicate key",
    "foreign key",
    "constraint",
    "relation",
    "sql",
];

const TRANSIENT_DATABASE_PATTERNS: &[&str] = &[
    "deadlock",
    "database is locked",
    "database is busy",
    "busy",
    "locked",
    "connection pool",
    "pool timed out",
    "too many connections",
    "could not serialize",
    "serialization failure",
];

const TIMEOUT_PATTERNS: &[&str] = &["timed out", "timeout", "deadline exceeded", "etimedout"];

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "ratelimit",
    "too many requests",
    "throttl",
    "quota exceeded",
];

const VALIDATION_PATTERNS: &[&str] = &[
    "validation",
    "invalid",
    "malformed",
    "missing field",
    "missing required",
    "unknown field",
    "schema",
    "deserialize",
    "parse",
    "unexpected token",
];

const STATUS_PREFIXES: &[&str] = &["status code ", "status: ", "status ", "http "];

fn first_match(haystack: &str, patterns: &'static [&'static str]) -> Option<&'static str> {
    patterns.iter().copied().find(|p| haystack.contains(p))
}

fn type_name(pattern: &str) -> String {
    pattern.trim().replace([' ', ':'], "_")
}

/// True when a database failure message describes a transient condition
/// (lock contention, deadlock, pool exhaustion) rather than a bad query.
pub fn is_transient_database_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_DATABASE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Pull an HTTP status out of messages like "request failed with status code 503".
fn extract_status(message: &str) -> Option<u16> {
    for prefix in STATUS_PREFIXES {
        let mut rest = message;
        while let Some(idx) = rest.find(prefix) {
            let after = &rest[idx + prefix.len()..];
            let digits: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.len() == 3 {
                if let Ok(status) = digits.parse::<u16>() {
                    if (100..=599).contains(&status) {
                        return Some(status);
                    }
                }
            }
            rest = after;
        }
    }
    None
}

fn from_status(status: u16, message: &str, context: &OperationContext) -> ClassifiedError {
    let ctx = OperationContext {
        status_code: Some(status),
        ..context.clone()
    };
    let error_type = format!("http_{status}");
    match status {
        401 | 403 => ClassifiedError::new(
            error_type,
            ErrorCategory::Authentication,
            Severity::High,
            false,
            message,
            &ctx,
        ),
        408 => ClassifiedError::new(error_type, ErrorCategory::Timeout, Severity::Medium, true, message, &ctx),
        429 => ClassifiedError::new(error_type, ErrorCategory::RateLimit, Severity::Low, true, message, &ctx),
        500..=599 => ClassifiedError::new(error_type, ErrorCategory::ApiResponse, Severity::High, true, message, &ctx),
        400..=499 => ClassifiedError::new(error_type, ErrorCategory::ApiResponse, Severity::Medium, false, message, &ctx),
        _ => ClassifiedError::new(error_type, ErrorCategory::ApiResponse, Severity::Low, false, message, &ctx),
    }
}

fn database(error_type: &str, retryable: bool, message: &str, context: &OperationContext) -> ClassifiedError {
    ClassifiedError::new(
        format!("db_{}", type_name(error_type)),
        ErrorCategory::Database,
        Severity::High,
        retryable,
        message,
        context,
    )
}

fn unknown(message: &str, context: &OperationContext) -> ClassifiedError {
    ClassifiedError::new("unknown", ErrorCategory::Unknown, Severity::High, false, message, context)
}

/// Classify a message (plus optional status) by pattern, in priority order.
pub fn classify_message(message: &str, context: &OperationContext) -> ClassifiedError {
    let lower = message.to_lowercase();

    if let Some(p) = first_match(&lower, NETWORK_PATTERNS) {
        return ClassifiedError::new(type_name(p), ErrorCategory::Network, Severity::Medium, true, message, context);
    }

    let status = context.status_code.or_else(|| extract_status(&lower));
    if let Some(s @ (401 | 403)) = status {
        return from_status(s, message, context);
    }
    if let Some(p) = first_match(&lower, AUTH_PATTERNS) {
        return ClassifiedError::new(
            type_name(p),
            ErrorCategory::Authentication,
            Severity::High,
            false,
            message,
            context,
        );
    }

    if let Some(status) = status {
        return from_status(status, message, context);
    }

    if let Some(p) = first_match(&lower, DATABASE_PATTERNS) {
        let transient = TRANSIENT_DATABASE_PATTERNS.iter().find(|t| lower.contains(**t));
        return match transient {
            Some(t) => database(t, true, message, context),
            None => database(p, false, message, context),
        };
    }

    if let Some(p) = first_match(&lower, TIMEOUT_PATTERNS) {
        return ClassifiedError::new(type_name(p), ErrorCategory::Timeout, Severity::Medium, true, message, context);
    }

    if let Some(p) = first_match(&lower, RATE_LIMIT_PATTERNS) {
        return ClassifiedError::new(type_name(p), ErrorCategory::RateLimit, Severity::Low, true, message, context);
    }

    if let Some(p) = first_match(&lower, VALIDATION_PATTERNS) {
        return ClassifiedError::new(
            type_name(p),
            ErrorCategory::DataValidation,
            Severity::Medium,
            false,
            message,
            context,
        );
    }

    unknown(message, context)
}

fn classify_typed(err: &FixtureSyncError, context: &OperationContext) -> ClassifiedError {
    let message = err.to_string();
    let msg = message.as_str();
    match err {
        FixtureSyncError::Network { .. } => {
            // Keep the specific transport cause when the message names one.
            let lower = msg.to_lowercase();
            let kind = first_match(&lower, NETWORK_PATTERNS).map(type_name).unwrap_or_else(|| "network".into());
            ClassifiedError::new(kind, ErrorCategory::Network, Severity::Medium, true, msg, context)
        }
        FixtureSyncError::Offline(_) => {
            ClassifiedError::new("offline", ErrorCategory::Network, Severity::Low, true, msg, context)
        }
        FixtureSyncError::CircuitOpen { .. } => {
            ClassifiedError::new("circuit_open", ErrorCategory::Network, Severity::Medium, true, msg, context)
        }
        FixtureSyncError::Authentication(_) => ClassifiedError::new(
            "authentication",
            ErrorCategory::Authentication,
            Severity::High,
            false,
            msg,
            context,
        ),
        FixtureSyncError::Api { status, .. } => from_status(*status, msg, context),
        FixtureSyncError::Database(inner) => {
            let lower = inner.to_lowercase();
            match TRANSIENT_DATABASE_PATTERNS.iter().find(|t| lower.contains(**t)) {
                Some(t) => database(t, true, msg, context),
                None => database("error", false, msg, context),
            }
        }
        FixtureSyncError::Storage(e) => {
            let busy = crate::storage::is_sqlite_busy_error(e);
            database(if busy { "busy" } else { "local_storage" }, busy, msg, context)
        }
        FixtureSyncError::Timeout { .. } => {
            ClassifiedError::new("timeout", ErrorCategory::Timeout, Severity::Medium, true, msg, context)
        }
        FixtureSyncError::RateLimited(_) => {
            ClassifiedError::new("rate_limited", ErrorCategory::RateLimit, Severity::Low, true, msg, context)
        }
        FixtureSyncError::Validation(_) => ClassifiedError::new(
            "validation",
            ErrorCategory::DataValidation,
            Severity::Medium,
            false,
            msg,
            context,
        ),
        FixtureSyncError::Serialization(_) => ClassifiedError::new(
            "serialization",
            ErrorCategory::DataValidation,
            Severity::Medium,
            false,
            msg,
            context,
        ),
        FixtureSyncError::RetriesExhausted { category, .. } => {
            ClassifiedError::new("retries_exhausted", *category, Severity::High, false, msg, context)
        }
        FixtureSyncError::NonRetryable { category, .. } => {
            ClassifiedError::new("non_retryable", *category, Severity::High, false, msg, context)
        }
        FixtureSyncError::CacheMiss { message, .. } => classify_message(message, context),
        FixtureSyncError::Upstream(message) => classify_message(message, context),
        FixtureSyncError::Config(_)
        | FixtureSyncError::InvalidState { .. }
        | FixtureSyncError::Shutdown
        | FixtureSyncError::Internal(_) => unknown(msg, context),
    }
}

/// Classify an error in the context of the operation that produced it.
///
/// Walks the `source()` chain looking for a [`FixtureSyncError`]; if none is
/// found the whole chain's messages are pattern-matched. Anything that matches
/// no rule is `UNKNOWN`, `High` severity and not retryable.
pub fn classify(error: &(dyn StdError + 'static), context: &OperationContext) -> ClassifiedError {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    let mut chain = Vec::new();
    while let Some(err) = current {
        if let Some(typed) = err.downcast_ref::<FixtureSyncError>() {
            let mut classified = classify_typed(typed, context);
            // Report the outermost message, not the inner typed one.
            classified.message = error.to_string();
            return classified;
        }
        chain.push(err.to_string());
        current = err.source();
    }

    let mut classified = classify_message(&chain.join(": "), context);
    classified.message = error.to_string();
    classified
}

/// Convenience for crate-typed errors.
pub fn classify_error(error: &FixtureSyncError, context: &OperationContext) -> ClassifiedError {
    classify_typed(error, context)
}
