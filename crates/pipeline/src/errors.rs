//! Top-level error and retry-policy types for the Pipeline Notify domain.
//!
//! [`RelayError`] covers conditions surfaced to the ingestion caller or the
//! query interface. [`SinkError`] is what a delivery sink reports; it never
//! reaches the ingestion caller because delivery happens after ingestion has
//! already succeeded.
//!
//! [`RetryPolicy`] is a cross-cutting concern: any error type that participates
//! in retry decisions must be able to produce a [`RetryPolicy`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// - `Retryable` errors: backend timeouts, transient sink failures, rate limits.
/// - `NonRetryable` errors: malformed input, rejected requests, invalid
///   configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    ///
    /// `after` optionally specifies the minimum delay before retrying (e.g.
    /// derived from a `Retry-After` response header).
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried.
    NonRetryable,
}

impl RetryPolicy {
    /// Returns `true` for [`RetryPolicy::Retryable`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetryPolicy::Retryable { .. })
    }
}

// ---------------------------------------------------------------------------
// Relay errors
// ---------------------------------------------------------------------------

/// The backing store an operation failed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// The idempotency store.
    Dedup,
    /// The per-pipeline status cache.
    Status,
    /// The subscription registry.
    Subscriptions,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StoreKind::Dedup => "dedup store",
            StoreKind::Status => "status cache",
            StoreKind::Subscriptions => "subscription registry",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the relay core.
///
/// A duplicate event is deliberately absent: it is an explicit idempotent-drop
/// signal carried in the ingestion outcome, not a failure.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum RelayError {
    /// The inbound payload lacks a required field, carries an unrecognized
    /// stage, or is not valid JSON. Terminal; never retried.
    #[error("Malformed event: {reason}")]
    MalformedEvent {
        /// Which field or value was wrong.
        reason: String,
    },

    /// A backing store could not be reached. Ingestion fails closed so that
    /// the upstream system redelivers.
    #[error("{store} unavailable: {message}")]
    StoreUnavailable {
        /// The store that failed.
        store: StoreKind,
        /// Backend-specific description.
        message: String,
    },

    /// The runtime configuration is invalid.
    ///
    /// Produced at load time; the relay never starts with an invalid config.
    #[error("Configuration error: {message}")]
    ConfigurationError {
        /// Description of the configuration problem.
        message: String,
    },
}

impl RelayError {
    /// Shorthand for [`RelayError::MalformedEvent`].
    pub fn malformed(reason: impl Into<String>) -> Self {
        RelayError::MalformedEvent {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`RelayError::StoreUnavailable`].
    pub fn store_unavailable(store: StoreKind, message: impl Into<String>) -> Self {
        RelayError::StoreUnavailable {
            store,
            message: message.into(),
        }
    }

    /// Shorthand for [`RelayError::ConfigurationError`].
    pub fn configuration(message: impl Into<String>) -> Self {
        RelayError::ConfigurationError {
            message: message.into(),
        }
    }

    /// Tells the caller whether redelivering the same request may succeed.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            RelayError::StoreUnavailable { .. } => RetryPolicy::Retryable { after: None },
            RelayError::MalformedEvent { .. } | RelayError::ConfigurationError { .. } => {
                RetryPolicy::NonRetryable
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sink errors
// ---------------------------------------------------------------------------

/// Failure reported by a delivery sink.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{reason}")]
pub struct SinkError {
    /// Human-readable failure reason, recorded as `last_error`.
    pub reason: String,
    /// Whether the dispatcher may try again.
    pub retry: RetryPolicy,
}

impl SinkError {
    /// A failure that may succeed on a later attempt.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retry: RetryPolicy::Retryable { after: None },
        }
    }

    /// A transient failure with a minimum delay before the next attempt.
    pub fn retry_after(reason: impl Into<String>, after: Duration) -> Self {
        Self {
            reason: reason.into(),
            retry: RetryPolicy::Retryable { after: Some(after) },
        }
    }

    /// A failure that will not succeed on retry.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retry: RetryPolicy::NonRetryable,
        }
    }
}
