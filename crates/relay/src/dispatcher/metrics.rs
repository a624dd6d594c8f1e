//! Delivery counters and outcome notifications.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use pipeline::AttemptKey;

/// Counters updated on every attempt resolution.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    delivered: AtomicU64,
    retried: AtomicU64,
    abandoned: AtomicU64,
}

impl DispatchMetrics {
    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`DispatchMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Deliveries that reached `delivered`.
    pub delivered: u64,
    /// Failed attempts that were scheduled for retry.
    pub retried: u64,
    /// Deliveries that reached `abandoned`.
    pub abandoned: u64,
}

/// Resolution of a single sink invocation, broadcast to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The sink accepted the notification.
    Delivered {
        /// Which delivery.
        key: AttemptKey,
        /// Invocations it took.
        attempts: u32,
    },
    /// The attempt failed and another one is scheduled.
    Retrying {
        /// Which delivery.
        key: AttemptKey,
        /// Invocations so far.
        attempts: u32,
        /// Delay until the next invocation.
        delay: Duration,
        /// Failure reason.
        error: String,
    },
    /// No further attempts will be made.
    Abandoned {
        /// Which delivery.
        key: AttemptKey,
        /// Invocations made.
        attempts: u32,
        /// Last failure reason.
        error: String,
    },
}

impl DeliveryOutcome {
    /// The delivery this outcome belongs to.
    pub fn key(&self) -> &AttemptKey {
        match self {
            DeliveryOutcome::Delivered { key, .. }
            | DeliveryOutcome::Retrying { key, .. }
            | DeliveryOutcome::Abandoned { key, .. } => key,
        }
    }

    /// Returns `true` for `Delivered` and `Abandoned`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryOutcome::Retrying { .. })
    }
}
