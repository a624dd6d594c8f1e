//! Port traits implemented by infrastructure and store crates.
//!
//! The relay core depends only on these traits. In-memory implementations live
//! in the `relay` crate; network sinks live in the `sinks` crate.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    EventKey, PipelineEvent, PipelineId, PipelineStatusSnapshot, RelayError, SinkError, SinkRef,
    Subscription, Timestamp,
};

// ---------------------------------------------------------------------------
// Delivery sinks
// ---------------------------------------------------------------------------

/// A pluggable delivery target (chat channel, email relay, webhook).
///
/// Implementations must tolerate being called more than once for the same
/// event and subscription: the dispatcher retries after timeouts, and a timed
/// out call may still have reached the target.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short transport name used in logs (e.g. `"webhook"`).
    fn kind(&self) -> &'static str;

    /// Delivers one notification.
    async fn deliver(
        &self,
        event: &PipelineEvent,
        subscription: &Subscription,
    ) -> Result<(), SinkError>;
}

/// Sinks resolved from configuration, keyed by [`SinkRef`].
///
/// Built once at startup; the dispatcher never constructs sinks at call time.
#[derive(Clone, Default)]
pub struct SinkRegistry {
    sinks: HashMap<SinkRef, Arc<dyn Sink>>,
}

impl SinkRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `sink` under `name`, replacing any previous entry.
    pub fn insert(&mut self, name: SinkRef, sink: Arc<dyn Sink>) {
        self.sinks.insert(name, sink);
    }

    /// Builder-style [`SinkRegistry::insert`].
    #[must_use]
    pub fn with(mut self, name: SinkRef, sink: Arc<dyn Sink>) -> Self {
        self.insert(name, sink);
        self
    }

    /// Looks up a sink.
    pub fn get(&self, name: &SinkRef) -> Option<Arc<dyn Sink>> {
        self.sinks.get(name).cloned()
    }

    /// Returns `true` if `name` is registered.
    pub fn contains(&self, name: &SinkRef) -> bool {
        self.sinks.contains_key(name)
    }

    /// Number of registered sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Returns `true` if no sink is registered.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl std::fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.sinks.keys().map(SinkRef::as_str).collect();
        names.sort_unstable();
        f.debug_struct("SinkRegistry").field("sinks", &names).finish()
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// Result of an idempotency admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting of the key within the retention window.
    Accepted,
    /// The key was admitted earlier and has not expired.
    Duplicate,
}

/// Short-lived keyed store guarding against duplicate processing.
///
/// `admit` is the sole source of truth for exactly-once processing: concurrent
/// admissions of the same key must yield exactly one [`Admission::Accepted`].
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically checks and records `key`.
    async fn admit(&self, key: &EventKey) -> Result<Admission, RelayError>;

    /// Forgets `key` so that a redelivery is accepted again.
    ///
    /// Used to roll back an admission when later ingestion steps fail.
    async fn release(&self, key: &EventKey) -> Result<(), RelayError>;
}

/// Result of a status cache write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    /// The snapshot now holds the incoming event.
    Applied,
    /// The incoming event is identical to the stored one.
    Unchanged,
    /// The stored snapshot is newer; nothing changed.
    Stale,
}

/// One page of failing pipelines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailurePage {
    /// Snapshots ordered by pipeline id ascending.
    pub items: Vec<PipelineStatusSnapshot>,
    /// Pass back as `after` to fetch the next page; `None` on the last page.
    pub next_cursor: Option<PipelineId>,
}

/// Latest-known state per pipeline.
///
/// `update` must be atomic per pipeline: concurrent writers for the same
/// pipeline never lose the newer event.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Stores `event` unless the current snapshot is newer.
    async fn update(&self, event: &PipelineEvent) -> Result<StatusUpdate, RelayError>;

    /// Returns the snapshot for `pipeline_id`, or `None` if never seen.
    async fn get(&self, pipeline_id: &PipelineId)
        -> Result<Option<PipelineStatusSnapshot>, RelayError>;

    /// Returns up to `limit` pipelines whose latest stage is failed and whose
    /// event timestamp is at or after `since`, starting strictly after the
    /// `after` cursor.
    async fn failures_since(
        &self,
        since: Timestamp,
        after: Option<&PipelineId>,
        limit: usize,
    ) -> Result<FailurePage, RelayError>;
}

/// Read access to subscriptions at match time.
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    /// Returns every currently active subscription.
    async fn active_subscriptions(&self) -> Result<Vec<Subscription>, RelayError>;
}
