//! Shared fixtures for relay scenario tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use pipeline::{
    PipelineEvent, PipelinePattern, Sink, SinkError, SinkRef, SinkRegistry, Stage, SubscriberId,
    Subscription, SubscriptionFilter,
};
use relay::{
    DeliveryPolicy, Dispatcher, InMemoryDedupStore, InMemoryStatusCache, Orchestrator,
    SubscriptionRegistry,
};

// ============================================================================
// Sinks
// ============================================================================

/// Records every delivered event.
#[derive(Debug, Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<(String, PipelineEvent)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(subscriber_id, event)` pairs in delivery order.
    pub fn deliveries(&self) -> Vec<(String, PipelineEvent)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn kind(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, event: &PipelineEvent, subscription: &Subscription) -> Result<(), SinkError> {
        self.delivered
            .lock()
            .unwrap()
            .push((subscription.subscriber_id.to_string(), event.clone()));
        Ok(())
    }
}

/// Always fails with a transient error.
#[derive(Debug, Default)]
pub struct FailingSink {
    calls: Mutex<u32>,
}

impl FailingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Sink for FailingSink {
    fn kind(&self) -> &'static str {
        "failing"
    }

    async fn deliver(&self, _: &PipelineEvent, _: &Subscription) -> Result<(), SinkError> {
        *self.calls.lock().unwrap() += 1;
        Err(SinkError::transient("connection refused"))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn subscription(id: &str, pipeline: &str, stages: &[Stage], sink: &str) -> Subscription {
    Subscription {
        subscriber_id: SubscriberId::new(id).unwrap(),
        filter: SubscriptionFilter {
            pipeline: PipelinePattern::parse(pipeline).unwrap(),
            stages: stages.iter().copied().collect(),
        },
        sink_ref: SinkRef::new(sink).unwrap(),
        active: true,
    }
}

/// Generic-format payload.
pub fn payload(pipeline: &str, run: &str, stage: &str, attempt: u64, ts: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "pipeline_id": pipeline,
        "run_id": run,
        "stage": stage,
        "attempt_sequence": attempt,
        "timestamp": ts,
    }))
    .unwrap()
}

pub fn test_policy() -> DeliveryPolicy {
    DeliveryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(2),
        attempt_timeout: Duration::from_secs(1),
        retry_queue_capacity: 64,
    }
}

/// Everything a scenario needs, backed by the in-memory stores.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub dedup: Arc<InMemoryDedupStore>,
    pub status: Arc<InMemoryStatusCache>,
    pub registry: Arc<SubscriptionRegistry>,
}

impl Harness {
    pub fn new(sinks: SinkRegistry, subscriptions: Vec<Subscription>) -> Self {
        let dedup = Arc::new(InMemoryDedupStore::default());
        let status = Arc::new(InMemoryStatusCache::new());
        let registry = Arc::new(SubscriptionRegistry::with_subscriptions(subscriptions));
        let orchestrator = Orchestrator::new(
            dedup.clone(),
            status.clone(),
            registry.clone(),
            Dispatcher::new(sinks, test_policy()),
        );
        Self {
            orchestrator,
            dedup,
            status,
            registry,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        self.orchestrator.dispatcher()
    }
}

/// Pairs a sink with its configured name.
pub fn named(name: &'static str, sink: Arc<dyn Sink>) -> (&'static str, Arc<dyn Sink>) {
    (name, sink)
}

pub fn sinks(entries: Vec<(&'static str, Arc<dyn Sink>)>) -> SinkRegistry {
    entries
        .into_iter()
        .fold(SinkRegistry::new(), |registry, (name, sink)| {
            registry.with(SinkRef::new(name).unwrap(), sink)
        })
}

/// Toggle shared between a test and a failure-injecting store.
#[derive(Debug, Default, Clone)]
pub struct FailureSwitch(Arc<AtomicBool>);

impl FailureSwitch {
    pub fn trip(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
