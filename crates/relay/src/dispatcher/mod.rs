//! Delivery Dispatcher.
//!
//! Sends matched events to sinks with per-subscriber isolation and
//! exponential-backoff retries. Each event/subscriber pair owns one
//! [`DeliveryAttempt`] record in the attempt ledger; every sink invocation
//! runs in its own task, so a slow or hung sink delays nobody else.
//!
//! ## Attempt lifecycle
//!
//! ```text
//! Pending ──ok──────────────────────────────► Delivered
//!    │
//!    └─err─► Failed ──(delay expires)──► Pending ...
//!              │
//!              └──(exhausted | non-retryable)──► Abandoned
//! ```
//!
//! Transitions happen under the ledger entry lock. A sink result is applied
//! only if the record is still `Pending` with the generation and attempt
//! count observed when the invocation started, so a retry firing after an
//! out-of-band acknowledgement, after abandonment, or after the record was
//! replaced by a re-dispatch, is a no-op.
//!
//! At most `retry_queue_capacity` retries wait in the scheduler at once; a
//! failure that finds the queue full is abandoned. Terminal records stay
//! inspectable until [`Dispatcher::prune_settled_at`] (or the task started by
//! [`Dispatcher::spawn_pruner`]) removes them after their retention window.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | `policy` | [`DeliveryPolicy`] backoff and attempt budget |
//! | `metrics` | [`DispatchMetrics`] counters and [`DeliveryOutcome`] |
//! | `scheduler` | delay-queue task re-running failed attempts |

mod metrics;
mod policy;
mod scheduler;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};

use pipeline::{
    AttemptKey, DeliveryAttempt, DeliveryStatus, PipelineEvent, PipelineId, RetryPolicy,
    SinkError, SinkRegistry, Subscription, Timestamp,
};

pub use metrics::{DeliveryOutcome, DispatchMetrics, MetricsSnapshot};
pub use policy::{DeliveryPolicy, MAX_RETRY_DELAY};

use scheduler::ScheduledRetry;

const OUTCOME_CHANNEL_CAPACITY: usize = 256;

/// Ledger entry: the public record plus what is needed to re-run it.
#[derive(Debug)]
struct Tracked {
    /// Distinguishes a record from the one it replaced on re-dispatch.
    generation: u64,
    record: DeliveryAttempt,
    event: Arc<PipelineEvent>,
    subscription: Arc<Subscription>,
}

/// Inputs captured when an invocation starts.
struct Claim {
    generation: u64,
    event: Arc<PipelineEvent>,
    subscription: Arc<Subscription>,
    attempt_count: u32,
}

/// Shared dispatcher state.
pub(crate) struct Inner {
    sinks: SinkRegistry,
    policy: DeliveryPolicy,
    ledger: DashMap<AttemptKey, Tracked>,
    retries: mpsc::Sender<ScheduledRetry>,
    /// Retries handed to the scheduler and not yet fired.
    scheduled: AtomicUsize,
    generations: AtomicU64,
    outcomes: broadcast::Sender<DeliveryOutcome>,
    metrics: DispatchMetrics,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Fire-and-forget delivery of events to subscribers.
///
/// Cheap to clone; clones share the same attempt ledger and scheduler.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("sinks", &self.inner.sinks)
            .field("policy", &self.inner.policy)
            .field("attempts", &self.inner.ledger.len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Dispatcher {
    /// Creates a dispatcher and starts its retry scheduler.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(sinks: SinkRegistry, policy: DeliveryPolicy) -> Self {
        let (retries, receiver) = mpsc::channel(policy.retry_queue_capacity.max(1));
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            sinks,
            policy,
            ledger: DashMap::new(),
            retries,
            scheduled: AtomicUsize::new(0),
            generations: AtomicU64::new(0),
            outcomes,
            metrics: DispatchMetrics::default(),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        tokio::spawn(scheduler::run(Arc::downgrade(&inner), receiver));
        Self { inner }
    }

    /// Retry policy in effect.
    pub fn policy(&self) -> &DeliveryPolicy {
        &self.inner.policy
    }

    /// Starts delivery of `event` to every subscription in `subscriptions`.
    ///
    /// Returns immediately. A subscriber whose previous attempt for the same
    /// event is terminal gets a fresh attempt; one whose attempt is still in
    /// progress is left alone. The returned keys cover every subscriber in
    /// either case.
    pub fn dispatch(&self, event: &PipelineEvent, subscriptions: Vec<Subscription>) -> Vec<AttemptKey> {
        let event = Arc::new(event.clone());
        let mut keys = Vec::with_capacity(subscriptions.len());

        for subscription in subscriptions {
            let key = AttemptKey {
                event_key: event.key(),
                subscriber_id: subscription.subscriber_id.clone(),
            };
            let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
            let fresh = Tracked {
                generation,
                record: DeliveryAttempt::pending(
                    key.event_key.clone(),
                    key.subscriber_id.clone(),
                    subscription.sink_ref.clone(),
                ),
                event: Arc::clone(&event),
                subscription: Arc::new(subscription),
            };

            let started = match self.inner.ledger.entry(key.clone()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(fresh);
                    true
                }
                Entry::Occupied(mut occupied) if occupied.get().record.status.is_terminal() => {
                    occupied.insert(fresh);
                    true
                }
                Entry::Occupied(_) => {
                    debug!(%key, "delivery already in progress");
                    false
                }
            };

            if started {
                self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(Arc::clone(&self.inner).run_attempt(key.clone(), generation, 0));
            }
            keys.push(key);
        }
        keys
    }

    /// Marks a non-terminal attempt delivered out-of-band.
    ///
    /// Returns `false` if the attempt is unknown or already terminal. A
    /// retry firing afterwards does nothing.
    pub fn acknowledge(&self, key: &AttemptKey) -> bool {
        let acknowledged = match self.inner.ledger.get_mut(key) {
            Some(mut tracked) if !tracked.record.status.is_terminal() => {
                tracked.record.status = DeliveryStatus::Delivered;
                tracked.record.updated_at = Timestamp::now();
                Some(tracked.record.attempt_count)
            }
            _ => None,
        };
        match acknowledged {
            Some(attempts) => {
                self.inner.metrics.record_delivered();
                self.inner.publish(DeliveryOutcome::Delivered {
                    key: key.clone(),
                    attempts,
                });
                self.inner.finish();
                true
            }
            None => false,
        }
    }

    /// Snapshot of one attempt record.
    pub fn attempt(&self, key: &AttemptKey) -> Option<DeliveryAttempt> {
        self.inner.ledger.get(key).map(|t| t.record.clone())
    }

    /// Snapshots of every attempt for `pipeline_id`, ordered by event then
    /// subscriber.
    pub fn attempts_for(&self, pipeline_id: &PipelineId) -> Vec<DeliveryAttempt> {
        let mut attempts: Vec<DeliveryAttempt> = self
            .inner
            .ledger
            .iter()
            .filter(|t| t.key().event_key.pipeline_id == *pipeline_id)
            .map(|t| t.record.clone())
            .collect();
        attempts.sort_by(|a, b| {
            (&a.event_key, &a.subscriber_id).cmp(&(&b.event_key, &b.subscriber_id))
        });
        attempts
    }

    /// Subscribes to delivery outcomes. Lagging receivers lose old outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryOutcome> {
        self.inner.outcomes.subscribe()
    }

    /// Delivery counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Number of attempts not yet delivered or abandoned.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Number of retries waiting in the scheduler.
    pub fn scheduled_retries(&self) -> usize {
        self.inner.scheduled.load(Ordering::SeqCst)
    }

    /// Removes delivered and abandoned records last updated `retention` or
    /// more before `now`. Returns the number removed.
    pub fn prune_settled_at(&self, retention: Duration, now: Timestamp) -> usize {
        let before = self.inner.ledger.len();
        self.inner.ledger.retain(|_, tracked| {
            !tracked.record.status.is_terminal() || tracked.record.updated_at.saturating_add(retention) > now
        });
        before.saturating_sub(self.inner.ledger.len())
    }

    /// Starts a background task pruning settled records every `interval`
    /// until `cancel` fires.
    pub fn spawn_pruner(
        &self,
        retention: Duration,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let pruned = dispatcher.prune_settled_at(retention, Timestamp::now());
                        if pruned > 0 {
                            debug!(pruned, remaining = dispatcher.inner.ledger.len(), "pruned settled delivery records");
                        }
                    }
                }
            }
        })
    }

    /// Resolves once no attempt is pending or awaiting retry.
    pub async fn settled(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Inner {
    /// Runs one sink invocation for `key`.
    ///
    /// `generation` and `expected_count` are what the caller observed; the
    /// invocation is skipped if the record has moved on since.
    async fn run_attempt(self: Arc<Self>, key: AttemptKey, generation: u64, expected_count: u32) {
        let Some(claim) = self.claim(&key, generation, expected_count) else {
            debug!(%key, "attempt superseded; skipping");
            return;
        };

        let span = info_span!(
            "deliver",
            subscriber_id = %key.subscriber_id,
            event = %key.event_key,
            sink = %claim.subscription.sink_ref,
            attempt_count = claim.attempt_count,
        );
        self.execute(key, claim).instrument(span).await;
    }

    /// Moves the record to `Pending` and increments its attempt count.
    fn claim(&self, key: &AttemptKey, generation: u64, expected_count: u32) -> Option<Claim> {
        let mut tracked = self.ledger.get_mut(key)?;
        if tracked.generation != generation {
            return None;
        }
        let record = &mut tracked.record;
        let claimable = record.attempt_count == expected_count
            && match record.status {
                DeliveryStatus::Pending => expected_count == 0,
                DeliveryStatus::Failed => true,
                DeliveryStatus::Delivered | DeliveryStatus::Abandoned => false,
            };
        if !claimable {
            return None;
        }

        record.status = DeliveryStatus::Pending;
        record.attempt_count += 1;
        record.updated_at = Timestamp::now();
        Some(Claim {
            generation,
            event: Arc::clone(&tracked.event),
            subscription: Arc::clone(&tracked.subscription),
            attempt_count: tracked.record.attempt_count,
        })
    }

    async fn execute(self: Arc<Self>, key: AttemptKey, claim: Claim) {
        let result = self.invoke(&claim.event, &claim.subscription).await;
        let generation = claim.generation;
        let attempts = claim.attempt_count;

        let err = match result {
            Ok(()) => {
                if self.transition(&key, generation, attempts, DeliveryStatus::Delivered, None) {
                    debug!("delivered");
                    self.metrics.record_delivered();
                    self.publish(DeliveryOutcome::Delivered { key, attempts });
                    self.finish();
                }
                return;
            }
            Err(err) => err,
        };

        let floor = match err.retry {
            RetryPolicy::NonRetryable => {
                self.abandon(key, generation, attempts, err.reason);
                return;
            }
            RetryPolicy::Retryable { after } => after,
        };
        if self.policy.is_exhausted(attempts) {
            self.abandon(key, generation, attempts, err.reason);
            return;
        }

        if !self.transition(&key, generation, attempts, DeliveryStatus::Failed, Some(&err.reason)) {
            return;
        }
        if !self.reserve_retry_slot() {
            let reason = format!("{} (retry queue full)", err.reason);
            self.abandon_failed(key, generation, attempts, reason);
            return;
        }
        let delay = self.policy.retry_delay(attempts, floor);
        warn!(error = %err.reason, delay_ms = delay.as_millis() as u64, "delivery failed; retry scheduled");
        self.metrics.record_retry();
        self.publish(DeliveryOutcome::Retrying {
            key: key.clone(),
            attempts,
            delay,
            error: err.reason.clone(),
        });

        let retry = ScheduledRetry {
            key: key.clone(),
            generation,
            after_attempt: attempts,
            delay,
        };
        if let Err(err) = self.retries.try_send(retry) {
            self.release_retry_slot();
            let reason = match err {
                TrySendError::Full(_) => "retry queue full",
                TrySendError::Closed(_) => "retry scheduler stopped",
            };
            self.abandon_failed(key, generation, attempts, reason.to_string());
        }
    }

    /// Takes one of the `retry_queue_capacity` scheduler slots.
    fn reserve_retry_slot(&self) -> bool {
        let capacity = self.policy.retry_queue_capacity.max(1);
        self.scheduled
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < capacity).then_some(n + 1))
            .is_ok()
    }

    /// Returns a slot taken by [`Inner::reserve_retry_slot`].
    pub(crate) fn release_retry_slot(&self) {
        let _ = self
            .scheduled
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Calls the sink bound to the subscription, bounded by the attempt timeout.
    async fn invoke(&self, event: &PipelineEvent, subscription: &Subscription) -> Result<(), SinkError> {
        let Some(sink) = self.sinks.get(&subscription.sink_ref) else {
            return Err(SinkError::permanent(format!(
                "sink '{}' is not configured",
                subscription.sink_ref
            )));
        };
        match tokio::time::timeout(self.policy.attempt_timeout, sink.deliver(event, subscription)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::transient(format!(
                "{} sink timed out after {}ms",
                sink.kind(),
                self.policy.attempt_timeout.as_millis()
            ))),
        }
    }

    /// Applies a sink result if the record still belongs to this invocation.
    fn transition(
        &self,
        key: &AttemptKey,
        generation: u64,
        attempts: u32,
        status: DeliveryStatus,
        error: Option<&str>,
    ) -> bool {
        let Some(mut tracked) = self.ledger.get_mut(key) else {
            return false;
        };
        if tracked.generation != generation {
            debug!(%key, "record replaced; result ignored");
            return false;
        }
        let record = &mut tracked.record;
        if record.status != DeliveryStatus::Pending || record.attempt_count != attempts {
            debug!(%key, current = %record.status, "attempt resolved elsewhere; result ignored");
            return false;
        }
        record.status = status;
        if let Some(error) = error {
            record.last_error = Some(error.to_string());
        }
        record.updated_at = Timestamp::now();
        true
    }

    fn abandon(&self, key: AttemptKey, generation: u64, attempts: u32, reason: String) {
        if self.transition(&key, generation, attempts, DeliveryStatus::Abandoned, Some(&reason)) {
            self.report_abandoned(key, attempts, reason);
        }
    }

    /// Abandons an attempt that was already moved to `Failed`.
    fn abandon_failed(&self, key: AttemptKey, generation: u64, attempts: u32, reason: String) {
        let abandoned = match self.ledger.get_mut(&key) {
            Some(mut tracked)
                if tracked.generation == generation
                    && tracked.record.status == DeliveryStatus::Failed
                    && tracked.record.attempt_count == attempts =>
            {
                tracked.record.status = DeliveryStatus::Abandoned;
                tracked.record.last_error = Some(reason.clone());
                tracked.record.updated_at = Timestamp::now();
                true
            }
            _ => false,
        };
        if abandoned {
            self.report_abandoned(key, attempts, reason);
        }
    }

    fn report_abandoned(&self, key: AttemptKey, attempts: u32, reason: String) {
        error!(%key, attempts, error = %reason, "delivery abandoned");
        self.metrics.record_abandoned();
        self.publish(DeliveryOutcome::Abandoned {
            key,
            attempts,
            error: reason,
        });
        self.finish();
    }

    fn publish(&self, outcome: DeliveryOutcome) {
        // No receivers is fine.
        let _ = self.outcomes.send(outcome);
    }

    /// Records that one attempt reached a terminal state.
    fn finish(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use pipeline::{
        AttemptSequence, Metadata, PipelinePattern, RunId, Sink, SinkRef, Stage, SubscriberId,
        SubscriptionFilter,
    };

    use super::*;

    /// Fails the first `failures` calls, then succeeds.
    struct FlakySink {
        failures: u32,
        error: SinkError,
        calls: AtomicU32,
    }

    impl FlakySink {
        fn new(failures: u32, error: SinkError) -> Arc<Self> {
            Arc::new(Self {
                failures,
                error,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Sink for FlakySink {
        fn kind(&self) -> &'static str {
            "flaky"
        }

        async fn deliver(&self, _: &PipelineEvent, _: &Subscription) -> Result<(), SinkError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }
    }

    /// Fails with each scripted error in turn, then succeeds.
    struct ScriptedSink {
        script: Mutex<VecDeque<SinkError>>,
        calls: AtomicU32,
    }

    impl ScriptedSink {
        fn new(errors: Vec<SinkError>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(errors.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Sink for ScriptedSink {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        async fn deliver(&self, _: &PipelineEvent, _: &Subscription) -> Result<(), SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    /// Never returns.
    struct HangingSink;

    #[async_trait]
    impl Sink for HangingSink {
        fn kind(&self) -> &'static str {
            "hanging"
        }

        async fn deliver(&self, _: &PipelineEvent, _: &Subscription) -> Result<(), SinkError> {
            std::future::pending().await
        }
    }

    fn event() -> PipelineEvent {
        PipelineEvent {
            pipeline_id: PipelineId::new("p1").unwrap(),
            run_id: RunId::new("r1").unwrap(),
            stage: Stage::Failed,
            timestamp: Timestamp::from_epoch_millis(1_000).unwrap(),
            attempt_sequence: AttemptSequence::FIRST,
            metadata: Metadata::new(),
        }
    }

    fn subscription(id: &str, sink: &str) -> Subscription {
        Subscription {
            subscriber_id: SubscriberId::new(id).unwrap(),
            filter: SubscriptionFilter {
                pipeline: PipelinePattern::Any,
                stages: [Stage::Failed].into_iter().collect(),
            },
            sink_ref: SinkRef::new(sink).unwrap(),
            active: true,
        }
    }

    fn policy(max_attempts: u32) -> DeliveryPolicy {
        DeliveryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            attempt_timeout: Duration::from_secs(5),
            retry_queue_capacity: 16,
        }
    }

    fn registry(name: &str, sink: Arc<dyn Sink>) -> SinkRegistry {
        SinkRegistry::new().with(SinkRef::new(name).unwrap(), sink)
    }

    #[tokio::test(start_paused = true)]
    async fn successful_delivery_on_first_attempt() {
        let sink = FlakySink::new(0, SinkError::transient("x"));
        let dispatcher = Dispatcher::new(registry("chat", sink.clone()), policy(3));

        let keys = dispatcher.dispatch(&event(), vec![subscription("s1", "chat")]);
        dispatcher.settled().await;

        let record = dispatcher.attempt(&keys[0]).unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(sink.calls(), 1);
        assert_eq!(dispatcher.metrics().delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let sink = FlakySink::new(2, SinkError::transient("503"));
        let dispatcher = Dispatcher::new(registry("chat", sink.clone()), policy(5));

        let keys = dispatcher.dispatch(&event(), vec![subscription("s1", "chat")]);
        dispatcher.settled().await;

        let record = dispatcher.attempt(&keys[0]).unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.attempt_count, 3);
        assert_eq!(record.last_error.as_deref(), Some("503"));
        assert_eq!(dispatcher.metrics().retried, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_abandon_and_report() {
        let sink = FlakySink::new(u32::MAX, SinkError::transient("down"));
        let dispatcher = Dispatcher::new(registry("chat", sink.clone()), policy(3));
        let mut outcomes = dispatcher.subscribe();

        let keys = dispatcher.dispatch(&event(), vec![subscription("s1", "chat")]);
        dispatcher.settled().await;

        let record = dispatcher.attempt(&keys[0]).unwrap();
        assert_eq!(record.status, DeliveryStatus::Abandoned);
        assert_eq!(record.attempt_count, 3);
        assert_eq!(sink.calls(), 3);
        assert_eq!(
            dispatcher.metrics(),
            MetricsSnapshot {
                delivered: 0,
                retried: 2,
                abandoned: 1
            }
        );

        let mut last = None;
        while let Ok(outcome) = outcomes.try_recv() {
            last = Some(outcome);
        }
        assert!(matches!(last, Some(DeliveryOutcome::Abandoned { attempts: 3, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_abandons_immediately() {
        let sink = FlakySink::new(u32::MAX, SinkError::permanent("404"));
        let dispatcher = Dispatcher::new(registry("chat", sink.clone()), policy(5));

        let keys = dispatcher.dispatch(&event(), vec![subscription("s1", "chat")]);
        dispatcher.settled().await;

        assert_eq!(dispatcher.attempt(&keys[0]).unwrap().status, DeliveryStatus::Abandoned);
        assert_eq!(sink.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_sink_is_abandoned() {
        let dispatcher = Dispatcher::new(SinkRegistry::new(), policy(5));
        let keys = dispatcher.dispatch(&event(), vec![subscription("s1", "missing")]);
        dispatcher.settled().await;

        let record = dispatcher.attempt(&keys[0]).unwrap();
        assert_eq!(record.status, DeliveryStatus::Abandoned);
        assert!(record.last_error.unwrap().contains("missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_sink_times_out_without_blocking_others() {
        let healthy = FlakySink::new(0, SinkError::transient("x"));
        let sinks = registry("hung", Arc::new(HangingSink)).with(SinkRef::new("ok").unwrap(), healthy.clone());
        let dispatcher = Dispatcher::new(sinks, policy(2));
        let mut outcomes = dispatcher.subscribe();

        let keys = dispatcher.dispatch(
            &event(),
            vec![subscription("a", "hung"), subscription("b", "ok")],
        );
        let first = outcomes.recv().await.unwrap();
        assert!(matches!(first, DeliveryOutcome::Delivered { .. }));
        assert_eq!(first.key(), &keys[1]);

        dispatcher.settled().await;
        let hung = dispatcher.attempt(&keys[0]).unwrap();
        assert_eq!(hung.status, DeliveryStatus::Abandoned);
        assert!(hung.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_floor_delays_the_next_attempt() {
        let sink = FlakySink::new(1, SinkError::retry_after("429", Duration::from_secs(6)));
        let dispatcher = Dispatcher::new(registry("chat", sink.clone()), policy(3));
        let mut outcomes = dispatcher.subscribe();

        dispatcher.dispatch(&event(), vec![subscription("s1", "chat")]);
        match outcomes.recv().await.unwrap() {
            DeliveryOutcome::Retrying { delay, .. } => assert_eq!(delay, Duration::from_secs(6)),
            other => panic!("unexpected outcome {other:?}"),
        }
        dispatcher.settled().await;
        assert_eq!(sink.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_retry_after_is_capped_and_spares_other_subscribers() {
        let throttled = FlakySink::new(1, SinkError::retry_after("429", Duration::from_secs(100_000_000)));
        let flaky = FlakySink::new(1, SinkError::transient("503"));
        let sinks = registry("throttled", throttled.clone()).with(SinkRef::new("flaky").unwrap(), flaky.clone());
        let dispatcher = Dispatcher::new(sinks, policy(3));
        let mut outcomes = dispatcher.subscribe();

        let keys = dispatcher.dispatch(
            &event(),
            vec![subscription("a", "throttled"), subscription("b", "flaky")],
        );
        for _ in 0..2 {
            match outcomes.recv().await.unwrap() {
                DeliveryOutcome::Retrying { delay, .. } => assert!(delay <= Duration::from_secs(8)),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        dispatcher.settled().await;

        for key in &keys {
            let record = dispatcher.attempt(key).unwrap();
            assert_eq!(record.status, DeliveryStatus::Delivered, "{key}");
            assert_eq!(record.attempt_count, 2);
        }
        assert_eq!(dispatcher.metrics().abandoned, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_retry_queue_abandons_the_overflowing_attempt() {
        let sink = FlakySink::new(u32::MAX, SinkError::transient("down"));
        let dispatcher = Dispatcher::new(
            registry("chat", sink.clone()),
            DeliveryPolicy {
                retry_queue_capacity: 1,
                ..policy(2)
            },
        );
        let mut outcomes = dispatcher.subscribe();

        dispatcher.dispatch(&event(), vec![subscription("a", "chat"), subscription("b", "chat")]);
        let mut retrying = 0;
        let mut overflowed = 0;
        for _ in 0..2 {
            match outcomes.recv().await.unwrap() {
                DeliveryOutcome::Retrying { .. } => retrying += 1,
                DeliveryOutcome::Abandoned { attempts, error, .. } => {
                    assert_eq!(attempts, 1);
                    assert!(error.contains("retry queue full"), "{error}");
                    overflowed += 1;
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!((retrying, overflowed), (1, 1));
        assert_eq!(dispatcher.scheduled_retries(), 1);

        dispatcher.settled().await;
        assert_eq!(dispatcher.scheduled_retries(), 0);
        assert_eq!(
            dispatcher.metrics(),
            MetricsSnapshot {
                delivered: 0,
                retried: 1,
                abandoned: 2
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_record_ignores_retry_of_its_predecessor() {
        let sink = ScriptedSink::new(vec![
            SinkError::transient("503"),
            SinkError::retry_after("429", Duration::from_secs(5)),
        ]);
        let dispatcher = Dispatcher::new(registry("chat", sink.clone()), policy(5));
        let mut outcomes = dispatcher.subscribe();

        let keys = dispatcher.dispatch(&event(), vec![subscription("s1", "chat")]);
        assert!(matches!(outcomes.recv().await.unwrap(), DeliveryOutcome::Retrying { .. }));
        assert!(dispatcher.acknowledge(&keys[0]));

        // The first record is terminal, so this starts a fresh one whose first
        // failure asks for a 5s delay.
        dispatcher.dispatch(&event(), vec![subscription("s1", "chat")]);
        loop {
            if let DeliveryOutcome::Retrying { delay, .. } = outcomes.recv().await.unwrap() {
                assert_eq!(delay, Duration::from_secs(5));
                break;
            }
        }

        // The predecessor's retry (due within 1s) must not run the new record early.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.calls(), 2);
        let record = dispatcher.attempt(&keys[0]).unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.attempt_count, 1);

        dispatcher.settled().await;
        assert_eq!(sink.calls(), 3);
        let record = dispatcher.attempt(&keys[0]).unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.attempt_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn settled_records_are_pruned_after_retention() {
        let ok = FlakySink::new(0, SinkError::transient("x"));
        let down = FlakySink::new(u32::MAX, SinkError::transient("down"));
        let sinks = registry("ok", ok).with(SinkRef::new("down").unwrap(), down);
        let dispatcher = Dispatcher::new(sinks, policy(5));
        let mut outcomes = dispatcher.subscribe();

        let keys = dispatcher.dispatch(&event(), vec![subscription("a", "ok"), subscription("b", "down")]);
        for _ in 0..2 {
            outcomes.recv().await.unwrap();
        }

        let retention = Duration::from_secs(60);
        assert_eq!(dispatcher.prune_settled_at(retention, Timestamp::now()), 0);

        let later = Timestamp::now().saturating_add(Duration::from_secs(61));
        assert_eq!(dispatcher.prune_settled_at(retention, later), 1);
        assert!(dispatcher.attempt(&keys[0]).is_none());
        assert_eq!(dispatcher.attempt(&keys[1]).unwrap().status, DeliveryStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn pruner_task_stops_on_cancel() {
        let dispatcher = Dispatcher::new(SinkRegistry::new(), policy(1));
        dispatcher.dispatch(&event(), vec![subscription("a", "missing")]);
        dispatcher.settled().await;

        let cancel = CancellationToken::new();
        let handle = dispatcher.spawn_pruner(Duration::ZERO, Duration::from_secs(1), cancel.clone());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(dispatcher.attempts_for(&PipelineId::new("p1").unwrap()).is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_attempt_ignores_the_pending_retry() {
        let sink = FlakySink::new(u32::MAX, SinkError::transient("down"));
        let dispatcher = Dispatcher::new(registry("chat", sink.clone()), policy(5));
        let mut outcomes = dispatcher.subscribe();

        let keys = dispatcher.dispatch(&event(), vec![subscription("s1", "chat")]);
        assert!(matches!(outcomes.recv().await.unwrap(), DeliveryOutcome::Retrying { .. }));

        assert!(dispatcher.acknowledge(&keys[0]));
        assert!(!dispatcher.acknowledge(&keys[0]));
        dispatcher.settled().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        let record = dispatcher.attempt(&keys[0]).unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(sink.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn redispatch_restarts_terminal_attempts_only() {
        let sink = FlakySink::new(0, SinkError::transient("x"));
        let dispatcher = Dispatcher::new(registry("chat", sink.clone()), policy(3));

        dispatcher.dispatch(&event(), vec![subscription("s1", "chat")]);
        dispatcher.settled().await;
        dispatcher.dispatch(&event(), vec![subscription("s1", "chat")]);
        dispatcher.settled().await;
        assert_eq!(sink.calls(), 2);

        let attempts = dispatcher.attempts_for(&PipelineId::new("p1").unwrap());
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, DeliveryStatus::Delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_attempt_is_not_duplicated() {
        let sink = FlakySink::new(u32::MAX, SinkError::transient("down"));
        let dispatcher = Dispatcher::new(registry("chat", sink.clone()), policy(2));

        let first = dispatcher.dispatch(&event(), vec![subscription("s1", "chat")]);
        let second = dispatcher.dispatch(&event(), vec![subscription("s1", "chat")]);
        assert_eq!(first, second);
        assert_eq!(dispatcher.in_flight(), 1);

        dispatcher.settled().await;
        assert_eq!(sink.calls(), 2);
    }

    #[tokio::test]
    async fn settled_returns_immediately_when_idle() {
        let dispatcher = Dispatcher::new(SinkRegistry::new(), DeliveryPolicy::DEFAULT);
        dispatcher.settled().await;
        assert!(dispatcher.attempts_for(&PipelineId::new("p1").unwrap()).is_empty());
    }
}
