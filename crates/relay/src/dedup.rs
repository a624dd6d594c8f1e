//! In-memory Dedup Store.
//!
//! Keys are [`EventKey`] tuples mapped to their expiry instant. Admission uses
//! the map's per-shard entry lock, so the check-and-set is atomic per key and
//! concurrent admissions of one key yield exactly one [`Admission::Accepted`].
//!
//! # TTL-based Expiration
//!
//! Expired keys are treated as absent on admission (lazy expiry) and are also
//! removed by [`InMemoryDedupStore::spawn_sweeper`] to bound memory. A key that
//! reappears after its window is accepted again; this is inherent to a
//! time-bounded idempotency window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use pipeline::{Admission, DedupStore, EventKey, RelayError, Timestamp};

/// Default retention window (6 hours).
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(6 * 60 * 60);

/// Process-local idempotency store.
#[derive(Debug)]
pub struct InMemoryDedupStore {
    expiries: DashMap<EventKey, Timestamp>,
    retention: Duration,
}

impl Default for InMemoryDedupStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl InMemoryDedupStore {
    /// Creates a store that suppresses duplicates for `retention`.
    pub fn new(retention: Duration) -> Self {
        Self {
            expiries: DashMap::new(),
            retention,
        }
    }

    /// Returns the configured retention window.
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Admission check evaluated at `now`.
    pub fn admit_at(&self, key: &EventKey, now: Timestamp) -> Admission {
        let expiry = now.saturating_add(self.retention);
        match self.expiries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() > now {
                    Admission::Duplicate
                } else {
                    occupied.insert(expiry);
                    Admission::Accepted
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(expiry);
                Admission::Accepted
            }
        }
    }

    /// Removes every key whose window ended at or before `now`.
    ///
    /// Returns the number of keys removed.
    pub fn sweep_at(&self, now: Timestamp) -> usize {
        let before = self.expiries.len();
        self.expiries.retain(|_, expiry| *expiry > now);
        before.saturating_sub(self.expiries.len())
    }

    /// Number of tracked keys, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.expiries.len()
    }

    /// Returns `true` if no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.expiries.is_empty()
    }

    /// Starts a background task sweeping expired keys every `interval` until
    /// `cancel` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let pruned = self.sweep_at(Timestamp::now());
                        if pruned > 0 {
                            debug!(pruned, remaining = self.len(), "swept expired dedup keys");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn admit(&self, key: &EventKey) -> Result<Admission, RelayError> {
        Ok(self.admit_at(key, Timestamp::now()))
    }

    async fn release(&self, key: &EventKey) -> Result<(), RelayError> {
        self.expiries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use pipeline::{AttemptSequence, PipelineId, RunId, Stage};
    use proptest::prelude::*;

    use super::*;

    fn key(pipeline: &str, run: &str, attempt: u64, stage: Stage) -> EventKey {
        EventKey {
            pipeline_id: PipelineId::new(pipeline).unwrap(),
            run_id: RunId::new(run).unwrap(),
            attempt_sequence: AttemptSequence::new(attempt),
            stage,
        }
    }

    fn at(secs: i64) -> Timestamp {
        Timestamp::from_epoch_millis(secs * 1000).unwrap()
    }

    #[test]
    fn second_admission_within_window_is_duplicate() {
        let store = InMemoryDedupStore::new(Duration::from_secs(60));
        let k = key("p1", "r1", 1, Stage::Failed);

        assert_eq!(store.admit_at(&k, at(0)), Admission::Accepted);
        assert_eq!(store.admit_at(&k, at(59)), Admission::Duplicate);
    }

    #[test]
    fn expired_key_is_accepted_again() {
        let store = InMemoryDedupStore::new(Duration::from_secs(60));
        let k = key("p1", "r1", 1, Stage::Failed);

        assert_eq!(store.admit_at(&k, at(0)), Admission::Accepted);
        assert_eq!(store.admit_at(&k, at(60)), Admission::Accepted);
        assert_eq!(store.admit_at(&k, at(61)), Admission::Duplicate);
    }

    #[test]
    fn every_tuple_component_distinguishes_keys() {
        let store = InMemoryDedupStore::default();
        let base = key("p1", "r1", 1, Stage::Running);
        assert_eq!(store.admit_at(&base, at(0)), Admission::Accepted);

        for other in [
            key("p2", "r1", 1, Stage::Running),
            key("p1", "r2", 1, Stage::Running),
            key("p1", "r1", 2, Stage::Running),
            key("p1", "r1", 1, Stage::Failed),
        ] {
            assert_eq!(store.admit_at(&other, at(0)), Admission::Accepted, "{other}");
        }
    }

    #[test]
    fn sweep_removes_only_expired_keys() {
        let store = InMemoryDedupStore::new(Duration::from_secs(10));
        store.admit_at(&key("p1", "r1", 1, Stage::Queued), at(0));
        store.admit_at(&key("p1", "r2", 1, Stage::Queued), at(5));

        assert_eq!(store.sweep_at(at(12)), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.sweep_at(at(15)), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn release_allows_readmission() {
        let store = InMemoryDedupStore::default();
        let k = key("p1", "r1", 1, Stage::Failed);

        assert_eq!(store.admit(&k).await.unwrap(), Admission::Accepted);
        store.release(&k).await.unwrap();
        assert_eq!(store.admit(&k).await.unwrap(), Admission::Accepted);
        assert_eq!(store.admit(&k).await.unwrap(), Admission::Duplicate);
    }

    #[test]
    fn concurrent_admissions_accept_exactly_once() {
        let store = Arc::new(InMemoryDedupStore::default());
        let k = key("p1", "r1", 1, Stage::Failed);
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                let k = k.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    store.admit_at(&k, at(0))
                })
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|a| *a == Admission::Accepted)
            .count();
        assert_eq!(accepted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_on_cancel() {
        let store = Arc::new(InMemoryDedupStore::new(Duration::from_secs(1)));
        store.admit_at(&key("p1", "r1", 1, Stage::Queued), at(0));

        let cancel = CancellationToken::new();
        let handle = Arc::clone(&store).spawn_sweeper(Duration::from_secs(30), cancel.clone());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    proptest! {
        #[test]
        fn admitting_twice_never_accepts_twice(
            run in "[a-z0-9]{1,6}",
            attempt in 1u64..50,
            offset in 0i64..3600,
        ) {
            let store = InMemoryDedupStore::new(Duration::from_secs(3600));
            let k = key("p1", &run, attempt, Stage::Failed);
            let first = store.admit_at(&k, at(0));
            let second = store.admit_at(&k, at(offset));
            prop_assert_eq!(first, Admission::Accepted);
            prop_assert_eq!(second, Admission::Duplicate);
        }
    }
}
