//! In-memory Status Cache.
//!
//! Holds one [`PipelineStatusSnapshot`] per pipeline. Writes go through the
//! map's entry lock, making compare-and-update atomic per pipeline; reads clone
//! the snapshot out without blocking writers to other pipelines.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use pipeline::{
    FailurePage, PipelineEvent, PipelineId, PipelineStatusSnapshot, RelayError, Stage,
    StatusStore, StatusUpdate, Timestamp,
};

/// Process-local status cache.
#[derive(Debug, Default)]
pub struct InMemoryStatusCache {
    snapshots: DashMap<PipelineId, PipelineStatusSnapshot>,
}

impl InMemoryStatusCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `event` unless the stored snapshot is newer.
    ///
    /// An event identical to the stored one leaves the snapshot untouched.
    pub fn apply(&self, event: &PipelineEvent) -> StatusUpdate {
        match self.snapshots.entry(event.pipeline_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.event == *event {
                    StatusUpdate::Unchanged
                } else if current.accepts(event) {
                    occupied.insert(PipelineStatusSnapshot::of(event.clone()));
                    StatusUpdate::Applied
                } else {
                    StatusUpdate::Stale
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PipelineStatusSnapshot::of(event.clone()));
                StatusUpdate::Applied
            }
        }
    }

    /// Returns a copy of the snapshot for `pipeline_id`.
    pub fn snapshot(&self, pipeline_id: &PipelineId) -> Option<PipelineStatusSnapshot> {
        self.snapshots.get(pipeline_id).map(|s| s.value().clone())
    }

    /// Number of pipelines with a snapshot.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Returns `true` if no pipeline has been seen.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    fn failure_page(
        &self,
        since: Timestamp,
        after: Option<&PipelineId>,
        limit: usize,
    ) -> FailurePage {
        let limit = limit.max(1);
        let mut items: Vec<PipelineStatusSnapshot> = self
            .snapshots
            .iter()
            .filter(|s| {
                s.event.stage == Stage::Failed
                    && s.event.timestamp >= since
                    && after.map_or(true, |cursor| s.pipeline_id > *cursor)
            })
            .map(|s| s.value().clone())
            .collect();
        items.sort_by(|a, b| a.pipeline_id.cmp(&b.pipeline_id));

        let next_cursor = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|s| s.pipeline_id.clone())
        } else {
            None
        };
        FailurePage { items, next_cursor }
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusCache {
    async fn update(&self, event: &PipelineEvent) -> Result<StatusUpdate, RelayError> {
        Ok(self.apply(event))
    }

    async fn get(
        &self,
        pipeline_id: &PipelineId,
    ) -> Result<Option<PipelineStatusSnapshot>, RelayError> {
        Ok(self.snapshot(pipeline_id))
    }

    async fn failures_since(
        &self,
        since: Timestamp,
        after: Option<&PipelineId>,
        limit: usize,
    ) -> Result<FailurePage, RelayError> {
        Ok(self.failure_page(since, after, limit))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pipeline::{AttemptSequence, Metadata, RunId};
    use proptest::prelude::*;

    use super::*;

    fn event(pipeline: &str, run: &str, attempt: u64, secs: i64, stage: Stage) -> PipelineEvent {
        PipelineEvent {
            pipeline_id: PipelineId::new(pipeline).unwrap(),
            run_id: RunId::new(run).unwrap(),
            stage,
            timestamp: Timestamp::from_epoch_millis(secs * 1000).unwrap(),
            attempt_sequence: AttemptSequence::new(attempt),
            metadata: Metadata::new(),
        }
    }

    fn id(s: &str) -> PipelineId {
        PipelineId::new(s).unwrap()
    }

    #[test]
    fn newer_attempt_wins_in_either_order() {
        let e1 = event("p1", "r1", 1, 100, Stage::Failed);
        let e2 = event("p1", "r1", 2, 50, Stage::Running);

        let forward = InMemoryStatusCache::new();
        assert_eq!(forward.apply(&e1), StatusUpdate::Applied);
        assert_eq!(forward.apply(&e2), StatusUpdate::Applied);

        let backward = InMemoryStatusCache::new();
        assert_eq!(backward.apply(&e2), StatusUpdate::Applied);
        assert_eq!(backward.apply(&e1), StatusUpdate::Stale);

        assert_eq!(forward.snapshot(&id("p1")).unwrap().event, e2);
        assert_eq!(backward.snapshot(&id("p1")).unwrap().event, e2);
    }

    #[test]
    fn identical_event_is_unchanged() {
        let cache = InMemoryStatusCache::new();
        let e = event("p1", "r1", 1, 10, Stage::Failed);
        cache.apply(&e);
        let before = cache.snapshot(&id("p1")).unwrap();

        assert_eq!(cache.apply(&e), StatusUpdate::Unchanged);
        assert_eq!(cache.snapshot(&id("p1")).unwrap(), before);
    }

    #[test]
    fn same_attempt_later_timestamp_advances_stage() {
        let cache = InMemoryStatusCache::new();
        cache.apply(&event("p1", "r1", 1, 10, Stage::Running));
        assert_eq!(
            cache.apply(&event("p1", "r1", 1, 20, Stage::Succeeded)),
            StatusUpdate::Applied
        );
        assert_eq!(cache.snapshot(&id("p1")).unwrap().event.stage, Stage::Succeeded);
    }

    #[tokio::test]
    async fn unknown_pipeline_is_none() {
        let cache = InMemoryStatusCache::new();
        assert!(cache.get(&id("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failures_are_filtered_ordered_and_paged() {
        let cache = InMemoryStatusCache::new();
        cache.apply(&event("c", "r1", 1, 100, Stage::Failed));
        cache.apply(&event("a", "r1", 1, 100, Stage::Failed));
        cache.apply(&event("b", "r1", 1, 100, Stage::Succeeded));
        cache.apply(&event("d", "r1", 1, 5, Stage::Failed));
        cache.apply(&event("e", "r1", 1, 200, Stage::Failed));

        let since = Timestamp::from_epoch_millis(50_000).unwrap();
        let first = cache.failures_since(since, None, 2).await.unwrap();
        let names: Vec<_> = first.items.iter().map(|s| s.pipeline_id.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(first.next_cursor, Some(id("c")));

        let second = cache
            .failures_since(since, first.next_cursor.as_ref(), 2)
            .await
            .unwrap();
        let names: Vec<_> = second.items.iter().map(|s| s.pipeline_id.as_str()).collect();
        assert_eq!(names, vec!["e"]);
        assert_eq!(second.next_cursor, None);

        // Restarting from the beginning yields the same first page.
        assert_eq!(cache.failures_since(since, None, 2).await.unwrap(), first);
    }

    #[test]
    fn concurrent_writers_keep_the_newest_attempt() {
        let cache = Arc::new(InMemoryStatusCache::new());
        let handles: Vec<_> = (1..=32u64)
            .map(|attempt| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    cache.apply(&event("p1", "r1", attempt, 10, Stage::Running));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stored = cache.snapshot(&id("p1")).unwrap();
        assert_eq!(stored.event.attempt_sequence.as_u64(), 32);
    }

    proptest! {
        #[test]
        fn final_snapshot_is_the_maximum_regardless_of_order(
            mut attempts in prop::collection::vec((1u64..20, 0i64..1000), 1..20),
            rotate in any::<usize>(),
        ) {
            let events: Vec<_> = attempts
                .iter()
                .map(|(a, t)| event("p1", "r1", *a, *t, Stage::Running))
                .collect();
            let expected = events
                .iter()
                .max_by(|a, b| a.recency_cmp(b))
                .cloned()
                .unwrap();

            let len = attempts.len();
            attempts.rotate_left(rotate % len);
            let cache = InMemoryStatusCache::new();
            for (a, t) in &attempts {
                cache.apply(&event("p1", "r1", *a, *t, Stage::Running));
            }
            let stored = cache.snapshot(&id("p1")).unwrap().event;
            prop_assert_eq!(stored.recency_cmp(&expected), std::cmp::Ordering::Equal);
        }
    }
}
