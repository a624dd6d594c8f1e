//! Retry scheduler.
//!
//! A single task owns a [`DelayQueue`] of attempt keys. Failed attempts are
//! pushed through a bounded channel together with their delay; when a delay
//! expires the attempt is handed back to the dispatcher and its queue slot is
//! released. The dispatcher never holds more than `retry_queue_capacity`
//! slots, which bounds the queue. The task holds only
//! a weak reference to the dispatcher state and exits once the last
//! [`Dispatcher`](super::Dispatcher) handle is dropped.

use std::sync::Weak;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::time::DelayQueue;
use tracing::{debug, trace};

use pipeline::AttemptKey;

use super::{Inner, MAX_RETRY_DELAY};

/// A failed attempt waiting for its next invocation.
#[derive(Debug)]
pub(crate) struct ScheduledRetry {
    pub key: AttemptKey,
    /// Generation of the ledger record that failed.
    pub generation: u64,
    /// `attempt_count` at the time of failure; the retry is dropped if the
    /// record has moved on.
    pub after_attempt: u32,
    pub delay: Duration,
}

pub(crate) async fn run(inner: Weak<Inner>, mut retries: mpsc::Receiver<ScheduledRetry>) {
    let mut queue: DelayQueue<(AttemptKey, u64, u32)> = DelayQueue::new();

    loop {
        tokio::select! {
            received = retries.recv() => match received {
                Some(retry) => {
                    trace!(key = %retry.key, delay_ms = retry.delay.as_millis() as u64, "retry queued");
                    // DelayQueue panics on delays beyond its horizon.
                    let delay = retry.delay.min(MAX_RETRY_DELAY);
                    queue.insert((retry.key, retry.generation, retry.after_attempt), delay);
                }
                None => break,
            },
            Some(expired) = queue.next(), if !queue.is_empty() => {
                let Some(inner) = inner.upgrade() else { break };
                let (key, generation, after_attempt) = expired.into_inner();
                inner.release_retry_slot();
                tokio::spawn(inner.run_attempt(key, generation, after_attempt));
            }
        }
    }

    debug!(dropped = queue.len(), "retry scheduler stopped");
}
