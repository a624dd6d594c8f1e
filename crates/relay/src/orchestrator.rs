//! Ingestion Orchestrator.
//!
//! Drives one inbound event through the pipeline:
//!
//! ```text
//! Received → Normalized → Rejected
//!                       → DedupChecked → Dropped            (duplicate)
//!                                      → StatusUpdated → Matched → Dispatched → Done
//! ```
//!
//! A duplicate still refreshes the status cache; it is only dropped from
//! matching and dispatch. Ingestion returns once dispatch has been started;
//! delivery outcomes resolve in the background and are never part of the
//! ingestion result.
//!
//! Store failures fail closed: the caller receives
//! [`RelayError::StoreUnavailable`] and is expected to redeliver. If the
//! failure happens after the dedup key was admitted, the key is released so
//! the redelivery is processed as new.

use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info, info_span, trace, warn, Instrument};

use pipeline::{
    match_subscriptions, normalize, Admission, AttemptKey, DedupStore, EventKey, PipelineEvent,
    RelayError, SourceFormat, StatusStore, StatusUpdate, SubscriptionSource,
};

use crate::Dispatcher;

/// Per-event ingestion state. `Rejected`, `Dropped` and `Done` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Received,
    Normalized,
    Rejected,
    DedupChecked,
    Dropped,
    StatusUpdated,
    Matched,
    Dispatched,
    Done,
}

impl IngestState {
    /// Returns `true` for states that end ingestion.
    pub fn is_terminal(self) -> bool {
        matches!(self, IngestState::Rejected | IngestState::Dropped | IngestState::Done)
    }
}

/// Synchronous result of ingesting one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First sighting; status updated and dispatch started.
    Accepted {
        /// Idempotency key of the event.
        key: EventKey,
        /// One entry per matched subscriber.
        deliveries: Vec<AttemptKey>,
    },
    /// Seen within the retention window; not dispatched again.
    Duplicate {
        /// Idempotency key of the event.
        key: EventKey,
        /// Effect the redelivery had on the status cache.
        status: StatusUpdate,
    },
    /// The payload could not be normalized.
    Rejected {
        /// Why normalization failed.
        reason: String,
    },
}

impl IngestOutcome {
    /// Terminal [`IngestState`] the event ended in.
    pub fn state(&self) -> IngestState {
        match self {
            IngestOutcome::Accepted { .. } => IngestState::Done,
            IngestOutcome::Duplicate { .. } => IngestState::Dropped,
            IngestOutcome::Rejected { .. } => IngestState::Rejected,
        }
    }

    /// Short name of the outcome (`accepted`, `duplicate`, `rejected`).
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Accepted { .. } => "accepted",
            IngestOutcome::Duplicate { .. } => "duplicate",
            IngestOutcome::Rejected { .. } => "rejected",
        }
    }
}

/// Entry point for inbound events.
///
/// Stores are injected as trait objects; the orchestrator holds no state of
/// its own and is cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    dedup: Arc<dyn DedupStore>,
    status: Arc<dyn StatusStore>,
    subscriptions: Arc<dyn SubscriptionSource>,
    dispatcher: Dispatcher,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        dedup: Arc<dyn DedupStore>,
        status: Arc<dyn StatusStore>,
        subscriptions: Arc<dyn SubscriptionSource>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            dedup,
            status,
            subscriptions,
            dispatcher,
        }
    }

    /// Dispatcher used for fan-out; exposes delivery inspection.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Status store backing the query interface.
    pub fn status_store(&self) -> Arc<dyn StatusStore> {
        Arc::clone(&self.status)
    }

    /// Ingests a raw payload declared as `format_tag`.
    ///
    /// Malformed input (including an unknown format tag) is reported as
    /// [`IngestOutcome::Rejected`] without touching any store. The only error
    /// is [`RelayError::StoreUnavailable`].
    pub async fn ingest(&self, format_tag: &str, body: &[u8]) -> Result<IngestOutcome, RelayError> {
        trace!(state = ?IngestState::Received, format = format_tag, bytes = body.len());

        let event = match SourceFormat::from_str(format_tag).and_then(|format| normalize(format, body)) {
            Ok(event) => event,
            Err(RelayError::MalformedEvent { reason }) => {
                warn!(format = format_tag, %reason, "event rejected");
                return Ok(IngestOutcome::Rejected { reason });
            }
            Err(other) => return Err(other),
        };
        trace!(state = ?IngestState::Normalized);

        self.ingest_event(event).await
    }

    /// Ingests an already-normalized event.
    pub async fn ingest_event(&self, event: PipelineEvent) -> Result<IngestOutcome, RelayError> {
        let span = info_span!(
            "ingest",
            pipeline_id = %event.pipeline_id,
            run_id = %event.run_id,
            attempt = %event.attempt_sequence,
            stage = %event.stage,
        );
        self.process(event).instrument(span).await
    }

    async fn process(&self, event: PipelineEvent) -> Result<IngestOutcome, RelayError> {
        let key = event.key();

        let admission = self.dedup.admit(&key).await?;
        trace!(state = ?IngestState::DedupChecked, ?admission);

        if admission == Admission::Duplicate {
            let status = self.status.update(&event).await?;
            debug!(?status, "duplicate event dropped");
            trace!(state = ?IngestState::Dropped);
            return Ok(IngestOutcome::Duplicate { key, status });
        }

        match self.fan_out(&event).await {
            Ok(deliveries) => {
                info!(deliveries = deliveries.len(), "event accepted");
                trace!(state = ?IngestState::Done);
                Ok(IngestOutcome::Accepted { key, deliveries })
            }
            Err(err) => {
                self.roll_back(&key, &err).await;
                Err(err)
            }
        }
    }

    /// Updates status, matches subscriptions and starts dispatch.
    async fn fan_out(&self, event: &PipelineEvent) -> Result<Vec<AttemptKey>, RelayError> {
        let status = self.status.update(event).await?;
        trace!(state = ?IngestState::StatusUpdated, ?status);

        let subscriptions = self.subscriptions.active_subscriptions().await?;
        let matched = match_subscriptions(event, &subscriptions);
        trace!(state = ?IngestState::Matched, matched = matched.len());

        let deliveries = self.dispatcher.dispatch(event, matched);
        trace!(state = ?IngestState::Dispatched);
        Ok(deliveries)
    }

    async fn roll_back(&self, key: &EventKey, cause: &RelayError) {
        if !matches!(cause, RelayError::StoreUnavailable { .. }) {
            return;
        }
        warn!(error = %cause, "ingestion failed after admission; releasing dedup key");
        if let Err(err) = self.dedup.release(key).await {
            warn!(error = %err, "failed to release dedup key");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = [
            IngestState::Received,
            IngestState::Normalized,
            IngestState::Rejected,
            IngestState::DedupChecked,
            IngestState::Dropped,
            IngestState::StatusUpdated,
            IngestState::Matched,
            IngestState::Dispatched,
            IngestState::Done,
        ]
        .into_iter()
        .filter(|s| s.is_terminal())
        .collect();
        assert_eq!(
            terminal,
            vec![IngestState::Rejected, IngestState::Dropped, IngestState::Done]
        );
    }

    #[test]
    fn outcome_names_and_states() {
        let rejected = IngestOutcome::Rejected {
            reason: "missing run_id".into(),
        };
        assert_eq!(rejected.as_str(), "rejected");
        assert_eq!(rejected.state(), IngestState::Rejected);
    }
}
