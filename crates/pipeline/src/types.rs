//! Shared value types for the Pipeline Notify domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! meaningful values with invariants (stage sets are closed enums, patterns are
//! validated at construction, snapshots only move forward) and participate in
//! domain computations.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{AttemptSequence, PipelineId, RunId, SinkRef, SubscriberId};

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly; the underlying representation can change without affecting the
/// domain API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Creates a [`Timestamp`] from milliseconds since the Unix epoch.
    ///
    /// Returns `None` if the value is outside the representable range.
    pub fn from_epoch_millis(millis: i64) -> Option<Self> {
        DateTime::<Utc>::from_timestamp_millis(millis).map(Self)
    }

    /// Parses an RFC 3339 timestamp, normalising any offset to UTC.
    pub fn parse_rfc3339(value: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|dt| Self(dt.with_timezone(&Utc)))
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }

    /// Returns this timestamp shifted forward by `duration`, saturating at the
    /// maximum representable instant.
    pub fn saturating_add(self, duration: std::time::Duration) -> Self {
        TimeDelta::from_std(duration)
            .ok()
            .and_then(|delta| self.0.checked_add_signed(delta))
            .map(Self)
            .unwrap_or(Self(DateTime::<Utc>::MAX_UTC))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Lifecycle stage of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Accepted by the CI system but not yet executing.
    Queued,
    /// Executing.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with a failure.
    Failed,
    /// Stopped before completion (aborted, skipped, superseded).
    Cancelled,
}

impl Stage {
    /// Every stage, in lifecycle order.
    pub const ALL: [Stage; 5] = [
        Stage::Queued,
        Stage::Running,
        Stage::Succeeded,
        Stage::Failed,
        Stage::Cancelled,
    ];

    /// Returns the canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::Running => "running",
            Stage::Succeeded => "succeeded",
            Stage::Failed => "failed",
            Stage::Cancelled => "cancelled",
        }
    }

    /// Returns `true` once the run can no longer change stage.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Succeeded | Stage::Failed | Stage::Cancelled)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string does not name a [`Stage`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized stage '{0}'")]
pub struct UnknownStage(pub String);

impl FromStr for Stage {
    type Err = UnknownStage;

    /// Parses a stage name, ignoring ASCII case and surrounding whitespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Pipeline events
// ---------------------------------------------------------------------------

/// Arbitrary pipeline-supplied context (branch, commit, build URL, ...).
///
/// Kept sorted by key so that rendering and serialisation are deterministic.
pub type Metadata = BTreeMap<String, String>;

/// Canonical record of one status change of one pipeline run.
///
/// Produced by [`crate::normalizer::normalize`]; every downstream component
/// consumes only this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Pipeline the event belongs to.
    pub pipeline_id: PipelineId,
    /// Run (execution) the event belongs to.
    pub run_id: RunId,
    /// Stage the run entered.
    pub stage: Stage,
    /// When the upstream system observed the stage change.
    pub timestamp: Timestamp,
    /// Retry counter of the run.
    pub attempt_sequence: AttemptSequence,
    /// Pipeline-supplied context.
    #[serde(default)]
    pub metadata: Metadata,
}

impl PipelineEvent {
    /// Returns the idempotency key of this event.
    pub fn key(&self) -> EventKey {
        EventKey {
            pipeline_id: self.pipeline_id.clone(),
            run_id: self.run_id.clone(),
            attempt_sequence: self.attempt_sequence,
            stage: self.stage,
        }
    }

    /// Orders two events of the same pipeline by recency.
    ///
    /// Within one run the attempt sequence decides, then the timestamp. Across
    /// runs the later timestamp wins and the attempt sequence only breaks ties,
    /// because a fresh run restarts its attempt sequence.
    pub fn recency_cmp(&self, other: &PipelineEvent) -> Ordering {
        if self.run_id == other.run_id {
            self.attempt_sequence
                .cmp(&other.attempt_sequence)
                .then(self.timestamp.cmp(&other.timestamp))
        } else {
            self.timestamp
                .cmp(&other.timestamp)
                .then(self.attempt_sequence.cmp(&other.attempt_sequence))
        }
    }
}

/// The unique `(pipeline_id, run_id, attempt_sequence, stage)` tuple of a
/// [`PipelineEvent`].
///
/// Two deliveries carrying the same key describe the same logical event.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventKey {
    /// Pipeline component.
    pub pipeline_id: PipelineId,
    /// Run component.
    pub run_id: RunId,
    /// Retry component.
    pub attempt_sequence: AttemptSequence,
    /// Stage component.
    pub stage: Stage,
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}#{}:{}",
            self.pipeline_id, self.run_id, self.attempt_sequence, self.stage
        )
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Glob-style pattern over pipeline identifiers.
///
/// Accepted forms:
///
/// | Pattern | Matches |
/// |---------|---------|
/// | `*` | every pipeline |
/// | `fxos-pb` | exactly `fxos-pb` |
/// | `fxos-*` | identifiers starting with `fxos-` |
/// | `*-nightly` | identifiers ending with `-nightly` |
/// | `fxos-*-nightly` | both prefix and suffix |
/// | `*bazel*` | identifiers containing `bazel` |
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PipelinePattern {
    /// `*`
    Any,
    /// No wildcard.
    Exact(String),
    /// A single `*` with optional text either side.
    Affix {
        /// Text before the wildcard.
        prefix: String,
        /// Text after the wildcard.
        suffix: String,
    },
    /// `*text*`
    Contains(String),
}

/// Error returned for a pattern with unsupported wildcard placement.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid pipeline pattern '{0}': use at most one '*', or '*text*'")]
pub struct InvalidPattern(pub String);

impl PipelinePattern {
    /// Parses a pattern string.
    pub fn parse(pattern: &str) -> Result<Self, InvalidPattern> {
        let stars = pattern.matches('*').count();
        match stars {
            0 if pattern.is_empty() => Err(InvalidPattern(pattern.to_string())),
            0 => Ok(Self::Exact(pattern.to_string())),
            1 if pattern == "*" => Ok(Self::Any),
            1 => {
                let (prefix, suffix) = pattern
                    .split_once('*')
                    .ok_or_else(|| InvalidPattern(pattern.to_string()))?;
                Ok(Self::Affix {
                    prefix: prefix.to_string(),
                    suffix: suffix.to_string(),
                })
            }
            2 if pattern.len() > 2 && pattern.starts_with('*') && pattern.ends_with('*') => {
                Ok(Self::Contains(pattern[1..pattern.len() - 1].to_string()))
            }
            _ => Err(InvalidPattern(pattern.to_string())),
        }
    }

    /// Returns `true` if `pipeline_id` satisfies this pattern.
    pub fn matches(&self, pipeline_id: &PipelineId) -> bool {
        let id = pipeline_id.as_str();
        match self {
            Self::Any => true,
            Self::Exact(exact) => id == exact,
            Self::Affix { prefix, suffix } => {
                id.len() >= prefix.len() + suffix.len()
                    && id.starts_with(prefix.as_str())
                    && id.ends_with(suffix.as_str())
            }
            Self::Contains(needle) => id.contains(needle.as_str()),
        }
    }
}

impl std::fmt::Display for PipelinePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Exact(exact) => f.write_str(exact),
            Self::Affix { prefix, suffix } => write!(f, "{prefix}*{suffix}"),
            Self::Contains(needle) => write!(f, "*{needle}*"),
        }
    }
}

impl TryFrom<String> for PipelinePattern {
    type Error = InvalidPattern;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PipelinePattern> for String {
    fn from(pattern: PipelinePattern) -> String {
        pattern.to_string()
    }
}

/// Predicate deciding whether an event is of interest to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// Pipelines of interest.
    pub pipeline: PipelinePattern,
    /// Stages of interest. An empty set matches nothing.
    pub stages: BTreeSet<Stage>,
}

impl SubscriptionFilter {
    /// Returns `true` if `event` passes both the pipeline and the stage test.
    pub fn matches(&self, event: &PipelineEvent) -> bool {
        self.stages.contains(&event.stage) && self.pipeline.matches(&event.pipeline_id)
    }
}

/// A registration binding a subscriber to a sink for a class of events.
///
/// Created and updated by the admin interface; read-only at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Who is notified.
    pub subscriber_id: SubscriberId,
    /// Which events are of interest.
    pub filter: SubscriptionFilter,
    /// Where notifications are delivered.
    pub sink_ref: SinkRef,
    /// Inactive subscriptions never match.
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Delivery tracking
// ---------------------------------------------------------------------------

/// Lifecycle of a [`DeliveryAttempt`].
///
/// `Pending → Failed → Pending → ... → Delivered | Abandoned`. `Failed` marks
/// an attempt that errored and is waiting in the retry queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created or about to be attempted.
    Pending,
    /// Last attempt failed; a retry is scheduled.
    Failed,
    /// The sink accepted the notification.
    Delivered,
    /// Retries were exhausted or the sink reported a permanent failure.
    Abandoned,
}

impl DeliveryStatus {
    /// Returns `true` for `Delivered` and `Abandoned`.
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Abandoned)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

/// Identifies one event/subscriber delivery.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttemptKey {
    /// The event being delivered.
    pub event_key: EventKey,
    /// The subscriber it is delivered to.
    pub subscriber_id: SubscriberId,
}

impl std::fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.event_key, self.subscriber_id)
    }
}

/// Delivery record of one event to one subscriber.
///
/// Mutated only by the dispatcher; callers receive snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// The event being delivered.
    pub event_key: EventKey,
    /// The receiving subscriber.
    pub subscriber_id: SubscriberId,
    /// Sink the subscriber is bound to.
    pub sink_ref: SinkRef,
    /// Number of sink invocations so far.
    pub attempt_count: u32,
    /// Reason reported by the most recent failed invocation.
    pub last_error: Option<String>,
    /// Current status.
    pub status: DeliveryStatus,
    /// When the record was created.
    pub created_at: Timestamp,
    /// When the record last changed.
    pub updated_at: Timestamp,
}

impl DeliveryAttempt {
    /// Creates a `Pending` record with no attempts.
    pub fn pending(event_key: EventKey, subscriber_id: SubscriberId, sink_ref: SinkRef) -> Self {
        let now = Timestamp::now();
        Self {
            event_key,
            subscriber_id,
            sink_ref,
            attempt_count: 0,
            last_error: None,
            status: DeliveryStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the key identifying this record.
    pub fn key(&self) -> AttemptKey {
        AttemptKey {
            event_key: self.event_key.clone(),
            subscriber_id: self.subscriber_id.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Status snapshots
// ---------------------------------------------------------------------------

/// Latest known state of one pipeline, as served to the query interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatusSnapshot {
    /// Pipeline the snapshot describes.
    pub pipeline_id: PipelineId,
    /// Most recent event by [`PipelineEvent::recency_cmp`].
    pub event: PipelineEvent,
    /// When the snapshot was last written.
    pub recorded_at: Timestamp,
}

impl PipelineStatusSnapshot {
    /// Creates a snapshot holding `event`.
    pub fn of(event: PipelineEvent) -> Self {
        Self {
            pipeline_id: event.pipeline_id.clone(),
            event,
            recorded_at: Timestamp::now(),
        }
    }

    /// Returns `true` if `candidate` is not older than the stored event and
    /// should therefore replace it.
    pub fn accepts(&self, candidate: &PipelineEvent) -> bool {
        candidate.recency_cmp(&self.event) != Ordering::Less
    }
}
