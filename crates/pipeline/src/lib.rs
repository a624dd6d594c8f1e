//! Core domain for Pipeline Notify.
//!
//! This crate contains every domain concept, newtype identifier, shared value
//! type, and error type used by the relay, together with the two pure pipeline
//! stages (normalization and subscription matching) and the port traits that
//! stores and sinks implement.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; the `relay`, `sinks`, and `listener` crates
//! define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`PipelineId`, `RunId`, `SubscriberId`, ...) |
//! | [`types`] | `PipelineEvent`, `Subscription`, `DeliveryAttempt`, `PipelineStatusSnapshot` |
//! | [`errors`] | `RelayError`, `SinkError`, `RetryPolicy` |
//! | [`normalizer`] | Inbound payload → `PipelineEvent` |
//! | [`matcher`] | `PipelineEvent` × subscriptions → ordered matches |
//! | [`ports`] | `Sink`, `DedupStore`, `StatusStore`, `SubscriptionSource` |

pub mod errors;
pub mod identifiers;
pub mod matcher;
pub mod normalizer;
pub mod ports;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use errors::{RelayError, RetryPolicy, SinkError, StoreKind};
pub use identifiers::{AttemptSequence, PipelineId, RunId, SinkRef, SubscriberId};
pub use matcher::match_subscriptions;
pub use normalizer::{normalize, normalize_value, SourceFormat};
pub use ports::{
    Admission, DedupStore, FailurePage, Sink, SinkRegistry, StatusStore, StatusUpdate,
    SubscriptionSource,
};
pub use types::{
    AttemptKey, DeliveryAttempt, DeliveryStatus, EventKey, InvalidPattern, Metadata,
    PipelineEvent, PipelinePattern, PipelineStatusSnapshot, Stage, Subscription,
    SubscriptionFilter, Timestamp, UnknownStage,
};
