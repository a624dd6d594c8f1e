//! Ingestion and delivery engine for Pipeline Notify.
//!
//! Wires the pure stages from the `pipeline` crate to stateful components:
//! the dedup gate, the status cache, the subscription registry and the
//! delivery dispatcher with its retry scheduler.
//!
//! ## Architectural Layer
//!
//! **Orchestration.** Everything here is process-local and in-memory. Stores
//! are reached through the port traits, so a persistent backend can replace
//! any of them without touching the [`Orchestrator`].
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`dedup`] | TTL idempotency store with background sweeper |
//! | [`status`] | Latest snapshot per pipeline, failure paging |
//! | [`subscriptions`] | Admin-facing subscription registry |
//! | [`dispatcher`] | Per-subscriber delivery, retries, outcome metrics |
//! | [`orchestrator`] | Ingestion state machine |

pub mod dedup;
pub mod dispatcher;
pub mod orchestrator;
pub mod status;
pub mod subscriptions;

pub use dedup::{InMemoryDedupStore, DEFAULT_RETENTION};
pub use dispatcher::{
    DeliveryOutcome, DeliveryPolicy, DispatchMetrics, Dispatcher, MetricsSnapshot, MAX_RETRY_DELAY,
};
pub use orchestrator::{IngestOutcome, IngestState, Orchestrator};
pub use status::InMemoryStatusCache;
pub use subscriptions::SubscriptionRegistry;
