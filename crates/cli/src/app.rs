//! Composition root: builds the relay from resolved configuration.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use listener::WebhookReceiver;
use mcp::{QueryService, ToolRegistry};
use relay::{Dispatcher, InMemoryDedupStore, InMemoryStatusCache, Orchestrator, SubscriptionRegistry};

use crate::config::Resolved;

/// Fully wired in-process relay.
pub struct App {
    pub receiver: WebhookReceiver,
    pub tools: ToolRegistry,
    pub dispatcher: Dispatcher,
    shutdown: CancellationToken,
    sweepers: Vec<JoinHandle<()>>,
}

impl App {
    /// Wires stores, dispatcher, orchestrator and the read-side tools.
    ///
    /// Spawns the dedup sweeper and the delivery-ledger pruner, so it must
    /// run inside a Tokio runtime.
    pub fn build(resolved: Resolved) -> Self {
        let Resolved {
            policy,
            retention,
            ledger_retention,
            sweep_interval,
            sinks,
            subscriptions,
            webhook_secret,
        } = resolved;

        let dedup = Arc::new(InMemoryDedupStore::new(retention));
        let status = Arc::new(InMemoryStatusCache::new());
        let registry = Arc::new(SubscriptionRegistry::with_subscriptions(subscriptions));

        info!(
            sinks = sinks.len(),
            max_attempts = policy.max_attempts,
            signed = webhook_secret.is_some(),
            "relay configured"
        );

        let dispatcher = Dispatcher::new(sinks, policy);
        let shutdown = CancellationToken::new();
        let sweepers = vec![
            dedup.clone().spawn_sweeper(sweep_interval, shutdown.clone()),
            dispatcher.spawn_pruner(ledger_retention, sweep_interval, shutdown.clone()),
        ];

        let orchestrator = Orchestrator::new(dedup, status.clone(), registry, dispatcher.clone());
        let receiver = WebhookReceiver::new(orchestrator, webhook_secret);
        let tools = ToolRegistry::new(QueryService::new(status, dispatcher.clone()));

        Self {
            receiver,
            tools,
            dispatcher,
            shutdown,
            sweepers,
        }
    }

    /// Stops background tasks. Pending retries are dropped with the runtime.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        // Sweepers exit on cancellation; a join error only means one panicked.
        for sweeper in self.sweepers {
            if let Err(err) = sweeper.await {
                tracing::warn!(error = %err, "sweeper terminated abnormally");
            }
        }
    }
}
