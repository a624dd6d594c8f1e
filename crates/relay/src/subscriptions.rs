//! In-memory subscription registry.
//!
//! Serves the admin contract (create, update, remove, list) and the core's
//! read path. Subscriptions are keyed by [`SubscriberId`]: one subscription
//! per subscriber, so a delivery is identified by event and subscriber alone.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tracing::info;

use pipeline::{RelayError, StoreKind, SubscriberId, Subscription, SubscriptionSource};

/// Converts a lock poison error to a store error.
fn poison_err<T>(_: PoisonError<T>) -> RelayError {
    RelayError::store_unavailable(StoreKind::Subscriptions, "subscription registry lock poisoned")
}

/// Thread-safe subscription registry.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: RwLock<BTreeMap<SubscriberId, Subscription>>,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry seeded with `subscriptions`; later entries replace
    /// earlier ones with the same subscriber id.
    pub fn with_subscriptions(subscriptions: impl IntoIterator<Item = Subscription>) -> Self {
        let map = subscriptions
            .into_iter()
            .map(|s| (s.subscriber_id.clone(), s))
            .collect();
        Self {
            subscriptions: RwLock::new(map),
        }
    }

    /// Creates or replaces a subscription. Returns the previous one.
    pub fn upsert(&self, subscription: Subscription) -> Result<Option<Subscription>, RelayError> {
        let mut guard = self.subscriptions.write().map_err(poison_err)?;
        info!(
            subscriber_id = %subscription.subscriber_id,
            pipeline = %subscription.filter.pipeline,
            sink = %subscription.sink_ref,
            active = subscription.active,
            "subscription upserted"
        );
        Ok(guard.insert(subscription.subscriber_id.clone(), subscription))
    }

    /// Removes a subscription. Returns it if it existed.
    pub fn remove(&self, subscriber_id: &SubscriberId) -> Result<Option<Subscription>, RelayError> {
        let mut guard = self.subscriptions.write().map_err(poison_err)?;
        let removed = guard.remove(subscriber_id);
        if removed.is_some() {
            info!(%subscriber_id, "subscription removed");
        }
        Ok(removed)
    }

    /// Enables or disables a subscription. Returns `false` if it does not exist.
    pub fn set_active(&self, subscriber_id: &SubscriberId, active: bool) -> Result<bool, RelayError> {
        let mut guard = self.subscriptions.write().map_err(poison_err)?;
        match guard.get_mut(subscriber_id) {
            Some(subscription) => {
                subscription.active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Returns one subscription.
    pub fn get(&self, subscriber_id: &SubscriberId) -> Result<Option<Subscription>, RelayError> {
        let guard = self.subscriptions.read().map_err(poison_err)?;
        Ok(guard.get(subscriber_id).cloned())
    }

    /// Returns every subscription, active or not, ordered by subscriber id.
    pub fn list(&self) -> Result<Vec<Subscription>, RelayError> {
        let guard = self.subscriptions.read().map_err(poison_err)?;
        Ok(guard.values().cloned().collect())
    }
}

#[async_trait]
impl SubscriptionSource for SubscriptionRegistry {
    async fn active_subscriptions(&self) -> Result<Vec<Subscription>, RelayError> {
        let guard = self.subscriptions.read().map_err(poison_err)?;
        Ok(guard.values().filter(|s| s.active).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use pipeline::{PipelinePattern, SinkRef, Stage, SubscriptionFilter};

    use super::*;

    fn subscription(id: &str, active: bool) -> Subscription {
        Subscription {
            subscriber_id: SubscriberId::new(id).unwrap(),
            filter: SubscriptionFilter {
                pipeline: PipelinePattern::Any,
                stages: [Stage::Failed].into_iter().collect(),
            },
            sink_ref: SinkRef::new("log").unwrap(),
            active,
        }
    }

    #[tokio::test]
    async fn only_active_subscriptions_are_served_to_the_core() {
        let registry =
            SubscriptionRegistry::with_subscriptions([subscription("a", true), subscription("b", false)]);

        let active = registry.active_subscriptions().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].subscriber_id.as_str(), "a");
        assert_eq!(registry.list().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn admin_operations() {
        let registry = SubscriptionRegistry::new();
        let id = SubscriberId::new("ops").unwrap();

        assert!(registry.upsert(subscription("ops", true)).unwrap().is_none());
        assert!(registry.upsert(subscription("ops", true)).unwrap().is_some());

        assert!(registry.set_active(&id, false).unwrap());
        assert!(registry.active_subscriptions().await.unwrap().is_empty());
        assert!(!registry.get(&id).unwrap().unwrap().active);

        assert!(registry.remove(&id).unwrap().is_some());
        assert!(registry.get(&id).unwrap().is_none());
        assert!(!registry.set_active(&id, true).unwrap());
    }
}
