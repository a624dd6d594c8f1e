//! Subscription Matcher: selects the subscriptions that should receive an event.
//!
//! Output is ordered by `subscriber_id` ascending (then `sink_ref`) so that
//! fan-out is deterministic and reproducible for identical inputs regardless of
//! the order in which the registry returns subscriptions.

use crate::{PipelineEvent, Subscription};

/// Returns the active subscriptions whose filter accepts `event`.
///
/// An empty result is not an error.
pub fn match_subscriptions<'a, I>(event: &PipelineEvent, subscriptions: I) -> Vec<Subscription>
where
    I: IntoIterator<Item = &'a Subscription>,
{
    let mut matched: Vec<Subscription> = subscriptions
        .into_iter()
        .filter(|s| s.active && s.filter.matches(event))
        .cloned()
        .collect();
    matched.sort_by(|a, b| {
        a.subscriber_id
            .cmp(&b.subscriber_id)
            .then_with(|| a.sink_ref.cmp(&b.sink_ref))
    });
    matched
}
