//! Notification rendering shared by all sinks.

use serde::Serialize;

use pipeline::{PipelineEvent, Stage, Subscription};

/// JSON body posted by the webhook sink.
#[derive(Debug, Clone, Serialize)]
pub struct Notification<'a> {
    /// Unique per sink invocation; receivers may use it to drop repeats.
    pub delivery_id: String,
    /// Stable across retries of the same delivery.
    pub idempotency_key: String,
    pub subscriber_id: &'a str,
    /// Markdown summary for chat-style receivers.
    pub text: String,
    pub event: &'a PipelineEvent,
}

impl<'a> Notification<'a> {
    pub fn new(delivery_id: String, event: &'a PipelineEvent, subscription: &'a Subscription) -> Self {
        Self {
            delivery_id,
            idempotency_key: format!("{}:{}", event.key(), subscription.subscriber_id),
            subscriber_id: subscription.subscriber_id.as_str(),
            text: render_markdown(event),
            event,
        }
    }
}

fn stage_marker(stage: Stage) -> &'static str {
    match stage {
        Stage::Queued => "⏳",
        Stage::Running => "🔄",
        Stage::Succeeded => "✅",
        Stage::Failed => "❌",
        Stage::Cancelled => "⛔",
    }
}

/// One-line markdown summary, followed by a link and branch when known.
pub fn render_markdown(event: &PipelineEvent) -> String {
    let mut text = format!(
        "{} **{}** run `{}` (attempt {}) {} at {}",
        stage_marker(event.stage),
        event.pipeline_id,
        event.run_id,
        event.attempt_sequence,
        event.stage,
        event.timestamp,
    );
    if let Some(branch) = event.metadata.get("branch") {
        text.push_str(&format!("\nBranch: `{branch}`"));
    }
    if let Some(url) = event.metadata.get("url") {
        text.push_str(&format!("\n[View run]({url})"));
    }
    text
}
