//! Plain-text renderings of tool results for conversational clients.

use std::fmt::Write;

use pipeline::{DeliveryAttempt, FailurePage, PipelineId, PipelineStatusSnapshot};

pub(crate) fn status(snapshot: &PipelineStatusSnapshot) -> String {
    let event = &snapshot.event;
    let mut out = format!(
        "{}: {} (run {}, attempt {}) at {}",
        snapshot.pipeline_id, event.stage, event.run_id, event.attempt_sequence, event.timestamp
    );
    for (key, value) in &event.metadata {
        let _ = write!(out, "\n  {key}: {value}");
    }
    out
}

pub(crate) fn failures(page: &FailurePage) -> String {
    if page.items.is_empty() {
        return "No failing pipelines.".to_string();
    }
    let mut out = format!("{} failing pipeline(s):", page.items.len());
    for snapshot in &page.items {
        let event = &snapshot.event;
        let _ = write!(
            out,
            "\n- {} run {} (attempt {}) failed at {}",
            snapshot.pipeline_id, event.run_id, event.attempt_sequence, event.timestamp
        );
    }
    if let Some(cursor) = &page.next_cursor {
        let _ = write!(out, "\nMore results available; continue with cursor \"{cursor}\".");
    }
    out
}

pub(crate) fn attempts(pipeline_id: &PipelineId, attempts: &[DeliveryAttempt]) -> String {
    if attempts.is_empty() {
        return format!("No deliveries recorded for {pipeline_id}.");
    }
    let mut out = format!("{} delivery attempt(s) for {pipeline_id}:", attempts.len());
    for attempt in attempts {
        let _ = write!(
            out,
            "\n- {} -> {} via {}: {} after {} attempt(s)",
            attempt.event_key, attempt.subscriber_id, attempt.sink_ref, attempt.status, attempt.attempt_count
        );
        if let Some(error) = &attempt.last_error {
            let _ = write!(out, " (last error: {error})");
        }
    }
    out
}
