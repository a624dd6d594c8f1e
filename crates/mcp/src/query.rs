//! Read-only query interface over the status cache and delivery ledger.

use std::sync::Arc;

use tracing::debug;

use pipeline::{DeliveryAttempt, FailurePage, PipelineId, PipelineStatusSnapshot, StatusStore, Timestamp};
use relay::Dispatcher;

use crate::ToolError;

/// Page size used when the caller gives none.
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// Largest page a caller may request.
pub const MAX_PAGE_LIMIT: usize = 500;

/// Answers status questions for the tool surface.
#[derive(Clone)]
pub struct QueryService {
    status: Arc<dyn StatusStore>,
    dispatcher: Dispatcher,
}

impl std::fmt::Debug for QueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryService").finish_non_exhaustive()
    }
}

impl QueryService {
    pub fn new(status: Arc<dyn StatusStore>, dispatcher: Dispatcher) -> Self {
        Self { status, dispatcher }
    }

    /// Latest snapshot of one pipeline.
    pub async fn get_pipeline_status(
        &self,
        pipeline_id: &PipelineId,
    ) -> Result<PipelineStatusSnapshot, ToolError> {
        self.status
            .get(pipeline_id)
            .await?
            .ok_or_else(|| ToolError::NotFound {
                what: format!("pipeline '{pipeline_id}'"),
            })
    }

    /// One page of pipelines whose latest stage is failed, at or after `since`.
    ///
    /// Pages are ordered by pipeline id. Pass the returned `next_cursor` back
    /// as `cursor` to continue; any earlier cursor restarts from that point.
    pub async fn list_recent_failures(
        &self,
        since: Timestamp,
        cursor: Option<&PipelineId>,
        limit: Option<usize>,
    ) -> Result<FailurePage, ToolError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
        let page = self.status.failures_since(since, cursor, limit).await?;
        debug!(
            %since,
            returned = page.items.len(),
            more = page.next_cursor.is_some(),
            "listed recent failures"
        );
        Ok(page)
    }

    /// Delivery attempts for every event of one pipeline.
    pub fn list_delivery_attempts(&self, pipeline_id: &PipelineId) -> Vec<DeliveryAttempt> {
        self.dispatcher.attempts_for(pipeline_id)
    }
}
