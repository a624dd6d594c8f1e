//! Sink that writes notifications to the tracing log.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use pipeline::{PipelineEvent, Sink, SinkError, Subscription};

use crate::message::render_markdown;

/// Level at which [`LogSink`] emits notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warn,
    Error,
}

/// Emits one tracing event per delivery. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink {
    level: LogLevel,
}

impl LogSink {
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }
}

#[async_trait]
impl Sink for LogSink {
    fn kind(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, event: &PipelineEvent, subscription: &Subscription) -> Result<(), SinkError> {
        let text = render_markdown(event);
        let subscriber_id = subscription.subscriber_id.as_str();
        match self.level {
            LogLevel::Info => info!(subscriber_id, notification = %text, "pipeline notification"),
            LogLevel::Warn => warn!(subscriber_id, notification = %text, "pipeline notification"),
            LogLevel::Error => error!(subscriber_id, notification = %text, "pipeline notification"),
        }
        Ok(())
    }
}
