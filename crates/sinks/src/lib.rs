//! Delivery sinks for Pipeline Notify.
//!
//! Sinks are described in configuration as tagged variants and resolved into
//! concrete [`Sink`] implementations once, at load time. The dispatcher only
//! ever sees the resulting [`SinkRegistry`].
//!
//! ```toml
//! [sinks.release-chat]
//! type = "webhook"
//! url = "https://chat.example.com/hooks/abc"
//! timeout_ms = 5000
//! headers = { Authorization = "Bearer token" }
//!
//! [sinks.audit]
//! type = "log"
//! level = "warn"
//! ```
//!
//! ## Architectural Layer
//!
//! **Infrastructure adapter.** Implements the `pipeline::Sink` port.

pub mod log;
pub mod message;
pub mod webhook;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use pipeline::{Sink, SinkRef, SinkRegistry};

pub use crate::log::{LogLevel, LogSink};
pub use crate::message::{render_markdown, Notification};
pub use crate::webhook::WebhookSink;

fn default_timeout_ms() -> u64 {
    5_000
}

/// Configuration of one named sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    /// HTTP POST of a JSON notification.
    Webhook {
        url: String,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Tracing event at the given level.
    Log {
        #[serde(default)]
        level: LogLevel,
    },
}

impl SinkConfig {
    /// Transport name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            SinkConfig::Webhook { .. } => "webhook",
            SinkConfig::Log { .. } => "log",
        }
    }
}

/// Errors raised while resolving sink configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkBuildError {
    #[error("invalid sink name '{0}'")]
    InvalidName(String),

    #[error("sink '{sink}': invalid url: {reason}")]
    InvalidUrl { sink: String, reason: String },

    #[error("sink '{sink}': invalid header '{header}'")]
    InvalidHeader { sink: String, header: String },

    #[error("sink '{sink}': timeout must be greater than zero")]
    ZeroTimeout { sink: String },

    #[error("sink '{sink}': failed to build HTTP client: {reason}")]
    Client { sink: String, reason: String },
}

/// Resolves one sink configuration.
pub fn build_sink(name: &str, config: &SinkConfig) -> Result<Arc<dyn Sink>, SinkBuildError> {
    match config {
        SinkConfig::Webhook {
            url,
            timeout_ms,
            headers,
        } => {
            if *timeout_ms == 0 {
                return Err(SinkBuildError::ZeroTimeout {
                    sink: name.to_string(),
                });
            }
            let sink = WebhookSink::new(
                name,
                url,
                Duration::from_millis(*timeout_ms),
                headers.iter().map(|(k, v)| (k.clone(), v.clone())),
            )?;
            Ok(Arc::new(sink))
        }
        SinkConfig::Log { level } => Ok(Arc::new(LogSink::new(*level))),
    }
}

/// Resolves every configured sink into a registry.
pub fn build_registry(configs: &BTreeMap<String, SinkConfig>) -> Result<SinkRegistry, SinkBuildError> {
    let mut registry = SinkRegistry::new();
    for (name, config) in configs {
        let sink_ref = SinkRef::new(name.as_str()).ok_or_else(|| SinkBuildError::InvalidName(name.clone()))?;
        registry.insert(sink_ref, build_sink(name, config)?);
        tracing::debug!(sink = %name, kind = config.kind(), "sink configured");
    }
    Ok(registry)
}
