//! Ingestion adapter for Pipeline Notify.
//!
//! Sits between whatever HTTP server hosts the webhook endpoint and the
//! [`Orchestrator`]. For each request it:
//!
//! 1. verifies the HMAC signature when a secret is configured,
//! 2. resolves the source format from the request headers,
//! 3. ingests the body and maps the outcome to a status code.
//!
//! | Outcome | Status |
//! |---------|--------|
//! | accepted | 202 |
//! | duplicate | 200 |
//! | rejected (malformed) | 400 |
//! | missing or invalid signature | 401 |
//! | store unavailable | 503 (sender should redeliver) |
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** The HTTP server itself is out of scope; hosts pass
//! headers and the raw body in and write the returned [`IngestResponse`] out.

pub mod signature;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use pipeline::{RelayError, SourceFormat};
use relay::{IngestOutcome, Orchestrator};

pub use signature::WebhookSecret;

/// Explicit source-format header.
pub const SOURCE_HEADER: &str = "x-pipeline-source";
/// Event-type header sent by GitHub.
pub const GITHUB_EVENT_HEADER: &str = "x-github-event";
/// Signature headers, checked in order.
pub const SIGNATURE_HEADERS: [&str; 2] = ["x-pipeline-signature-256", "x-hub-signature-256"];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Reasons a request was not ingested.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ListenerError {
    #[error("request signature is missing")]
    MissingSignature,

    #[error("request signature does not match the payload")]
    InvalidSignature,

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl ListenerError {
    /// HTTP status for the error.
    pub fn status_code(&self) -> u16 {
        match self {
            ListenerError::MissingSignature | ListenerError::InvalidSignature => 401,
            ListenerError::Relay(RelayError::StoreUnavailable { .. }) => 503,
            ListenerError::Relay(RelayError::MalformedEvent { .. }) => 400,
            ListenerError::Relay(RelayError::ConfigurationError { .. }) => 500,
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// Case-insensitive request header set.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push((name.into(), value.into()));
        self
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Response body written back to the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseBody {
    pub result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deliveries: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Status code plus body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestResponse {
    pub status: u16,
    pub body: ResponseBody,
}

impl From<&IngestOutcome> for IngestResponse {
    fn from(outcome: &IngestOutcome) -> Self {
        match outcome {
            IngestOutcome::Accepted { key, deliveries } => Self {
                status: 202,
                body: ResponseBody {
                    result: outcome.as_str(),
                    event_key: Some(key.to_string()),
                    deliveries: Some(deliveries.len()),
                    error: None,
                },
            },
            IngestOutcome::Duplicate { key, .. } => Self {
                status: 200,
                body: ResponseBody {
                    result: outcome.as_str(),
                    event_key: Some(key.to_string()),
                    deliveries: None,
                    error: None,
                },
            },
            IngestOutcome::Rejected { reason } => Self {
                status: 400,
                body: ResponseBody {
                    result: outcome.as_str(),
                    event_key: None,
                    deliveries: None,
                    error: Some(reason.clone()),
                },
            },
        }
    }
}

impl From<&ListenerError> for IngestResponse {
    fn from(err: &ListenerError) -> Self {
        let result = match err {
            ListenerError::MissingSignature | ListenerError::InvalidSignature => "unauthorized",
            ListenerError::Relay(RelayError::StoreUnavailable { .. }) => "unavailable",
            ListenerError::Relay(_) => "error",
        };
        Self {
            status: err.status_code(),
            body: ResponseBody {
                result,
                event_key: None,
                deliveries: None,
                error: Some(err.to_string()),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// Resolves the declared source format of a request.
///
/// `X-Pipeline-Source` wins; otherwise a GitHub `workflow_run` event is
/// `github_actions`; anything else is `generic`. The explicit header is
/// returned verbatim so that an unknown value is rejected by the normalizer.
pub fn resolve_format(headers: &Headers) -> String {
    if let Some(explicit) = headers.get(SOURCE_HEADER) {
        return explicit.trim().to_string();
    }
    match headers.get(GITHUB_EVENT_HEADER) {
        Some(event) if event.trim().eq_ignore_ascii_case("workflow_run") => {
            SourceFormat::GitHubActions.as_str().to_string()
        }
        _ => SourceFormat::Generic.as_str().to_string(),
    }
}

/// Webhook endpoint logic.
#[derive(Debug, Clone)]
pub struct WebhookReceiver {
    orchestrator: Orchestrator,
    secret: Option<WebhookSecret>,
}

impl WebhookReceiver {
    /// With `secret = None` every request is accepted unsigned.
    pub fn new(orchestrator: Orchestrator, secret: Option<WebhookSecret>) -> Self {
        Self { orchestrator, secret }
    }

    /// Verifies and ingests one request.
    pub async fn receive(&self, headers: &Headers, body: &[u8]) -> Result<IngestOutcome, ListenerError> {
        self.authenticate(headers, body)?;
        let format = resolve_format(headers);
        Ok(self.orchestrator.ingest(&format, body).await?)
    }

    /// [`WebhookReceiver::receive`] mapped to a status code and body.
    pub async fn handle(&self, headers: &Headers, body: &[u8]) -> IngestResponse {
        match self.receive(headers, body).await {
            Ok(outcome) => IngestResponse::from(&outcome),
            Err(err) => {
                warn!(error = %err, status = err.status_code(), "webhook not ingested");
                IngestResponse::from(&err)
            }
        }
    }

    fn authenticate(&self, headers: &Headers, body: &[u8]) -> Result<(), ListenerError> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };
        let header = SIGNATURE_HEADERS
            .iter()
            .find_map(|name| headers.get(name))
            .ok_or(ListenerError::MissingSignature)?;
        if secret.verify(body, header) {
            Ok(())
        } else {
            info!("rejecting request with invalid signature");
            Err(ListenerError::InvalidSignature)
        }
    }
}

#[cfg(test)]
mod tests;
