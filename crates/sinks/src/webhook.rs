//! HTTP webhook sink.
//!
//! POSTs a JSON [`Notification`] to a fixed URL. Response handling:
//!
//! | Response | Result |
//! |----------|--------|
//! | 2xx | delivered |
//! | 408, 5xx, timeout, connection error | transient |
//! | 429 | transient, `Retry-After` seconds honoured as a floor |
//! | other 4xx | permanent |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use tracing::debug;
use uuid::Uuid;

use pipeline::{PipelineEvent, Sink, SinkError, Subscription};

use crate::message::Notification;
use crate::SinkBuildError;

/// Header carrying the per-invocation delivery id.
pub const DELIVERY_ID_HEADER: &str = "x-delivery-id";

/// Sink posting notifications over HTTP.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: Url,
}

impl WebhookSink {
    /// Builds the sink, validating the URL and headers up front.
    pub fn new(
        name: &str,
        url: &str,
        timeout: Duration,
        headers: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, SinkBuildError> {
        let url = Url::parse(url).map_err(|e| SinkBuildError::InvalidUrl {
            sink: name.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SinkBuildError::InvalidUrl {
                sink: name.to_string(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        let mut default_headers = HeaderMap::new();
        for (key, value) in headers {
            let invalid = || SinkBuildError::InvalidHeader {
                sink: name.to_string(),
                header: key.clone(),
            };
            let header_name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| invalid())?;
            let header_value = HeaderValue::from_str(&value).map_err(|_| invalid())?;
            default_headers.insert(header_name, header_value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(default_headers)
            .build()
            .map_err(|e| SinkBuildError::Client {
                sink: name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self { client, url })
    }

    /// Target URL.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, event: &PipelineEvent, subscription: &Subscription) -> Result<(), SinkError> {
        let delivery_id = Uuid::new_v4().to_string();
        let body = Notification::new(delivery_id.clone(), event, subscription);

        let response = self
            .client
            .post(self.url.clone())
            .header(DELIVERY_ID_HEADER, &delivery_id)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        debug!(%delivery_id, status = status.as_u16(), "webhook responded");
        if status.is_success() {
            return Ok(());
        }
        Err(status_error(status, response.headers()))
    }
}

fn request_error(err: reqwest::Error) -> SinkError {
    if err.is_builder() {
        SinkError::permanent(format!("invalid webhook request: {err}"))
    } else if err.is_timeout() {
        SinkError::transient("webhook request timed out")
    } else {
        SinkError::transient(format!("webhook request failed: {err}"))
    }
}

fn status_error(status: StatusCode, headers: &HeaderMap) -> SinkError {
    let reason = format!("webhook returned {status}");
    if status == StatusCode::TOO_MANY_REQUESTS {
        return match retry_after(headers) {
            Some(after) => SinkError::retry_after(reason, after),
            None => SinkError::transient(reason),
        };
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        SinkError::transient(reason)
    } else {
        SinkError::permanent(reason)
    }
}

/// Parses `Retry-After` in its delay-seconds form.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(seconds))
}
