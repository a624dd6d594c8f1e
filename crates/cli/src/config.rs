//! Configuration loading and validation.
//!
//! Loading flow:
//! 1. Start with compiled [`Config::default()`]
//! 2. Merge `.pipeline-notify/config.toml` (or the path given on the command line)
//! 3. Merge `PIPELINE_NOTIFY_*` environment variables; `__` separates nested
//!    keys, e.g. `PIPELINE_NOTIFY_DELIVERY__MAX_ATTEMPTS=3`
//!
//! [`Config::resolve`] then validates cross-references and turns the raw
//! values into runtime types. Sinks are built here, once.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use listener::WebhookSecret;
use pipeline::{
    PipelinePattern, RelayError, SinkRef, SinkRegistry, Stage, SubscriberId, Subscription,
    SubscriptionFilter,
};
use relay::{DeliveryPolicy, DEFAULT_RETENTION, MAX_RETRY_DELAY};
use sinks::SinkConfig;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".pipeline-notify/config.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "PIPELINE_NOTIFY_";

// ---------------------------------------------------------------------------
// Raw configuration
// ---------------------------------------------------------------------------

/// Complete configuration as loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub ingest: IngestConfig,
    pub dedup: DedupConfig,
    pub delivery: DeliveryConfig,
    pub sinks: BTreeMap<String, SinkConfig>,
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    /// OTLP gRPC endpoint; tracing export is off when unset.
    pub otlp_endpoint: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
            otlp_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Shared HMAC secret; signature checks are off when unset.
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            retention_secs: DEFAULT_RETENTION.as_secs(),
            sweep_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub attempt_timeout_ms: u64,
    pub retry_queue_capacity: usize,
    /// How long delivered and abandoned records stay inspectable.
    pub ledger_retention_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        let policy = DeliveryPolicy::DEFAULT;
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            attempt_timeout_ms: policy.attempt_timeout.as_millis() as u64,
            retry_queue_capacity: policy.retry_queue_capacity,
            ledger_retention_secs: DEFAULT_RETENTION.as_secs(),
        }
    }
}

fn default_pattern() -> String {
    "*".to_string()
}

fn default_active() -> bool {
    true
}

/// One `[[subscriptions]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub subscriber_id: String,
    #[serde(default = "default_pattern")]
    pub pipeline: String,
    pub stages: Vec<Stage>,
    pub sink: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Layered figment for `path` (or the default file).
    pub fn figment(path: Option<&Path>) -> Figment {
        let path = path.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), Path::to_path_buf);
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Loads configuration. A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, RelayError> {
        Self::figment(path)
            .extract()
            .map_err(|e| RelayError::configuration(e.to_string()))
    }

    /// Validates the configuration and builds runtime values.
    pub fn resolve(&self) -> Result<Resolved, RelayError> {
        let policy = self.delivery.policy()?;

        if self.dedup.retention_secs == 0 {
            return Err(RelayError::configuration("dedup.retention_secs must be greater than zero"));
        }
        if self.delivery.ledger_retention_secs == 0 {
            return Err(RelayError::configuration(
                "delivery.ledger_retention_secs must be greater than zero",
            ));
        }
        if self.dedup.sweep_interval_secs == 0 {
            return Err(RelayError::configuration(
                "dedup.sweep_interval_secs must be greater than zero",
            ));
        }

        let sinks = sinks::build_registry(&self.sinks)
            .map_err(|e| RelayError::configuration(e.to_string()))?;

        let mut seen = std::collections::BTreeSet::new();
        let mut subscriptions = Vec::with_capacity(self.subscriptions.len());
        for entry in &self.subscriptions {
            let subscription = entry.to_subscription(&sinks)?;
            if !seen.insert(subscription.subscriber_id.clone()) {
                return Err(RelayError::configuration(format!(
                    "duplicate subscriber_id '{}'",
                    subscription.subscriber_id
                )));
            }
            subscriptions.push(subscription);
        }

        let webhook_secret = match &self.ingest.webhook_secret {
            Some(secret) => Some(WebhookSecret::new(secret.as_bytes()).ok_or_else(|| {
                RelayError::configuration("ingest.webhook_secret must not be empty")
            })?),
            None => None,
        };

        Ok(Resolved {
            policy,
            retention: Duration::from_secs(self.dedup.retention_secs),
            ledger_retention: Duration::from_secs(self.delivery.ledger_retention_secs),
            sweep_interval: Duration::from_secs(self.dedup.sweep_interval_secs),
            sinks,
            subscriptions,
            webhook_secret,
        })
    }
}

impl DeliveryConfig {
    fn policy(&self) -> Result<DeliveryPolicy, RelayError> {
        if self.max_attempts == 0 {
            return Err(RelayError::configuration("delivery.max_attempts must be at least 1"));
        }
        if Duration::from_millis(self.max_delay_ms) > MAX_RETRY_DELAY {
            return Err(RelayError::configuration(format!(
                "delivery.max_delay_ms must not exceed {}",
                MAX_RETRY_DELAY.as_millis()
            )));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(RelayError::configuration(
                "delivery.base_delay_ms must not exceed delivery.max_delay_ms",
            ));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(RelayError::configuration(
                "delivery.attempt_timeout_ms must be greater than zero",
            ));
        }
        if self.retry_queue_capacity == 0 {
            return Err(RelayError::configuration(
                "delivery.retry_queue_capacity must be greater than zero",
            ));
        }
        Ok(DeliveryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
            retry_queue_capacity: self.retry_queue_capacity,
        })
    }
}

impl SubscriptionConfig {
    fn to_subscription(&self, sinks: &SinkRegistry) -> Result<Subscription, RelayError> {
        let subscriber_id = SubscriberId::new(self.subscriber_id.as_str())
            .ok_or_else(|| RelayError::configuration("subscription with blank subscriber_id"))?;
        let context = |message: String| {
            RelayError::configuration(format!("subscription '{subscriber_id}': {message}"))
        };

        let pipeline = PipelinePattern::parse(&self.pipeline).map_err(|e| context(e.to_string()))?;
        if self.stages.is_empty() {
            return Err(context("stages must not be empty".to_string()));
        }
        let sink_ref = SinkRef::new(self.sink.as_str())
            .filter(|s| sinks.contains(s))
            .ok_or_else(|| context(format!("unknown sink '{}'", self.sink)))?;

        Ok(Subscription {
            subscriber_id: subscriber_id.clone(),
            filter: SubscriptionFilter {
                pipeline,
                stages: self.stages.iter().copied().collect(),
            },
            sink_ref,
            active: self.active,
        })
    }
}

/// Validated runtime configuration.
#[derive(Debug)]
pub struct Resolved {
    pub policy: DeliveryPolicy,
    pub retention: Duration,
    pub ledger_retention: Duration,
    pub sweep_interval: Duration,
    pub sinks: SinkRegistry,
    pub subscriptions: Vec<Subscription>,
    pub webhook_secret: Option<WebhookSecret>,
}
