//! Pipeline Notify CLI entry point.
//!
//! This binary is the composition root for the relay:
//!
//! 1. **Load configuration** from `.pipeline-notify/config.toml` and
//!    `PIPELINE_NOTIFY_*` overrides, then validate it.
//! 2. **Wire observability** with a JSON or pretty `tracing-subscriber` layer
//!    and an optional OpenTelemetry OTLP exporter.
//! 3. **Build the relay** (stores, dispatcher, orchestrator, receiver, tools)
//!    and run the selected command.
//!
//! Commands:
//!
//! - `check-config` validates configuration and prints a summary.
//! - `tools` prints the advertised query tools.
//! - `replay <file>` feeds a JSON-lines file of webhook requests through the
//!   receiver, waits for deliveries to settle and prints the outcomes.
//! - `call <tool> [args]` invokes a query tool, optionally after a replay.

mod app;
mod config;
mod observability;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use listener::{Headers, SOURCE_HEADER};

use crate::app::App;
use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "pipeline-notify", version, about = "CI/CD pipeline event relay")]
struct Cli {
    /// Configuration file. Defaults to `.pipeline-notify/config.toml`.
    #[arg(long, short, global = true, env = "PIPELINE_NOTIFY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate configuration and print a summary.
    CheckConfig,

    /// Print the query tool descriptors as JSON.
    Tools,

    /// Feed recorded webhook requests through the relay.
    Replay {
        /// JSON-lines file; each line is `{"format"?, "headers"?, "payload"}`.
        file: PathBuf,

        /// Seconds to wait for in-flight deliveries after the last request.
        #[arg(long, default_value_t = 30)]
        settle_timeout_secs: u64,

        /// Check request signatures against `ingest.webhook_secret`.
        #[arg(long)]
        verify_signatures: bool,
    },

    /// Invoke a query tool and print its MCP result.
    Call {
        /// Tool name, e.g. `get_pipeline_status`.
        tool: String,

        /// Tool arguments as a JSON object.
        #[arg(default_value = "{}")]
        arguments: String,

        /// Replay this JSON-lines file before the call.
        #[arg(long)]
        events: Option<PathBuf>,
    },
}

/// One line of a replay file.
#[derive(Debug, Deserialize)]
struct RecordedRequest {
    /// Sets `X-Pipeline-Source` when present.
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    headers: Vec<(String, String)>,
    /// A JSON string is sent as raw bytes; anything else is serialized.
    payload: Value,
}

impl RecordedRequest {
    fn headers(&self) -> Headers {
        let headers: Headers = self.headers.iter().cloned().collect();
        match &self.format {
            Some(format) => headers.with(SOURCE_HEADER, format.as_str()),
            None => headers,
        }
    }

    fn body(&self) -> Result<Vec<u8>> {
        match &self.payload {
            Value::String(raw) => Ok(raw.clone().into_bytes()),
            other => serde_json::to_vec(other).context("serializing payload"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let _telemetry = observability::init(&config.logging)?;

    match cli.command {
        Command::CheckConfig => check_config(&config),
        Command::Tools => print_tools(&config),
        Command::Replay {
            file,
            settle_timeout_secs,
            verify_signatures,
        } => replay_command(&config, &file, settle_timeout_secs, verify_signatures).await,
        Command::Call {
            tool,
            arguments,
            events,
        } => call_command(&config, &tool, &arguments, events.as_deref()).await,
    }
}

fn check_config(config: &Config) -> Result<ExitCode> {
    let resolved = config.resolve()?;
    let summary = json!({
        "sinks": config.sinks.iter().map(|(name, sink)| json!({"name": name, "type": sink.kind()})).collect::<Vec<_>>(),
        "subscriptions": resolved.subscriptions.len(),
        "active_subscriptions": resolved.subscriptions.iter().filter(|s| s.active).count(),
        "max_attempts": resolved.policy.max_attempts,
        "signed_ingest": resolved.webhook_secret.is_some(),
        "dedup_retention_secs": resolved.retention.as_secs(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(ExitCode::SUCCESS)
}

fn print_tools(config: &Config) -> Result<ExitCode> {
    // Tool descriptors do not depend on state, but building the app validates
    // the configuration the same way a real host would.
    let app = App::build(config.resolve()?);
    println!("{}", serde_json::to_string_pretty(&app.tools.list_tools())?);
    Ok(ExitCode::SUCCESS)
}

fn read_requests(path: &Path) -> Result<Vec<RecordedRequest>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading replay file {}", path.display()))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid replay line", path.display(), index + 1))
        })
        .collect()
}

/// Sends every request through the receiver, then waits for deliveries.
///
/// Returns one JSON line per request.
async fn replay(app: &App, requests: &[RecordedRequest], settle: Duration) -> Result<Vec<Value>> {
    let mut results = Vec::with_capacity(requests.len());
    for (index, request) in requests.iter().enumerate() {
        let response = app.receiver.handle(&request.headers(), &request.body()?).await;
        results.push(json!({
            "line": index + 1,
            "status": response.status,
            "body": response.body,
        }));
    }

    if tokio::time::timeout(settle, app.dispatcher.settled()).await.is_err() {
        warn!(
            in_flight = app.dispatcher.in_flight(),
            timeout_secs = settle.as_secs(),
            "deliveries still in flight after settle timeout"
        );
    }
    Ok(results)
}

async fn replay_command(
    config: &Config,
    file: &Path,
    settle_timeout_secs: u64,
    verify_signatures: bool,
) -> Result<ExitCode> {
    let requests = read_requests(file)?;
    let mut resolved = config.resolve()?;
    if !verify_signatures {
        resolved.webhook_secret = None;
    }
    let app = App::build(resolved);

    info!(requests = requests.len(), file = %file.display(), "replaying requests");
    let results = replay(&app, &requests, Duration::from_secs(settle_timeout_secs)).await?;
    for line in &results {
        println!("{line}");
    }
    println!("{}", json!({ "metrics": app.dispatcher.metrics() }));

    let settled = app.dispatcher.in_flight() == 0;
    app.shutdown().await;
    Ok(if settled {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn call_command(
    config: &Config,
    tool: &str,
    arguments: &str,
    events: Option<&Path>,
) -> Result<ExitCode> {
    let arguments: Value = serde_json::from_str(arguments).context("tool arguments are not valid JSON")?;
    let mut resolved = config.resolve()?;
    resolved.webhook_secret = None;
    let app = App::build(resolved);

    if let Some(path) = events {
        let requests = read_requests(path)?;
        replay(&app, &requests, Duration::from_secs(30)).await?;
    }

    let code = match app.tools.call_tool(tool, arguments).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output.to_response())?);
            ExitCode::SUCCESS
        }
        Err(err) => {
            warn!(tool, kind = err.kind(), error = %err, "tool call failed");
            println!("{}", serde_json::to_string_pretty(&mcp::error_response(&err))?);
            ExitCode::FAILURE
        }
    };
    app.shutdown().await;
    Ok(code)
}
