//! Event Normalizer: converts inbound CI/CD payloads into [`PipelineEvent`]s.
//!
//! Pure transform with no side effects. Any payload that lacks `pipeline_id`,
//! `run_id`, `stage` or `timestamp` (after source-specific mapping), or whose
//! stage is not recognized, is rejected with [`RelayError::MalformedEvent`].
//!
//! ## Source formats
//!
//! | Tag | Shape |
//! |-----|-------|
//! | `generic` | Flat JSON object using the canonical field names |
//! | `jenkins` | Jenkins Notification plugin job/build document |
//! | `github_actions` | GitHub `workflow_run` webhook |

use std::str::FromStr;

use serde_json::{Map, Value};

use crate::{
    AttemptSequence, Metadata, PipelineEvent, PipelineId, RelayError, RunId, Stage, Timestamp,
};

/// Declared shape of an inbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceFormat {
    /// Canonical field names.
    Generic,
    /// Jenkins Notification plugin.
    Jenkins,
    /// GitHub Actions `workflow_run` webhook.
    GitHubActions,
}

impl SourceFormat {
    /// Returns the tag used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            SourceFormat::Generic => "generic",
            SourceFormat::Jenkins => "jenkins",
            SourceFormat::GitHubActions => "github_actions",
        }
    }
}

impl std::fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceFormat {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "generic" => Ok(SourceFormat::Generic),
            "jenkins" => Ok(SourceFormat::Jenkins),
            "github_actions" | "github-actions" => Ok(SourceFormat::GitHubActions),
            other => Err(RelayError::malformed(format!(
                "unknown source format '{other}'"
            ))),
        }
    }
}

/// Parses `body` as JSON and normalizes it according to `format`.
pub fn normalize(format: SourceFormat, body: &[u8]) -> Result<PipelineEvent, RelayError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| RelayError::malformed(format!("payload is not valid JSON: {e}")))?;
    normalize_value(format, &value)
}

/// Normalizes an already-parsed payload.
pub fn normalize_value(format: SourceFormat, payload: &Value) -> Result<PipelineEvent, RelayError> {
    let object = payload
        .as_object()
        .ok_or_else(|| RelayError::malformed("payload must be a JSON object"))?;

    match format {
        SourceFormat::Generic => normalize_generic(object),
        SourceFormat::Jenkins => normalize_jenkins(object),
        SourceFormat::GitHubActions => normalize_github_actions(object),
    }
}

// ---------------------------------------------------------------------------
// generic
// ---------------------------------------------------------------------------

fn normalize_generic(object: &Map<String, Value>) -> Result<PipelineEvent, RelayError> {
    let pipeline_id = pipeline_id(identifier(object.get("pipeline_id"), "pipeline_id")?)?;
    let run_id = run_id(identifier(object.get("run_id"), "run_id")?)?;
    let stage = stage_field(object.get("stage"))?;
    let timestamp = timestamp(object.get("timestamp"), "timestamp")?;
    let attempt_sequence = attempt(object.get("attempt_sequence"), "attempt_sequence")?;

    let metadata = match object.get("metadata") {
        None | Some(Value::Null) => Metadata::new(),
        Some(Value::Object(map)) => flatten_metadata(map),
        Some(_) => return Err(RelayError::malformed("metadata must be an object")),
    };

    Ok(PipelineEvent {
        pipeline_id,
        run_id,
        stage,
        timestamp,
        attempt_sequence,
        metadata,
    })
}

// ---------------------------------------------------------------------------
// jenkins
// ---------------------------------------------------------------------------

fn normalize_jenkins(object: &Map<String, Value>) -> Result<PipelineEvent, RelayError> {
    let pipeline_id = pipeline_id(identifier(object.get("name"), "pipeline_id (name)")?)?;
    let build = object
        .get("build")
        .and_then(Value::as_object)
        .ok_or_else(|| RelayError::malformed("missing run_id (build)"))?;

    let run_id = run_id(identifier(build.get("number"), "run_id (build.number)")?)?;
    let stage = jenkins_stage(
        build.get("phase").and_then(Value::as_str),
        build.get("status").and_then(Value::as_str),
    )?;
    let timestamp = timestamp(build.get("timestamp"), "timestamp (build.timestamp)")?;
    let attempt_sequence = attempt(build.get("attempt"), "build.attempt")?;

    let mut metadata = Metadata::new();
    copy_string(&mut metadata, "url", build.get("full_url"));
    if let Some(scm) = build.get("scm").and_then(Value::as_object) {
        copy_string(&mut metadata, "branch", scm.get("branch"));
        copy_string(&mut metadata, "commit", scm.get("commit"));
    }

    Ok(PipelineEvent {
        pipeline_id,
        run_id,
        stage,
        timestamp,
        attempt_sequence,
        metadata,
    })
}

fn jenkins_stage(phase: Option<&str>, status: Option<&str>) -> Result<Stage, RelayError> {
    let phase = phase.ok_or_else(|| RelayError::malformed("missing stage (build.phase)"))?;
    match phase.to_ascii_uppercase().as_str() {
        "QUEUED" => Ok(Stage::Queued),
        "STARTED" => Ok(Stage::Running),
        "COMPLETED" | "FINALIZED" => {
            let status =
                status.ok_or_else(|| RelayError::malformed("missing stage (build.status)"))?;
            match status.to_ascii_uppercase().as_str() {
                "SUCCESS" => Ok(Stage::Succeeded),
                "FAILURE" | "UNSTABLE" => Ok(Stage::Failed),
                "ABORTED" | "NOT_BUILT" => Ok(Stage::Cancelled),
                other => Err(RelayError::malformed(format!(
                    "unrecognized stage (build.status '{other}')"
                ))),
            }
        }
        other => Err(RelayError::malformed(format!(
            "unrecognized stage (build.phase '{other}')"
        ))),
    }
}

// ---------------------------------------------------------------------------
// github_actions
// ---------------------------------------------------------------------------

fn normalize_github_actions(object: &Map<String, Value>) -> Result<PipelineEvent, RelayError> {
    let run = object
        .get("workflow_run")
        .and_then(Value::as_object)
        .ok_or_else(|| RelayError::malformed("missing run_id (workflow_run)"))?;

    let repository = object
        .get("repository")
        .and_then(|r| r.get("full_name"))
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty());
    let workflow = identifier(run.get("name"), "pipeline_id (workflow_run.name)")?;
    let pipeline_id = pipeline_id(match repository {
        Some(repo) => format!("{repo}/{workflow}"),
        None => workflow,
    })?;

    let run_id = run_id(identifier(run.get("id"), "run_id (workflow_run.id)")?)?;
    let stage = github_stage(
        run.get("status").and_then(Value::as_str),
        run.get("conclusion").and_then(Value::as_str),
    )?;
    let timestamp = timestamp(run.get("updated_at"), "timestamp (workflow_run.updated_at)")?;
    let attempt_sequence = attempt(run.get("run_attempt"), "workflow_run.run_attempt")?;

    let mut metadata = Metadata::new();
    copy_string(&mut metadata, "branch", run.get("head_branch"));
    copy_string(&mut metadata, "commit", run.get("head_sha"));
    copy_string(&mut metadata, "url", run.get("html_url"));

    Ok(PipelineEvent {
        pipeline_id,
        run_id,
        stage,
        timestamp,
        attempt_sequence,
        metadata,
    })
}

fn github_stage(status: Option<&str>, conclusion: Option<&str>) -> Result<Stage, RelayError> {
    let status =
        status.ok_or_else(|| RelayError::malformed("missing stage (workflow_run.status)"))?;
    match status {
        "requested" | "queued" | "waiting" | "pending" => Ok(Stage::Queued),
        "in_progress" => Ok(Stage::Running),
        "completed" => {
            let conclusion = conclusion.ok_or_else(|| {
                RelayError::malformed("missing stage (workflow_run.conclusion)")
            })?;
            match conclusion {
                "success" => Ok(Stage::Succeeded),
                "failure" | "timed_out" | "startup_failure" | "action_required" => {
                    Ok(Stage::Failed)
                }
                "cancelled" | "skipped" | "neutral" | "stale" => Ok(Stage::Cancelled),
                other => Err(RelayError::malformed(format!(
                    "unrecognized stage (workflow_run.conclusion '{other}')"
                ))),
            }
        }
        other => Err(RelayError::malformed(format!(
            "unrecognized stage (workflow_run.status '{other}')"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// Reads a non-blank string or an integer (rendered in decimal).
fn identifier(value: Option<&Value>, field: &str) -> Result<String, RelayError> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) if n.is_u64() || n.is_i64() => Ok(n.to_string()),
        None | Some(Value::Null) => Err(RelayError::malformed(format!("missing {field}"))),
        Some(Value::String(_)) => Err(RelayError::malformed(format!("missing {field}"))),
        Some(_) => Err(RelayError::malformed(format!(
            "{field} must be a string or integer"
        ))),
    }
}

fn pipeline_id(raw: String) -> Result<PipelineId, RelayError> {
    PipelineId::new(raw).ok_or_else(|| RelayError::malformed("missing pipeline_id"))
}

fn run_id(raw: String) -> Result<RunId, RelayError> {
    RunId::new(raw).ok_or_else(|| RelayError::malformed("missing run_id"))
}

fn stage_field(value: Option<&Value>) -> Result<Stage, RelayError> {
    match value {
        Some(Value::String(s)) => {
            Stage::from_str(s).map_err(|e| RelayError::malformed(e.to_string()))
        }
        None | Some(Value::Null) => Err(RelayError::malformed("missing stage")),
        Some(_) => Err(RelayError::malformed("stage must be a string")),
    }
}

/// Accepts RFC 3339 strings and integer epoch milliseconds.
fn timestamp(value: Option<&Value>, field: &str) -> Result<Timestamp, RelayError> {
    match value {
        Some(Value::String(s)) => Timestamp::parse_rfc3339(s)
            .ok_or_else(|| RelayError::malformed(format!("{field} is not an RFC 3339 timestamp"))),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(Timestamp::from_epoch_millis)
            .ok_or_else(|| RelayError::malformed(format!("{field} is out of range"))),
        None | Some(Value::Null) => Err(RelayError::malformed(format!("missing {field}"))),
        Some(_) => Err(RelayError::malformed(format!(
            "{field} must be a string or integer"
        ))),
    }
}

/// Optional positive attempt counter; absent means the first attempt.
fn attempt(value: Option<&Value>, field: &str) -> Result<AttemptSequence, RelayError> {
    let raw = match value {
        None | Some(Value::Null) => return Ok(AttemptSequence::FIRST),
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(_) => None,
    };
    match raw {
        Some(n) if n >= 1 => Ok(AttemptSequence::new(n)),
        _ => Err(RelayError::malformed(format!(
            "{field} must be a positive integer"
        ))),
    }
}

fn flatten_metadata(map: &Map<String, Value>) -> Metadata {
    map.iter()
        .filter_map(|(key, value)| {
            let rendered = match value {
                Value::Null => return None,
                Value::String(s) => s.clone(),
                Value::Bool(_) | Value::Number(_) => value.to_string(),
                Value::Array(_) | Value::Object(_) => value.to_string(),
            };
            Some((key.clone(), rendered))
        })
        .collect()
}

fn copy_string(metadata: &mut Metadata, key: &str, value: Option<&Value>) {
    if let Some(s) = value.and_then(Value::as_str).filter(|s| !s.is_empty()) {
        metadata.insert(key.to_string(), s.to_string());
    }
}
