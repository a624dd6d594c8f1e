//! MCP-style tool registry.
//!
//! `list_tools` advertises each tool with a JSON input schema; `call_tool`
//! validates arguments against the tool's argument struct, runs the query and
//! returns both a text rendering and structured JSON.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use pipeline::{PipelineId, Timestamp};

use crate::query::{QueryService, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
use crate::{format, ToolError};

pub const GET_PIPELINE_STATUS: &str = "get_pipeline_status";
pub const LIST_RECENT_FAILURES: &str = "list_recent_failures";
pub const LIST_DELIVERY_ATTEMPTS: &str = "list_delivery_attempts";

/// Advertised tool metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Successful tool output.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// Human-readable rendering.
    pub text: String,
    /// Machine-readable result.
    pub structured: Value,
}

impl ToolOutput {
    /// MCP `tools/call` result body.
    pub fn to_response(&self) -> Value {
        json!({
            "content": [{ "type": "text", "text": self.text }],
            "structuredContent": self.structured,
        })
    }
}

/// MCP `tools/call` result body for a failed call.
pub fn error_response(err: &ToolError) -> Value {
    json!({
        "content": [{ "type": "text", "text": err.to_string() }],
        "isError": true,
        "structuredContent": { "error": err.kind(), "message": err.to_string() },
    })
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineArgs {
    pipeline_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FailureArgs {
    since: TimeArg,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TimeArg {
    EpochMillis(i64),
    Rfc3339(String),
}

/// The query tools exposed to conversational clients.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    query: QueryService,
}

impl ToolRegistry {
    pub fn new(query: QueryService) -> Self {
        Self { query }
    }

    /// Every tool with its input schema.
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: GET_PIPELINE_STATUS,
                description: "Get the latest known stage of a pipeline.",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "pipeline_id": { "type": "string", "description": "Pipeline identifier" }
                    },
                    "required": ["pipeline_id"],
                    "additionalProperties": false
                }),
            },
            ToolDescriptor {
                name: LIST_RECENT_FAILURES,
                description: "List pipelines whose latest stage is failed, ordered by pipeline id.",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "since": {
                            "type": ["string", "integer"],
                            "description": "RFC 3339 timestamp or epoch milliseconds"
                        },
                        "cursor": {
                            "type": "string",
                            "description": "next_cursor from a previous page"
                        },
                        "limit": {
                            "type": "integer",
                            "minimum": 1,
                            "maximum": MAX_PAGE_LIMIT,
                            "default": DEFAULT_PAGE_LIMIT
                        }
                    },
                    "required": ["since"],
                    "additionalProperties": false
                }),
            },
            ToolDescriptor {
                name: LIST_DELIVERY_ATTEMPTS,
                description: "List notification delivery attempts for a pipeline.",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "pipeline_id": { "type": "string", "description": "Pipeline identifier" }
                    },
                    "required": ["pipeline_id"],
                    "additionalProperties": false
                }),
            },
        ]
    }

    /// Runs `name` with JSON `arguments`.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, ToolError> {
        info!(tool = name, "tool call");
        let result = match name {
            GET_PIPELINE_STATUS => self.get_pipeline_status(arguments).await,
            LIST_RECENT_FAILURES => self.list_recent_failures(arguments).await,
            LIST_DELIVERY_ATTEMPTS => self.list_delivery_attempts(arguments),
            _ => Err(ToolError::UnknownTool {
                name: name.to_string(),
            }),
        };
        if let Err(err) = &result {
            warn!(tool = name, error = %err, "tool call failed");
        }
        result
    }

    async fn get_pipeline_status(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        let args: PipelineArgs = parse_args(GET_PIPELINE_STATUS, arguments)?;
        let pipeline_id = pipeline_id(GET_PIPELINE_STATUS, args.pipeline_id)?;
        let snapshot = self.query.get_pipeline_status(&pipeline_id).await?;
        Ok(ToolOutput {
            text: format::status(&snapshot),
            structured: json!(snapshot),
        })
    }

    async fn list_recent_failures(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        let args: FailureArgs = parse_args(LIST_RECENT_FAILURES, arguments)?;
        let since = match args.since {
            TimeArg::EpochMillis(millis) => Timestamp::from_epoch_millis(millis),
            TimeArg::Rfc3339(text) => Timestamp::parse_rfc3339(&text),
        }
        .ok_or_else(|| ToolError::invalid(LIST_RECENT_FAILURES, "'since' is not a valid timestamp"))?;
        let cursor = args
            .cursor
            .map(|c| pipeline_id(LIST_RECENT_FAILURES, c))
            .transpose()?;
        if args.limit == Some(0) || args.limit.is_some_and(|l| l > MAX_PAGE_LIMIT) {
            return Err(ToolError::invalid(
                LIST_RECENT_FAILURES,
                format!("'limit' must be between 1 and {MAX_PAGE_LIMIT}"),
            ));
        }

        let page = self
            .query
            .list_recent_failures(since, cursor.as_ref(), args.limit)
            .await?;
        Ok(ToolOutput {
            text: format::failures(&page),
            structured: json!({
                "failures": page.items,
                "next_cursor": page.next_cursor,
            }),
        })
    }

    fn list_delivery_attempts(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        let args: PipelineArgs = parse_args(LIST_DELIVERY_ATTEMPTS, arguments)?;
        let pipeline_id = pipeline_id(LIST_DELIVERY_ATTEMPTS, args.pipeline_id)?;
        let attempts = self.query.list_delivery_attempts(&pipeline_id);
        Ok(ToolOutput {
            text: format::attempts(&pipeline_id, &attempts),
            structured: json!({ "attempts": attempts }),
        })
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(tool: &str, arguments: Value) -> Result<T, ToolError> {
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    serde_json::from_value(arguments).map_err(|e| ToolError::invalid(tool, e.to_string()))
}

fn pipeline_id(tool: &str, value: String) -> Result<PipelineId, ToolError> {
    PipelineId::new(value).ok_or_else(|| ToolError::invalid(tool, "pipeline id must not be blank"))
}
