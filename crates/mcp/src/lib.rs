//! Query tool surface for Pipeline Notify.
//!
//! Exposes pipeline status, recent failures and delivery attempts to an
//! external conversational agent through MCP-style `list_tools` and
//! `call_tool` operations. Transport (stdio, HTTP) is left to the host.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`query`] | [`QueryService`] over the status store and dispatcher |
//! | [`tools`] | [`ToolRegistry`], schemas, argument validation |
//! | [`error`] | [`ToolError`] |

pub mod error;
mod format;
pub mod query;
pub mod tools;

pub use error::ToolError;
pub use query::{QueryService, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
pub use tools::{error_response, ToolDescriptor, ToolOutput, ToolRegistry};
