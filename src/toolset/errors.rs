//! Tool orchestration error types.
//!
//! These are the hard errors: the orchestrator could not start or reach a
//! backend. Failures the backend reports itself never show up here; they are
//! turned into tool-result messages the model can read.

use thiserror::Error;

use crate::backend::BackendError;
use crate::mcp_client::{McpError, UriTemplateError};

/// Boxed error returned by component shutdown.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool's backend could not be started.
    #[error("tool '{tool}': backend failed to start: {source}")]
    BackendStart {
        tool: String,
        #[source]
        source: BackendError,
    },

    /// Called after the tool was shut down.
    #[error("tool '{tool}' has been shut down")]
    ShutDown { tool: String },

    /// Protocol or transport failure talking to the backend.
    #[error("tool '{tool}': {operation}: {source}")]
    Protocol {
        tool: String,
        operation: String,
        #[source]
        source: McpError,
    },

    /// Discovery or invocation exceeded its deadline.
    #[error("tool '{tool}': {operation} timed out after {timeout_ms}ms")]
    Timeout {
        tool: String,
        operation: String,
        timeout_ms: u64,
    },

    /// A call name with nothing after the namespace separator.
    #[error("invalid tool name: {name:?}")]
    InvalidName { name: String },

    /// An operation's parameter schema could not be translated for the model.
    #[error("tool '{tool}': translating schema of '{operation}': {reason}")]
    Schema {
        tool: String,
        operation: String,
        reason: String,
    },

    /// An advertised resource URI or template could not be parsed.
    #[error("tool '{tool}': parsing resource URI: {source}")]
    Template {
        tool: String,
        #[source]
        source: UriTemplateError,
    },

    /// A dispatched call failed; carries the call's identity.
    #[error("tool invocation {operation:?} (id: {call_id}): {source}")]
    Invocation {
        operation: String,
        call_id: String,
        #[source]
        source: Box<ToolError>,
    },
}

/// One component that failed to shut down.
#[derive(Debug, Error)]
#[error("failed to shutdown {component}: {source}")]
pub struct ShutdownError {
    pub component: String,
    #[source]
    pub source: BoxError,
}
