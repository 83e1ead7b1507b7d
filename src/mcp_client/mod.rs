//! MCP Client: JSON-RPC sessions with tool backends.
//!
//! This module handles:
//! - Line-delimited JSON-RPC framing over any pair of byte streams
//! - The `initialize` handshake and capability flags
//! - Discovery (tools, resources, resource templates) with pagination
//! - Tool calls and resource reads
//! - URI template matching for resource routing
//!
//! Starting and stopping the backend process or container is the `backend`
//! module's job; this module only needs the streams.

pub mod client;
pub mod errors;
pub mod transport;
pub mod types;
pub mod uri_template;

// Re-exports for convenience
pub use client::McpClient;
pub use errors::McpError;
pub use transport::{BoxedReader, BoxedWriter, Transport};
pub use types::{
    CallToolResult, ContentBlock, InitializeResult, McpResource, McpResourceTemplate,
    McpToolDefinition, ReadResourceResult, ResourceContents,
};
pub use uri_template::{UriTemplate, UriTemplateError};
