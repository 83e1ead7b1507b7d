//! Tool orchestration: what the model can call and where each call goes.
//!
//! This module handles:
//! - The `Tool` seam and the MCP-backed implementation
//! - Namespacing operations as `<tool>.<operation>`
//! - The `read_resource` gateway over every backend's resources
//! - The registry that routes calls and owns backend shutdown

pub mod component;
pub mod errors;
pub mod mcp_tool;
pub mod registry;
pub mod resource_gateway;
pub mod tool;

// Re-exports for convenience
pub use component::{Component, ComponentContainer};
pub use errors::{BoxError, ShutdownError, ToolError};
pub use mcp_tool::McpTool;
pub use registry::{DiscoveryPolicy, ToolSet};
pub use resource_gateway::{ResourceGateway, GATEWAY_TOOL_NAME};
pub use tool::{ResourceBinding, ResourceSource, Tool, ToolDiscovery};
