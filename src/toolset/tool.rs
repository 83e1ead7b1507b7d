//! The `Tool` seam: anything the registry can discover and dispatch to.

use std::sync::Arc;

use async_trait::async_trait;

use super::errors::ToolError;
use crate::inference::{ChatMessage, ToolCall, ToolDefinition};
use crate::mcp_client::UriTemplate;

/// A named capability source.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Enumerate what this tool offers. Starts the backend if needed.
    async fn discover(&self) -> Result<ToolDiscovery, ToolError>;

    /// Run one call. Failures the backend reports come back as tool-result
    /// messages; only failures to reach the backend are errors.
    async fn invoke(&self, call: &ToolCall) -> Result<Vec<ChatMessage>, ToolError>;
}

/// Something that can read resources by URI.
#[async_trait]
pub trait ResourceSource: Send + Sync {
    fn source_name(&self) -> &str;

    async fn read_resource(
        &self,
        call: &ToolCall,
        uri: &str,
    ) -> Result<Vec<ChatMessage>, ToolError>;
}

/// Result of one discovery pass.
#[derive(Debug, Default)]
pub struct ToolDiscovery {
    /// Namespaced callable definitions.
    pub definitions: Vec<ToolDefinition>,
    /// System messages to put in front of the conversation.
    pub instructions: Vec<ChatMessage>,
    /// Set when the tool also serves readable resources.
    pub resources: Option<ResourceBinding>,
}

/// A resource source together with the URIs it answers for.
#[derive(Clone)]
pub struct ResourceBinding {
    pub source: Arc<dyn ResourceSource>,
    pub templates: Vec<UriTemplate>,
    /// One system message per advertised resource or template.
    pub instructions: Vec<ChatMessage>,
}

impl ResourceBinding {
    pub fn matches(&self, uri: &str) -> bool {
        self.templates.iter().any(|t| t.matches(uri))
    }
}

/// Tool result carrying `{"error": message}` for the model to read.
pub fn error_result(call: &ToolCall, message: &str) -> ChatMessage {
    ChatMessage::tool_result(call, serde_json::json!({ "error": message }).to_string())
}

impl std::fmt::Debug for ResourceBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceBinding")
            .field("source", &self.source.source_name())
            .field("templates", &self.templates)
            .finish_non_exhaustive()
    }
}
