//! MCP-backed tool.
//!
//! One `McpTool` owns one backend. The backend is started on first use and
//! bound to a protocol session exactly once; discovery and invocation both
//! go through that session. Operation names are namespaced as
//! `<tool>.<operation>` so two backends can expose the same bare name.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::component::Component;
use super::errors::{BoxError, ToolError};
use super::tool::{error_result, ResourceBinding, ResourceSource, Tool, ToolDiscovery};
use crate::backend::{BackendSpec, RunningBackend};
use crate::config::NAMESPACE_SEPARATOR;
use crate::inference::{ChatMessage, ToolCall, ToolDefinition, ToolFunctionParameters};
use crate::mcp_client::{
    CallToolResult, ContentBlock, McpClient, McpError, McpToolDefinition, ResourceContents,
    UriTemplate,
};

/// Deadline for the handshake plus all list calls.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for one `tools/call` or `resources/read`.
pub const INVOCATION_TIMEOUT: Duration = Duration::from_secs(15);

/// A tool served by one MCP backend. Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct McpTool {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    spec: BackendSpec,
    discovery_timeout: Duration,
    invocation_timeout: Duration,
    state: Mutex<ToolState>,
}

#[derive(Default)]
struct ToolState {
    backend: Option<RunningBackend>,
    client: Option<Arc<McpClient>>,
    shut_down: bool,
}

impl McpTool {
    pub fn new(spec: BackendSpec) -> Self {
        Self::with_timeouts(spec, DISCOVERY_TIMEOUT, INVOCATION_TIMEOUT)
    }

    pub fn with_timeouts(spec: BackendSpec, discovery: Duration, invocation: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: spec.name().to_string(),
                spec,
                discovery_timeout: discovery,
                invocation_timeout: invocation,
                state: Mutex::new(ToolState::default()),
            }),
        }
    }

    /// Start the backend and bind the session on first use.
    ///
    /// The state lock is held across the start, so concurrent first callers
    /// wait for one start instead of racing two.
    async fn ensure_running(&self) -> Result<Arc<McpClient>, ToolError> {
        let mut state = self.inner.state.lock().await;
        if state.shut_down {
            return Err(ToolError::ShutDown {
                tool: self.inner.name.clone(),
            });
        }
        if let Some(client) = &state.client {
            return Ok(Arc::clone(client));
        }

        tracing::info!(tool = %self.inner.name, kind = self.inner.spec.kind(), "starting backend");
        let backend = self
            .inner
            .spec
            .start()
            .await
            .map_err(|source| ToolError::BackendStart {
                tool: self.inner.name.clone(),
                source,
            })?;

        let client = Arc::new(McpClient::new(&self.inner.name, backend.transport()));
        state.backend = Some(backend);
        state.client = Some(Arc::clone(&client));
        Ok(client)
    }

    async fn discover_with(&self, client: &McpClient) -> Result<ToolDiscovery, ToolError> {
        let init = client
            .initialize()
            .await
            .map_err(|e| self.protocol_error("initialize", e))?;

        let mut discovery = ToolDiscovery::default();
        if let Some(text) = init.instructions.as_deref().filter(|t| !t.trim().is_empty()) {
            discovery.instructions.push(ChatMessage::system(text));
        }

        if init.capabilities.resources.is_some() {
            discovery.resources = self.discover_resources(client).await?;
        }

        let operations = client
            .list_tools()
            .await
            .map_err(|e| self.protocol_error("tools/list", e))?;
        for operation in operations {
            let parameters = self.translate_schema(&operation)?;
            discovery.definitions.push(ToolDefinition::function(
                format!("{}{NAMESPACE_SEPARATOR}{}", self.inner.name, operation.name),
                operation.description,
                parameters,
            ));
        }

        tracing::info!(
            tool = %self.inner.name,
            operations = discovery.definitions.len(),
            resources = discovery.resources.as_ref().map(|r| r.templates.len()).unwrap_or(0),
            "discovery complete"
        );
        Ok(discovery)
    }

    async fn discover_resources(
        &self,
        client: &McpClient,
    ) -> Result<Option<ResourceBinding>, ToolError> {
        let mut templates = Vec::new();
        let mut instructions = Vec::new();

        let resources = client
            .list_resources()
            .await
            .map_err(|e| self.protocol_error("resources/list", e))?;
        for resource in resources {
            instructions.push(ChatMessage::system(format!(
                "# {}\nUse URI {} to access this resources\n{}",
                resource.name, resource.uri, resource.description
            )));
            templates.push(self.parse_template(&resource.uri)?);
        }

        let resource_templates = client
            .list_resource_templates()
            .await
            .map_err(|e| self.protocol_error("resources/templates/list", e))?;
        for template in resource_templates {
            instructions.push(ChatMessage::system(format!(
                "# {}\nURI template: {}\n{}\n",
                template.name, template.uri_template, template.description
            )));
            templates.push(self.parse_template(&template.uri_template)?);
        }

        if templates.is_empty() {
            return Ok(None);
        }
        Ok(Some(ResourceBinding {
            source: Arc::new(self.clone()),
            templates,
            instructions,
        }))
    }

    fn parse_template(&self, raw: &str) -> Result<UriTemplate, ToolError> {
        UriTemplate::parse(raw).map_err(|source| ToolError::Template {
            tool: self.inner.name.clone(),
            source,
        })
    }

    /// Re-encode the backend's input schema in the model's shape.
    fn translate_schema(
        &self,
        operation: &McpToolDefinition,
    ) -> Result<ToolFunctionParameters, ToolError> {
        if operation.input_schema.is_null() {
            return Ok(ToolFunctionParameters::default());
        }
        serde_json::from_value(operation.input_schema.clone()).map_err(|e| ToolError::Schema {
            tool: self.inner.name.clone(),
            operation: operation.name.clone(),
            reason: e.to_string(),
        })
    }

    fn protocol_error(&self, operation: &str, source: McpError) -> ToolError {
        ToolError::Protocol {
            tool: self.inner.name.clone(),
            operation: operation.to_string(),
            source,
        }
    }

    fn timeout_error(&self, operation: &str, after: Duration) -> ToolError {
        ToolError::Timeout {
            tool: self.inner.name.clone(),
            operation: operation.to_string(),
            timeout_ms: after.as_millis() as u64,
        }
    }

    /// Map a backend-reported failure to an error payload; anything else
    /// stays a hard error.
    fn soften(
        &self,
        call: &ToolCall,
        operation: &str,
        err: McpError,
    ) -> Result<Vec<ChatMessage>, ToolError> {
        match err {
            McpError::ServerError { code, message, .. } => {
                tracing::warn!(tool = %self.inner.name, call_id = %call.id, code, %message, "{operation} failed in backend");
                Ok(vec![error_result(call, &message)])
            }
            other => Err(self.protocol_error(operation, other)),
        }
    }
}

fn render_call_result(tool: &str, call: &ToolCall, result: CallToolResult) -> Vec<ChatMessage> {
    if result.is_error {
        tracing::warn!(tool, call_id = %call.id, "backend flagged the call result as an error");
    }

    let mut messages: Vec<ChatMessage> = result
        .content
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Resource { resource } => render_resource(tool, &resource),
            ContentBlock::Image { mime_type, .. } => {
                tracing::debug!(tool, %mime_type, "skipping image content");
                None
            }
            ContentBlock::Unsupported => {
                tracing::debug!(tool, "skipping unsupported content");
                None
            }
        })
        .map(|text| ChatMessage::tool_result(call, text))
        .collect();

    // Every call gets an answer, even an empty one.
    if messages.is_empty() {
        messages.push(ChatMessage::tool_result(call, ""));
    }
    messages
}

fn render_resource(tool: &str, contents: &ResourceContents) -> Option<String> {
    match contents {
        ResourceContents::Text {
            uri,
            mime_type,
            text,
        } => Some(format!("URI: {uri}\nContent-type: {mime_type}\n\n{text}")),
        ResourceContents::Blob {
            uri,
            mime_type,
            blob,
        } => Some(format!("URI: {uri}\nContent-type: {mime_type}\n\n{blob}")),
        ResourceContents::Unknown(raw) => {
            tracing::warn!(tool, content = %raw, "dropping resource content of unknown kind");
            None
        }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn discover(&self) -> Result<ToolDiscovery, ToolError> {
        let client = self.ensure_running().await?;
        let limit = self.inner.discovery_timeout;
        tokio::time::timeout(limit, self.discover_with(&client))
            .await
            .map_err(|_| self.timeout_error("discovery", limit))?
    }

    async fn invoke(&self, call: &ToolCall) -> Result<Vec<ChatMessage>, ToolError> {
        let operation = match call.name().split_once(NAMESPACE_SEPARATOR) {
            Some((_, operation)) => operation,
            None => call.name(),
        };
        if operation.is_empty() {
            return Err(ToolError::InvalidName {
                name: call.name().to_string(),
            });
        }

        let client = self.ensure_running().await?;
        tracing::debug!(tool = %self.inner.name, %operation, call_id = %call.id, "calling operation");

        let limit = self.inner.invocation_timeout;
        let outcome = tokio::time::timeout(
            limit,
            client.call_tool(operation, call.function.arguments.clone()),
        )
        .await
        .map_err(|_| self.timeout_error(&format!("tools/call {operation}"), limit))?;

        match outcome {
            Ok(result) => Ok(render_call_result(&self.inner.name, call, result)),
            Err(err) => self.soften(call, "tools/call", err),
        }
    }
}

#[async_trait]
impl ResourceSource for McpTool {
    fn source_name(&self) -> &str {
        &self.inner.name
    }

    async fn read_resource(
        &self,
        call: &ToolCall,
        uri: &str,
    ) -> Result<Vec<ChatMessage>, ToolError> {
        let client = self.ensure_running().await?;
        let limit = self.inner.invocation_timeout;
        let outcome = tokio::time::timeout(limit, client.read_resource(uri))
            .await
            .map_err(|_| self.timeout_error("resources/read", limit))?;

        let result = match outcome {
            Ok(result) => result,
            Err(err) => return self.soften(call, "resources/read", err),
        };
        let messages: Vec<ChatMessage> = result
            .contents
            .iter()
            .filter_map(|c| render_resource(&self.inner.name, c))
            .map(|text| ChatMessage::tool_result(call, text))
            .collect();
        if messages.is_empty() {
            tracing::warn!(tool = %self.inner.name, call_id = %call.id, %uri, "resource read returned nothing usable");
            return Ok(vec![error_result(
                call,
                &format!("could not interpret the contents of {uri}"),
            )]);
        }
        Ok(messages)
    }
}

#[async_trait]
impl Component for McpTool {
    fn describe(&self) -> String {
        format!("{} tool {}", self.inner.spec.kind(), self.inner.name)
    }

    async fn shutdown(&self) -> Result<(), BoxError> {
        let mut state = self.inner.state.lock().await;
        state.shut_down = true;
        state.client = None;
        let Some(mut backend) = state.backend.take() else {
            return Ok(());
        };
        backend.stop().await.map_err(|e| Box::new(e) as BoxError)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
