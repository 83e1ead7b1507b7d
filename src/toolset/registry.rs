//! Tool registry: every namespaced operation mapped to the tool that owns it.
//!
//! Built once at startup from the configured backends, then read-only. Also
//! owns the component container that shuts all the backends down.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use super::component::{Component, ComponentContainer};
use super::errors::{ShutdownError, ToolError};
use super::mcp_tool::McpTool;
use super::resource_gateway::ResourceGateway;
use super::tool::{error_result, ResourceBinding, Tool};
use crate::backend::BackendSpec;
use crate::errors::ErrorList;
use crate::inference::{ChatMessage, ToolCall, ToolDefinition};

/// What to do when one backend fails discovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryPolicy {
    /// Abort the build and shut down what was already started.
    FailFast,
    /// Log, record, and carry on with the remaining backends.
    #[default]
    BestEffort,
}

// ─── ToolSet ─────────────────────────────────────────────────────────────────

pub struct ToolSet {
    /// Namespaced operation name → owning tool.
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Definitions offered to the model, in registration order.
    definitions: Vec<ToolDefinition>,
    /// Tool instructions followed by the gateway's.
    instructions: Vec<ChatMessage>,
    /// How many trailing `instructions` belong to the gateway.
    gateway_instructions: usize,
    resource_bindings: Vec<ResourceBinding>,
    components: ComponentContainer,
    startup_errors: ErrorList<ToolError>,
}

impl Default for ToolSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolSet {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            definitions: Vec::new(),
            instructions: Vec::new(),
            gateway_instructions: 0,
            resource_bindings: Vec::new(),
            components: ComponentContainer::new("toolset"),
            startup_errors: ErrorList::new(),
        }
    }

    /// Create one tool per backend, register each for shutdown, and run
    /// discovery.
    pub async fn build(
        specs: Vec<BackendSpec>,
        policy: DiscoveryPolicy,
    ) -> Result<Self, ToolError> {
        let mut toolset = Self::new();

        for spec in specs {
            let tool = McpTool::new(spec);
            toolset.components.register(Arc::new(tool.clone()));

            if let Err(err) = toolset.register(Arc::new(tool)).await {
                match policy {
                    DiscoveryPolicy::FailFast => {
                        tracing::error!(error = %err, "tool discovery failed, aborting startup");
                        if let Err(shutdown) = toolset.shutdown().await {
                            tracing::warn!(error = %shutdown, "cleanup after failed startup");
                        }
                        return Err(err);
                    }
                    DiscoveryPolicy::BestEffort => {
                        tracing::warn!(error = %err, "tool discovery failed, continuing without it");
                        toolset.startup_errors.push(err);
                    }
                }
            }
        }

        tracing::info!(
            tools = toolset.tools.len(),
            failed = toolset.startup_errors.len(),
            "tool set ready"
        );
        Ok(toolset)
    }

    /// Discover `tool` and merge what it offers. A name registered again
    /// replaces the earlier entry. Resources it serves become reachable
    /// through the `read_resource` gateway straight away.
    pub async fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let discovery = tool.discover().await?;
        self.add_definitions(&tool, discovery.definitions);

        let at = self.instructions.len() - self.gateway_instructions;
        let gateway = self.instructions.split_off(at);
        self.instructions.extend(discovery.instructions);
        self.instructions.extend(gateway);

        if let Some(binding) = discovery.resources {
            self.resource_bindings.push(binding);
            self.install_resource_gateway().await?;
        }
        Ok(())
    }

    fn add_definitions(&mut self, tool: &Arc<dyn Tool>, definitions: Vec<ToolDefinition>) {
        for definition in definitions {
            let name = definition.name().to_string();
            match self.definitions.iter_mut().find(|d| d.name() == name) {
                Some(existing) => {
                    tracing::debug!(operation = %name, tool = tool.name(), "replacing earlier registration");
                    *existing = definition;
                }
                None => self.definitions.push(definition),
            }
            self.tools.insert(name, Arc::clone(tool));
        }
    }

    /// Replace the gateway with one over every binding seen so far.
    async fn install_resource_gateway(&mut self) -> Result<(), ToolError> {
        let mut gateway = ResourceGateway::new();
        for binding in &self.resource_bindings {
            gateway.add(binding.clone());
        }
        let gateway: Arc<dyn Tool> = Arc::new(gateway);
        let discovery = gateway.discover().await?;
        self.add_definitions(&gateway, discovery.definitions);

        let kept = self.instructions.len() - self.gateway_instructions;
        self.instructions.truncate(kept);
        self.gateway_instructions = discovery.instructions.len();
        self.instructions.extend(discovery.instructions);
        Ok(())
    }

    /// Route one call. An unknown name answers with an error payload;
    /// hard failures carry the operation and call id.
    pub async fn dispatch(&self, call: &ToolCall) -> Result<Vec<ChatMessage>, ToolError> {
        let Some(tool) = self.tools.get(call.name()) else {
            tracing::warn!(operation = %call.name(), call_id = %call.id, "model called an unknown tool");
            let message = format!("tool not found {{name: {:?}}}", call.name());
            return Ok(vec![error_result(call, &message)]);
        };

        tool.invoke(call)
            .await
            .map_err(|source| ToolError::Invocation {
                operation: call.name().to_string(),
                call_id: call.id.clone(),
                source: Box::new(source),
            })
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub fn instructions(&self) -> &[ChatMessage] {
        &self.instructions
    }

    /// Discovery failures tolerated under [`DiscoveryPolicy::BestEffort`].
    pub fn startup_errors(&self) -> &ErrorList<ToolError> {
        &self.startup_errors
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Register something else to be shut down with the tools.
    pub fn register_component(&self, component: Arc<dyn Component>) {
        self.components.register(component);
    }

    pub async fn shutdown(&self) -> Result<(), ErrorList<ShutdownError>> {
        self.components.shutdown_all().await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
