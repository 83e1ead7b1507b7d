//! Resource gateway: one `read_resource` operation for every backend that
//! serves resources.
//!
//! The URI is matched against each source's templates in registration
//! order and the first match reads it. Bad arguments and unmatched URIs
//! come back as tool results so the model can try again.

use async_trait::async_trait;

use super::errors::ToolError;
use super::tool::{ResourceBinding, Tool, ToolDiscovery};
use crate::inference::{
    ChatMessage, PropertyType, ToolCall, ToolDefinition, ToolFunctionParameters, ToolProperty,
};

pub const GATEWAY_TOOL_NAME: &str = "read_resource";

const GATEWAY_DESCRIPTION: &str = "read_resource is a gateway to other tools resources identified by a URI.  Pass the full URI as the `uri` parameter";

const GATEWAY_INSTRUCTION: &str =
    "Use the tool read_resource to access resources identified by a URI.";

#[derive(Debug, Default)]
pub struct ResourceGateway {
    bindings: Vec<ResourceBinding>,
}

impl ResourceGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, binding: ResourceBinding) {
        tracing::debug!(
            source = binding.source.source_name(),
            templates = binding.templates.len(),
            "registered resource source"
        );
        self.bindings.push(binding);
    }

    /// First binding with a template matching `uri`.
    pub fn route(&self, uri: &str) -> Option<&ResourceBinding> {
        self.bindings.iter().find(|b| b.matches(uri))
    }

    fn definition() -> ToolDefinition {
        let mut parameters = ToolFunctionParameters {
            required: vec!["uri".into()],
            ..ToolFunctionParameters::default()
        };
        parameters.properties.insert(
            "uri".into(),
            ToolProperty {
                property_type: Some(PropertyType::Single("string".into())),
                description: Some("URI of the resource to read".into()),
                ..ToolProperty::default()
            },
        );
        ToolDefinition::function(GATEWAY_TOOL_NAME, GATEWAY_DESCRIPTION, parameters)
    }
}

#[async_trait]
impl Tool for ResourceGateway {
    fn name(&self) -> &str {
        GATEWAY_TOOL_NAME
    }

    async fn discover(&self) -> Result<ToolDiscovery, ToolError> {
        let mut instructions = vec![ChatMessage::system(GATEWAY_INSTRUCTION)];
        for binding in &self.bindings {
            instructions.extend(binding.instructions.iter().cloned());
        }
        Ok(ToolDiscovery {
            definitions: vec![Self::definition()],
            instructions,
            resources: None,
        })
    }

    async fn invoke(&self, call: &ToolCall) -> Result<Vec<ChatMessage>, ToolError> {
        let uri = match call.function.arguments.get("uri") {
            None => {
                return Ok(vec![ChatMessage::tool_result(
                    call,
                    "required parameter uri is missing",
                )])
            }
            Some(value) => match value.as_str() {
                Some(uri) => uri,
                None => {
                    return Ok(vec![ChatMessage::tool_result(
                        call,
                        "required parameter uri can not be cast to a string",
                    )])
                }
            },
        };

        let Some(binding) = self.route(uri) else {
            tracing::debug!(%uri, call_id = %call.id, "no resource source matches");
            return Ok(vec![ChatMessage::tool_result(
                call,
                format!("no resource service found for uri {uri}"),
            )]);
        };

        tracing::debug!(%uri, source = binding.source.source_name(), call_id = %call.id, "routing resource read");
        binding.source.read_resource(call, uri).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
