//! MCP Client: one protocol session over one transport.
//!
//! Performs the `initialize` handshake once, then offers the discovery calls
//! (`tools/list`, `resources/list`, `resources/templates/list`, following
//! `nextCursor` pagination) and the invocation calls (`tools/call`,
//! `resources/read`).

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::OnceCell;

use super::errors::McpError;
use super::transport::Transport;
use super::types::{
    CallToolResult, InitializeResult, McpResource, McpResourceTemplate, McpToolDefinition,
    ReadResourceResult, PROTOCOL_VERSION,
};

/// Upper bound on pages followed by one list call.
const MAX_LIST_PAGES: usize = 64;

/// A protocol session bound to a single backend.
pub struct McpClient {
    name: String,
    transport: Arc<Transport>,
    session: OnceCell<InitializeResult>,
}

impl McpClient {
    pub fn new(name: &str, transport: Arc<Transport>) -> Self {
        Self {
            name: name.to_string(),
            transport,
            session: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    // ─── Handshake ───────────────────────────────────────────────────────

    /// Run the handshake on first use; later calls return the cached result.
    pub async fn initialize(&self) -> Result<&InitializeResult, McpError> {
        self.session
            .get_or_try_init(|| async {
                let params = serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                });

                let raw = self
                    .transport
                    .request("initialize", Some(params))
                    .await
                    .map_err(|e| McpError::InitFailed {
                        name: self.name.clone(),
                        reason: e.to_string(),
                    })?;
                let result: InitializeResult = self.decode("initialize", raw)?;

                self.transport
                    .notify("notifications/initialized", None)
                    .await?;

                tracing::info!(
                    server = %self.name,
                    protocol_version = %result.protocol_version,
                    remote = result.server_info.as_ref().map(|s| s.name.as_str()).unwrap_or(""),
                    has_resources = result.capabilities.resources.is_some(),
                    "MCP session initialized"
                );
                Ok(result)
            })
            .await
    }

    pub fn is_initialized(&self) -> bool {
        self.session.initialized()
    }

    // ─── Discovery ───────────────────────────────────────────────────────

    pub async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        self.list_paginated("tools/list", "tools").await
    }

    pub async fn list_resources(&self) -> Result<Vec<McpResource>, McpError> {
        self.list_paginated("resources/list", "resources").await
    }

    pub async fn list_resource_templates(&self) -> Result<Vec<McpResourceTemplate>, McpError> {
        self.list_paginated("resources/templates/list", "resourceTemplates")
            .await
    }

    async fn list_paginated<T: DeserializeOwned>(
        &self,
        method: &str,
        field: &str,
    ) -> Result<Vec<T>, McpError> {
        self.initialize().await?;

        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let mut page = self.transport.request(method, params).await?;

            let entries = page.get_mut(field).map(Value::take).unwrap_or(Value::Array(vec![]));
            let mut decoded: Vec<T> = self.decode(method, entries)?;
            items.append(&mut decoded);

            cursor = page
                .get("nextCursor")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            if cursor.is_none() {
                return Ok(items);
            }
        }

        tracing::warn!(server = %self.name, method, "stopped following nextCursor after {MAX_LIST_PAGES} pages");
        Ok(items)
    }

    // ─── Invocation ──────────────────────────────────────────────────────

    /// Call one operation. A JSON-RPC error comes back as `McpError::ServerError`.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        self.initialize().await?;
        let arguments = if arguments.is_null() {
            Value::Object(Default::default())
        } else {
            arguments
        };
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let raw = self.transport.request("tools/call", Some(params)).await?;
        self.decode("tools/call", raw)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        self.initialize().await?;
        let params = serde_json::json!({ "uri": uri });
        let raw = self.transport.request("resources/read", Some(params)).await?;
        self.decode("resources/read", raw)
    }

    /// Close the write half of the transport.
    pub async fn close(&self) -> Result<(), McpError> {
        self.transport.close().await
    }

    fn decode<T: DeserializeOwned>(&self, method: &str, raw: Value) -> Result<T, McpError> {
        serde_json::from_value(raw).map_err(|e| McpError::InvalidResponse {
            server: self.name.clone(),
            method: method.to_string(),
            reason: e.to_string(),
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
