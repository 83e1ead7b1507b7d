//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur while talking to one MCP backend.
#[derive(Debug, Error)]
pub enum McpError {
    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// Frame-level communication error (I/O, closed stream, unserializable frame).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A result arrived but did not have the expected shape.
    #[error("invalid '{method}' response from server '{server}': {reason}")]
    InvalidResponse {
        server: String,
        method: String,
        reason: String,
    },

    /// A request did not complete in time.
    #[error("'{operation}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },
}

impl McpError {
    /// Whether the backend itself reported the failure, as opposed to the
    /// orchestrator being unable to talk to it.
    pub fn is_reported_by_backend(&self) -> bool {
        matches!(self, McpError::ServerError { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_server_errors_are_backend_reported() {
        let server = McpError::ServerError {
            code: -32602,
            message: "bad params".into(),
            data: None,
        };
        let transport = McpError::TransportError {
            server: "files".into(),
            reason: "stream closed".into(),
        };
        assert!(server.is_reported_by_backend());
        assert!(!transport.is_reported_by_backend());
    }
}
