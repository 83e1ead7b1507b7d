//! Line-delimited JSON-RPC transport over arbitrary byte streams.
//!
//! The same bridge serves local subprocesses (child stdin/stdout) and
//! containers (demultiplexed attach streams). It handles:
//! - Writing one JSON object per line and flushing
//! - Reading lines until the response with the matching `id` arrives
//! - Answering server-initiated requests (`ping`) and logging notifications
//! - Pumping an optional stderr stream into the log

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::{error_codes, JsonRpcRequest, JsonRpcResponse};

/// Read half handed to the transport.
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
/// Write half handed to the transport.
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// How long `close` waits for the stderr pump to drain.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC channel over one reader and one writer.
pub struct Transport {
    server_name: String,
    /// `None` once closed.
    writer: Mutex<Option<BoxedWriter>>,
    reader: Mutex<BufReader<BoxedReader>>,
    stderr_pump: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    pub fn new(server_name: &str, reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(BufReader::new(reader)),
            stderr_pump: Mutex::new(None),
        }
    }

    /// Also forward every line of `stderr` to the log. `verbose` logs at
    /// info instead of debug.
    pub fn with_stderr(self, stderr: BoxedReader, verbose: bool) -> Self {
        let server = self.server_name.clone();
        let pump = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if verbose => {
                        tracing::info!(server = %server, "{line}");
                    }
                    Ok(Some(line)) => {
                        tracing::debug!(server = %server, "{line}");
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(server = %server, error = %e, "stderr read failed");
                        break;
                    }
                }
            }
        });
        Self {
            stderr_pump: Mutex::new(Some(pump)),
            ..self
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Write one frame as a single line.
    pub async fn send_frame(&self, frame: &Value) -> Result<(), McpError> {
        let mut json = serde_json::to_string(frame)
            .map_err(|e| self.transport_error(format!("failed to serialize frame: {e}")))?;
        json.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| self.transport_error("transport is closed"))?;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write frame: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush frame: {e}")))?;
        Ok(())
    }

    /// Read the next JSON object, skipping blank and non-JSON lines.
    pub async fn receive_frame(&self) -> Result<Value, McpError> {
        let mut reader = self.reader.lock().await;
        self.read_frame(&mut reader).await
    }

    async fn read_frame(&self, reader: &mut BufReader<BoxedReader>) -> Result<Value, McpError> {
        let mut line_buf = String::new();
        loop {
            line_buf.clear();
            let bytes_read = reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| self.transport_error(format!("failed to read frame: {e}")))?;

            if bytes_read == 0 {
                return Err(self.transport_error("server stream closed (backend may have exited)"));
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<Value>(trimmed) {
                Ok(frame @ Value::Object(_)) => return Ok(frame),
                _ => {
                    // Servers sometimes log to stdout.
                    tracing::debug!(server = %self.server_name, line = trimmed, "skipping non-JSON-RPC line");
                }
            }
        }
    }

    /// Send a request and wait for the matching response.
    ///
    /// The reader stays locked for the whole exchange so concurrent callers
    /// cannot consume each other's responses.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let frame = serde_json::to_value(&req)
            .map_err(|e| self.transport_error(format!("failed to serialize request: {e}")))?;

        let mut reader = self.reader.lock().await;
        self.send_frame(&frame).await?;

        loop {
            let frame = self.read_frame(&mut reader).await?;

            if let Some(incoming) = frame.get("method").and_then(Value::as_str) {
                self.handle_incoming(incoming, &frame).await?;
                continue;
            }

            if frame.get("id").and_then(Value::as_u64) != Some(id) {
                tracing::debug!(server = %self.server_name, expected = id, "skipping response for another request");
                continue;
            }

            let response: JsonRpcResponse = serde_json::from_value(frame).map_err(|e| {
                McpError::InvalidResponse {
                    server: self.server_name.clone(),
                    method: method.to_string(),
                    reason: e.to_string(),
                }
            })?;
            return extract_result(response);
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }
        self.send_frame(&notification).await
    }

    /// Server-to-client traffic: answer requests, log notifications.
    async fn handle_incoming(&self, method: &str, frame: &Value) -> Result<(), McpError> {
        let Some(id) = frame.get("id").cloned() else {
            tracing::debug!(server = %self.server_name, method, "server notification");
            return Ok(());
        };

        let reply = if method == "ping" {
            serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}})
        } else {
            tracing::debug!(server = %self.server_name, method, "rejecting server request");
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {
                    "code": error_codes::METHOD_NOT_FOUND,
                    "message": format!("method not supported by client: {method}"),
                },
            })
        };
        self.send_frame(&reply).await
    }

    /// Close the write half so the backend sees end-of-input, then let the
    /// stderr pump drain. Safe to call more than once.
    pub async fn close(&self) -> Result<(), McpError> {
        let writer = self.writer.lock().await.take();
        let result = match writer {
            Some(mut w) => w
                .shutdown()
                .await
                .map_err(|e| self.transport_error(format!("failed to close input: {e}"))),
            None => Ok(()),
        };

        if let Some(mut pump) = self.stderr_pump.lock().await.take() {
            if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut pump).await.is_err() {
                pump.abort();
            }
        }

        result
    }

    fn transport_error(&self, reason: impl Into<String>) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason: reason.into(),
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
