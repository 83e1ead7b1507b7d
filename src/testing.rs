//! In-memory fakes shared by the unit tests.
//!
//! `FakeServer` speaks just enough MCP over a pair of pipes to exercise
//! discovery, invocation and resource reads. `FakeRuntime` stands in for the
//! container engine and records every call. `ScriptedModel` replays canned
//! chat responses.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use tokio::io::{
    duplex, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::task::JoinHandle;

use crate::backend::runtime::{
    ContainerAttachment, ContainerRunConfig, ContainerRuntime, OutputFrame, RuntimeError,
    StdStream,
};
use crate::inference::{ChatChunk, ChatModel, ChatRequest, ChatStream, InferenceError};
use crate::mcp_client::transport::Transport;

// ─── Fake MCP server ─────────────────────────────────────────────────────────

/// What a fake backend advertises and how it answers.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeCatalog {
    label: String,
    instructions: Option<String>,
    tools: Vec<Value>,
    resources: Vec<(Value, String)>,
    templates: Vec<Value>,
    extra_contents: Vec<Value>,
    page_size: Option<usize>,
    raw_initialize: Option<Value>,
    advertise_resources: bool,
    empty_reads: bool,
}

impl FakeCatalog {
    /// Prefix for every text this backend produces, so tests can tell
    /// backends apart.
    pub fn labelled(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ..Self::default()
        }
    }

    pub fn with_instructions(mut self, text: &str) -> Self {
        self.instructions = Some(text.to_string());
        self
    }

    pub fn with_tool(mut self, name: &str, description: &str, schema: Value) -> Self {
        self.tools.push(json!({
            "name": name,
            "description": description,
            "inputSchema": schema,
        }));
        self
    }

    pub fn with_resource(mut self, uri: &str, name: &str, description: &str, text: &str) -> Self {
        self.resources.push((
            json!({"uri": uri, "name": name, "description": description, "mimeType": "text/plain"}),
            text.to_string(),
        ));
        self.advertise_resources = true;
        self
    }

    pub fn with_template(mut self, template: &str, name: &str, description: &str) -> Self {
        self.templates.push(json!({
            "uriTemplate": template,
            "name": name,
            "description": description,
        }));
        self.advertise_resources = true;
        self
    }

    /// Append these raw content objects to every `resources/read` answer.
    pub fn with_extra_contents(mut self, contents: Vec<Value>) -> Self {
        self.extra_contents = contents;
        self
    }

    /// Answer every `resources/read` with no contents at all.
    pub fn with_empty_reads(mut self) -> Self {
        self.empty_reads = true;
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn with_raw_initialize(mut self, result: Value) -> Self {
        self.raw_initialize = Some(result);
        self
    }

    /// `Ok(None)` means "never answer".
    fn answer(&self, method: &str, params: &Value) -> Result<Option<Value>, (i32, String)> {
        match method {
            "initialize" => {
                if let Some(raw) = &self.raw_initialize {
                    return Ok(Some(raw.clone()));
                }
                let mut capabilities = json!({"tools": {}});
                if self.advertise_resources {
                    capabilities["resources"] = json!({});
                }
                let mut result = json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": capabilities,
                    "serverInfo": {"name": format!("fake-{}", self.label), "version": "0.0.1"},
                });
                if let Some(text) = &self.instructions {
                    result["instructions"] = json!(text);
                }
                Ok(Some(result))
            }
            "tools/list" => Ok(Some(self.page(&self.tools, "tools", params))),
            "resources/list" => {
                let defs: Vec<Value> = self.resources.iter().map(|(d, _)| d.clone()).collect();
                Ok(Some(self.page(&defs, "resources", params)))
            }
            "resources/templates/list" => {
                Ok(Some(self.page(&self.templates, "resourceTemplates", params)))
            }
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or_default();
                match name {
                    "explode" => Err((-32000, format!("{name} failed"))),
                    "hang" => Ok(None),
                    _ => Ok(Some(json!({
                        "content": [
                            {"type": "text", "text": format!("{}:{}:{}", self.label, name, params["arguments"])},
                            {"type": "image", "data": "AAAA", "mimeType": "image/png"},
                        ],
                        "isError": false,
                    }))),
                }
            }
            "resources/read" if self.empty_reads => Ok(Some(json!({ "contents": [] }))),
            "resources/read" => {
                let uri = params["uri"].as_str().unwrap_or_default();
                let text = self
                    .resources
                    .iter()
                    .find(|(d, _)| d["uri"] == uri)
                    .map(|(_, t)| t.clone())
                    .unwrap_or_else(|| format!("{}:{}", self.label, uri));
                let mut contents = vec![json!({"uri": uri, "mimeType": "text/plain", "text": text})];
                contents.extend(self.extra_contents.iter().cloned());
                Ok(Some(json!({ "contents": contents })))
            }
            other => Err((-32601, format!("method not found: {other}"))),
        }
    }

    fn page(&self, all: &[Value], field: &str, params: &Value) -> Value {
        let start: usize = params["cursor"]
            .as_str()
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let size = self.page_size.unwrap_or(usize::MAX);
        let end = start.saturating_add(size).min(all.len());
        let mut page = serde_json::Map::new();
        page.insert(field.to_string(), Value::Array(all[start..end].to_vec()));
        if end < all.len() {
            page.insert("nextCursor".into(), json!(end.to_string()));
        }
        Value::Object(page)
    }
}

/// A running fake server task.
pub(crate) struct FakeServer {
    handle: JoinHandle<Vec<String>>,
}

impl FakeServer {
    /// Serve `catalog`, reading requests from `input` and answering on `output`.
    pub fn serve<R, W>(catalog: FakeCatalog, input: R, mut output: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut lines = BufReader::new(input).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(frame) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                let method = frame["method"].as_str().unwrap_or_default().to_string();
                seen.push(method.clone());
                let Some(id) = frame.get("id").cloned() else {
                    continue;
                };
                let reply = match catalog.answer(&method, &frame["params"]) {
                    Ok(Some(result)) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                    Ok(None) => continue,
                    Err((code, message)) => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": code, "message": message},
                    }),
                };
                if output.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                    break;
                }
                let _ = output.flush().await;
            }
            seen
        });
        Self { handle }
    }

    /// Serve `catalog` on in-memory pipes and return a transport bound to it.
    pub fn connected(name: &str, catalog: FakeCatalog) -> (Self, Transport) {
        let (client_out, server_in) = duplex(64 * 1024);
        let (server_out, client_in) = duplex(64 * 1024);
        let server = Self::serve(catalog, server_in, server_out);
        let transport = Transport::new(name, Box::pin(client_in), Box::pin(client_out));
        (server, transport)
    }

    /// Wait for the client to hang up; returns every method received.
    pub async fn finish(self) -> Vec<String> {
        self.handle.await.unwrap_or_default()
    }
}

// ─── Fake container runtime ──────────────────────────────────────────────────

/// Which step of the container lifecycle should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailAt {
    Inspect,
    Pull,
    Create,
    Attach,
    Start,
    Stop,
}

#[derive(Debug, Default)]
struct RuntimeLog {
    calls: Vec<String>,
    created: Vec<ContainerRunConfig>,
    servers: Vec<JoinHandle<Vec<String>>>,
}

/// Records every runtime call. Attached containers run a `FakeServer`
/// whose stdout is framed like the engine's multiplexed attach stream.
pub(crate) struct FakeRuntime {
    image_present: bool,
    fail_at: Option<FailAt>,
    remove_not_found: bool,
    stderr_lines: Vec<String>,
    catalog: FakeCatalog,
    log: Mutex<RuntimeLog>,
}

impl FakeRuntime {
    pub fn new(catalog: FakeCatalog) -> Self {
        Self {
            image_present: true,
            fail_at: None,
            remove_not_found: false,
            stderr_lines: Vec::new(),
            catalog,
            log: Mutex::new(RuntimeLog::default()),
        }
    }

    pub fn without_image(mut self) -> Self {
        self.image_present = false;
        self
    }

    pub fn failing_at(mut self, step: FailAt) -> Self {
        self.fail_at = Some(step);
        self
    }

    /// Remove reports "not found", as if auto-remove already ran.
    pub fn auto_removed(mut self) -> Self {
        self.remove_not_found = true;
        self
    }

    pub fn with_stderr(mut self, line: &str) -> Self {
        self.stderr_lines.push(line.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().map(|l| l.calls.clone()).unwrap_or_default()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn created(&self) -> Vec<ContainerRunConfig> {
        self.log.lock().map(|l| l.created.clone()).unwrap_or_default()
    }

    /// Methods the containerised fake servers received.
    pub async fn served_methods(&self) -> Vec<String> {
        let handles = self
            .log
            .lock()
            .map(|mut l| std::mem::take(&mut l.servers))
            .unwrap_or_default();
        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap_or_default());
        }
        all
    }

    fn record(&self, call: &str, step: FailAt) -> Result<(), RuntimeError> {
        if let Ok(mut log) = self.log.lock() {
            log.calls.push(call.to_string());
        }
        if self.fail_at == Some(step) {
            return Err(RuntimeError::Api {
                reason: format!("{call} refused"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn inspect_image(&self, _image: &str) -> Result<(), RuntimeError> {
        self.record("inspect", FailAt::Inspect)?;
        if self.image_present {
            Ok(())
        } else {
            Err(RuntimeError::NotFound {
                reason: "no such image".into(),
            })
        }
    }

    async fn pull_image(&self, _image: &str) -> Result<(), RuntimeError> {
        self.record("pull", FailAt::Pull)
    }

    async fn create_container(&self, config: &ContainerRunConfig) -> Result<String, RuntimeError> {
        self.record("create", FailAt::Create)?;
        if let Ok(mut log) = self.log.lock() {
            log.created.push(config.clone());
        }
        Ok("c0ffee".into())
    }

    async fn attach_container(&self, _id: &str) -> Result<ContainerAttachment, RuntimeError> {
        self.record("attach", FailAt::Attach)?;

        let (input, server_in) = duplex(64 * 1024);
        let (server_out, stdout) = duplex(64 * 1024);
        let server = FakeServer::serve(self.catalog.clone(), server_in, server_out);
        if let Ok(mut log) = self.log.lock() {
            log.servers.push(server.handle);
        }

        let stderr = stream::iter(self.stderr_lines.clone()).map(|line| {
            Ok(OutputFrame {
                stream: StdStream::Stderr,
                payload: format!("{line}\n").into_bytes(),
            })
        });
        let output = stderr.chain(frames_from(stdout, StdStream::Stdout)).boxed();

        Ok(ContainerAttachment {
            output,
            input: Box::pin(input),
        })
    }

    async fn start_container(&self, _id: &str) -> Result<(), RuntimeError> {
        self.record("start", FailAt::Start)
    }

    async fn stop_container(&self, _id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.record("stop", FailAt::Stop)
    }

    async fn remove_container(&self, _id: &str) -> Result<(), RuntimeError> {
        if let Ok(mut log) = self.log.lock() {
            log.calls.push("remove".into());
        }
        if self.remove_not_found {
            return Err(RuntimeError::NotFound {
                reason: "no such container".into(),
            });
        }
        Ok(())
    }
}

/// Turn a byte reader into engine-style output frames.
fn frames_from<R>(reader: R, kind: StdStream) -> BoxStream<'static, Result<OutputFrame, RuntimeError>>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    stream::unfold(reader, move |mut reader| async move {
        let mut buf = vec![0u8; 4096];
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((
                    Ok(OutputFrame {
                        stream: kind,
                        payload: buf,
                    }),
                    reader,
                ))
            }
        }
    })
    .boxed()
}

// ─── Scripted chat model ─────────────────────────────────────────────────────

/// Replays one canned response (a list of chunks) per request and keeps
/// every request it saw.
pub(crate) struct ScriptedModel {
    responses: Mutex<VecDeque<Vec<ChatChunk>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<Vec<ChatChunk>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream, InferenceError> {
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request);
        }
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front())
            .ok_or_else(|| InferenceError::StreamError {
                reason: "script exhausted".into(),
            })?;
        Ok(stream::iter(next.into_iter().map(Ok)).boxed())
    }
}

/// A model that never finishes its response.
pub(crate) struct StalledModel;

#[async_trait]
impl ChatModel for StalledModel {
    async fn chat_stream(&self, _request: ChatRequest) -> Result<ChatStream, InferenceError> {
        Ok(stream::pending().boxed())
    }
}

/// Text chunk.
pub(crate) fn text(content: &str) -> ChatChunk {
    ChatChunk {
        content: content.to_string(),
        ..ChatChunk::default()
    }
}

/// Final chunk with token counts.
pub(crate) fn done(prompt: u64, eval: u64) -> ChatChunk {
    ChatChunk {
        done: true,
        prompt_eval_count: prompt,
        eval_count: eval,
        ..ChatChunk::default()
    }
}
