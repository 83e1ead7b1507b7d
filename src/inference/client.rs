//! Ollama chat client.
//!
//! Sends chat requests to a local Ollama endpoint and streams back content,
//! thinking text, tool calls and token counts. The conversation driver only
//! sees the [`ChatModel`] trait, so any other backend (or a scripted fake in
//! tests) can stand in.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client as HttpClient;
use serde::Serialize;

use super::errors::InferenceError;
use super::streaming::parse_ndjson_stream;
use super::types::{ChatChunk, ChatRequest};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest silence tolerated while waiting for the response or its next
/// bytes. There is no bound on the whole answer.
///
/// Local models can take a long time to process a large context before the
/// first token arrives.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

// ─── ChatModel ───────────────────────────────────────────────────────────────

/// Stream of response chunks for one chat request.
pub type ChatStream = BoxStream<'static, Result<ChatChunk, InferenceError>>;

/// A chat-completion endpoint that streams its answer.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream, InferenceError>;
}

// ─── OllamaClient ────────────────────────────────────────────────────────────

/// Request body for `POST /api/chat`.
#[derive(Serialize)]
struct OllamaChatBody<'a> {
    #[serde(flatten)]
    request: &'a ChatRequest,
    stream: bool,
}

/// Client for the Ollama `/api/chat` endpoint.
pub struct OllamaClient {
    http: HttpClient,
    base_url: String,
}

impl OllamaClient {
    /// Create a client. Does NOT check connectivity; that happens on the
    /// first request.
    pub fn new(base_url: &str) -> Result<Self, InferenceError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConfigError {
                reason: format!("failed to build streaming HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }
}

#[async_trait]
impl ChatModel for OllamaClient {
    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream, InferenceError> {
        let url = self.chat_url();

        // Log the request metadata, not the body.
        tracing::info!(
            url = %url,
            model = %request.model,
            message_count = request.messages.len(),
            tool_count = request.tools.len(),
            "=== LLM REQUEST ==="
        );

        let body = OllamaChatBody {
            request: &request,
            stream: true,
        };

        let sent = tokio::time::timeout(
            STREAM_IDLE_TIMEOUT,
            self.http.post(&url).json(&body).send(),
        )
        .await
        .map_err(|_| InferenceError::Timeout {
            duration_secs: STREAM_IDLE_TIMEOUT.as_secs(),
        })?;
        let response = sent.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: CONNECT_TIMEOUT.as_secs(),
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        Ok(parse_ndjson_stream(response.bytes_stream(), STREAM_IDLE_TIMEOUT).boxed())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
