//! NDJSON streaming response parser for Ollama `/api/chat`.
//!
//! Reads the HTTP body as a byte stream, splits it on newlines, parses each
//! line as one response object and turns it into a [`ChatChunk`]. Bytes are
//! buffered until a full line is available, so multi-byte characters split
//! across network chunks survive intact.

use std::fmt::Display;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use super::errors::InferenceError;
use super::types::{ChatChunk, ToolCall};

// ─── Wire Types ──────────────────────────────────────────────────────────────

/// One line of the `/api/chat` stream.
#[derive(Debug, Deserialize)]
struct ChatResponseLine {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: String,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

// ─── NDJSON line parser ──────────────────────────────────────────────────────

/// Parse a raw NDJSON byte stream into `ChatChunk`s.
///
/// Generic over the byte stream so the HTTP body and in-memory test streams
/// go through the same path. The stream ends with a timeout error once no
/// bytes arrive for `idle`; a long answer that keeps flowing is never cut.
pub fn parse_ndjson_stream<S, B, E>(
    byte_stream: S,
    idle: Duration,
) -> impl Stream<Item = Result<ChatChunk, InferenceError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    stream::unfold(
        (byte_stream, Vec::<u8>::new(), false),
        move |(mut byte_stream, mut buffer, finished)| async move {
            if finished {
                return None;
            }
            loop {
                if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match process_line(&line) {
                        Ok(Some(chunk)) => return Some((Ok(chunk), (byte_stream, buffer, false))),
                        Ok(None) => continue,
                        Err(e) => return Some((Err(e), (byte_stream, buffer, true))),
                    }
                }

                let Ok(next) = tokio::time::timeout(idle, byte_stream.next()).await else {
                    tracing::warn!(idle_secs = idle.as_secs(), "model stream went quiet");
                    return Some((
                        Err(InferenceError::Timeout {
                            duration_secs: idle.as_secs(),
                        }),
                        (byte_stream, buffer, true),
                    ));
                };
                match next {
                    Some(Ok(bytes)) => buffer.extend_from_slice(bytes.as_ref()),
                    Some(Err(e)) => {
                        return Some((
                            Err(InferenceError::StreamError {
                                reason: format!("stream read error: {e}"),
                            }),
                            (byte_stream, buffer, true),
                        ));
                    }
                    None => {
                        // Final line without a trailing newline.
                        let rest = std::mem::take(&mut buffer);
                        return match process_line(&rest) {
                            Ok(Some(chunk)) => Some((Ok(chunk), (byte_stream, buffer, true))),
                            Ok(None) => None,
                            Err(e) => Some((Err(e), (byte_stream, buffer, true))),
                        };
                    }
                }
            }
        },
    )
}

/// Parse a single NDJSON line. Blank lines yield `None`.
fn process_line(raw: &[u8]) -> Result<Option<ChatChunk>, InferenceError> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let parsed: ChatResponseLine =
        serde_json::from_str(line).map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse chunk: {e} (data: {line})"),
        })?;

    if let Some(message) = parsed.error {
        return Err(InferenceError::ModelError { message });
    }

    let message = parsed.message.unwrap_or_default();
    let mut tool_calls = message.tool_calls;
    for call in &mut tool_calls {
        call.ensure_id();
    }

    if parsed.done {
        tracing::debug!(
            done_reason = parsed.done_reason.as_deref().unwrap_or(""),
            prompt_eval_count = parsed.prompt_eval_count.unwrap_or(0),
            eval_count = parsed.eval_count.unwrap_or(0),
            "model stream finished"
        );
    }

    Ok(Some(ChatChunk {
        content: message.content,
        thinking: message.thinking,
        tool_calls,
        done: parsed.done,
        prompt_eval_count: parsed.prompt_eval_count.unwrap_or(0),
        eval_count: parsed.eval_count.unwrap_or(0),
    }))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(
        parts: Vec<&'static str>,
    ) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> + Unpin {
        stream::iter(parts.into_iter().map(|p| Ok(p.as_bytes().to_vec())))
    }

    async fn collect(parts: Vec<&'static str>) -> Vec<Result<ChatChunk, InferenceError>> {
        parse_ndjson_stream(byte_stream(parts), Duration::from_secs(5))
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_content_split_across_network_chunks() {
        let chunks = collect(vec![
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hel",
            "lo\"},\"done\":false}\n{\"message\":{\"content\":\" world\"},\"done\":false}\n",
        ])
        .await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].as_ref().unwrap().content, "Hello");
        assert_eq!(chunks[1].as_ref().unwrap().content, " world");
    }

    #[tokio::test]
    async fn test_done_chunk_carries_token_counts() {
        let chunks = collect(vec![
            "{\"message\":{\"content\":\"\"},\"done\":true,\"done_reason\":\"stop\",\"prompt_eval_count\":42,\"eval_count\":7}",
        ])
        .await;
        let last = chunks[0].as_ref().unwrap();
        assert!(last.done);
        assert_eq!(last.prompt_eval_count, 42);
        assert_eq!(last.eval_count, 7);
    }

    #[tokio::test]
    async fn test_tool_calls_get_ids() {
        let chunks = collect(vec![
            "{\"message\":{\"content\":\"\",\"tool_calls\":[{\"function\":{\"name\":\"files.read\",\"arguments\":{\"path\":\"a.txt\"}}},{\"id\":\"given\",\"function\":{\"name\":\"files.list\",\"arguments\":{}}}]},\"done\":false}\n",
        ])
        .await;
        let calls = &chunks[0].as_ref().unwrap().tool_calls;
        assert_eq!(calls.len(), 2);
        assert!(calls[0].id.starts_with("call_"));
        assert_eq!(calls[0].function.arguments["path"], "a.txt");
        assert_eq!(calls[1].id, "given");
    }

    #[tokio::test]
    async fn test_thinking_is_separate_from_content() {
        let chunks = collect(vec![
            "{\"message\":{\"content\":\"\",\"thinking\":\"let me see\"},\"done\":false}\n",
        ])
        .await;
        let chunk = chunks[0].as_ref().unwrap();
        assert_eq!(chunk.thinking, "let me see");
        assert!(chunk.content.is_empty());
    }

    #[tokio::test]
    async fn test_error_line_ends_stream() {
        let chunks = collect(vec![
            "{\"error\":\"model 'x' not found\"}\n{\"message\":{\"content\":\"never\"}}\n",
        ])
        .await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0], Err(InferenceError::ModelError { .. })));
    }

    #[tokio::test]
    async fn test_blank_lines_skipped() {
        let chunks = collect(vec!["\n\n{\"message\":{\"content\":\"x\"}}\n\n"]).await;
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_garbage_line_is_stream_error() {
        let chunks = collect(vec!["not json\n"]).await;
        assert!(matches!(chunks[0], Err(InferenceError::StreamError { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_times_out() {
        let stalled =
            byte_stream(vec!["{\"message\":{\"content\":\"Hi\"}}\n"]).chain(stream::pending());
        let chunks: Vec<_> = parse_ndjson_stream(stalled, Duration::from_secs(30))
            .collect()
            .await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].as_ref().unwrap().content, "Hi");
        assert!(matches!(chunks[1], Err(InferenceError::Timeout { duration_secs: 30 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_steady_stream_outlives_idle_limit() {
        // Ten parts, 20s apart: 200s in total against a 30s idle limit.
        let parts = (0..10).map(|i| format!("{{\"message\":{{\"content\":\"{i}\"}}}}\n"));
        let slow = Box::pin(stream::iter(parts).then(|part| async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            Ok::<_, std::io::Error>(part.into_bytes())
        }));
        let chunks: Vec<_> = parse_ndjson_stream(slow, Duration::from_secs(30))
            .collect()
            .await;
        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().all(|c| c.is_ok()));
        assert_eq!(chunks[9].as_ref().unwrap().content, "9");
    }
}
