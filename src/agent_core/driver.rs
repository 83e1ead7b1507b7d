//! Conversation driver: the model/tool turn loop.
//!
//! Each turn sends the whole history plus the tool definitions, streams the
//! answer, appends it, and dispatches the requested tool calls in order.
//! The loop ends when a turn requests no tools, when a dispatch fails hard,
//! when the turn limit is hit, or when the caller cancels.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::conversation::Conversation;
use super::errors::AgentError;
use crate::errors::ErrorList;
use crate::inference::{ChatMessage, ChatModel, ChatRequest, ChatStream, ToolCall};
use crate::toolset::ToolSet;

/// Default upper bound on model turns per run.
pub const DEFAULT_MAX_TURNS: usize = 16;

/// Token counts reported by the model, summed over turns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt: u64,
    pub response: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt + self.response
    }
}

/// Progress notifications for whoever renders the run.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// One complete line of visible model output.
    ContentLine(String),
    ThinkingLine(String),
    ToolCall(ToolCall),
    ToolResults(Vec<ChatMessage>),
    TurnFinished { turn: usize, usage: TokenUsage },
}

/// What one streamed response produced.
#[derive(Debug, Default)]
struct TurnOutput {
    content: String,
    thinking: String,
    calls: Vec<ToolCall>,
}

pub struct ConversationDriver {
    model: Arc<dyn ChatModel>,
    toolset: Arc<ToolSet>,
    model_name: String,
    max_turns: usize,
    usage: TokenUsage,
    events: Option<mpsc::UnboundedSender<DriverEvent>>,
}

impl ConversationDriver {
    pub fn new(model: Arc<dyn ChatModel>, toolset: Arc<ToolSet>, model_name: &str) -> Self {
        Self {
            model,
            toolset,
            model_name: model_name.to_string(),
            max_turns: DEFAULT_MAX_TURNS,
            usage: TokenUsage::default(),
            events: None,
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<DriverEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    /// Run turns until the model stops calling tools. Returns the number of
    /// turns taken. Whatever was appended before a failure stays in
    /// `conversation`.
    pub async fn run(
        &mut self,
        conversation: &mut Conversation,
        cancel: &CancellationToken,
    ) -> Result<usize, AgentError> {
        for turn in 1..=self.max_turns {
            tracing::info!(
                turn,
                message_count = conversation.len(),
                tool_count = self.toolset.definitions().len(),
                "=== TURN START ==="
            );

            let output = self.stream_turn(conversation, cancel).await?;
            let calls = output.calls.clone();

            tracing::info!(
                turn,
                content_len = output.content.len(),
                tool_calls = calls.len(),
                tool_names = ?calls.iter().map(ToolCall::name).collect::<Vec<_>>(),
                "=== MODEL RESPONSE ==="
            );

            conversation.push(ChatMessage::assistant(
                output.content,
                output.thinking,
                output.calls,
            ));
            self.emit(DriverEvent::TurnFinished {
                turn,
                usage: self.usage,
            });

            if calls.is_empty() {
                tracing::info!(
                    turns = turn,
                    prompt_tokens = self.usage.prompt,
                    response_tokens = self.usage.response,
                    "conversation complete"
                );
                return Ok(turn);
            }

            self.dispatch_all(&calls, conversation, cancel).await?;
        }

        tracing::warn!(max_turns = self.max_turns, "turn limit reached");
        Err(AgentError::TurnLimitExceeded {
            max_turns: self.max_turns,
        })
    }

    async fn stream_turn(
        &mut self,
        conversation: &Conversation,
        cancel: &CancellationToken,
    ) -> Result<TurnOutput, AgentError> {
        let request = ChatRequest {
            model: self.model_name.clone(),
            messages: conversation.messages().to_vec(),
            tools: self.toolset.definitions().to_vec(),
        };

        let mut stream: ChatStream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            opened = self.model.chat_stream(request) => opened?,
        };

        let mut output = TurnOutput::default();
        let mut content_line = String::new();
        let mut thinking_line = String::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;

            output.content.push_str(&chunk.content);
            for line in take_lines(&mut content_line, &chunk.content) {
                self.emit(DriverEvent::ContentLine(line));
            }
            output.thinking.push_str(&chunk.thinking);
            for line in take_lines(&mut thinking_line, &chunk.thinking) {
                self.emit(DriverEvent::ThinkingLine(line));
            }

            for mut call in chunk.tool_calls {
                call.ensure_id();
                output.calls.push(call);
            }

            if chunk.done {
                self.usage.prompt += chunk.prompt_eval_count;
                self.usage.response += chunk.eval_count;
                break;
            }
        }

        if !thinking_line.is_empty() {
            self.emit(DriverEvent::ThinkingLine(thinking_line));
        }
        if !content_line.is_empty() {
            self.emit(DriverEvent::ContentLine(content_line));
        }
        Ok(output)
    }

    /// Dispatch every call in order. Hard failures are collected and
    /// reported once all calls have been tried.
    async fn dispatch_all(
        &self,
        calls: &[ToolCall],
        conversation: &mut Conversation,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let mut errors = ErrorList::new();

        for call in calls {
            tracing::info!(call_id = %call.id, tool = %call.name(), arguments = %call.function.arguments, "dispatching tool call");
            self.emit(DriverEvent::ToolCall(call.clone()));

            let dispatched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                dispatched = self.toolset.dispatch(call) => dispatched,
            };

            match dispatched {
                Ok(results) => {
                    self.emit(DriverEvent::ToolResults(results.clone()));
                    conversation.extend(results);
                }
                Err(e) => {
                    tracing::warn!(call_id = %call.id, error = %e, "tool call failed");
                    errors.push(e);
                }
            }
        }

        errors.into_result().map_err(AgentError::ToolDispatch)
    }

    fn emit(&self, event: DriverEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver only means nobody is watching.
            let _ = events.send(event);
        }
    }
}

/// Append `delta` to `pending` and split off every completed line.
fn take_lines(pending: &mut String, delta: &str) -> Vec<String> {
    pending.push_str(delta);
    let mut lines = Vec::new();
    while let Some(pos) = pending.find('\n') {
        let line: String = pending.drain(..=pos).collect();
        lines.push(line.trim_end_matches(['\n', '\r']).to_string());
    }
    lines
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendSpec, ContainerRuntime, ContainerSpec};
    use crate::inference::{ChatChunk, Role};
    use crate::testing::{done, text, FakeCatalog, FakeRuntime, ScriptedModel, StalledModel};
    use crate::toolset::{DiscoveryPolicy, Tool, ToolDiscovery, ToolError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::PathBuf;

    async fn docs_toolset() -> Arc<ToolSet> {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(FakeRuntime::new(
            FakeCatalog::labelled("docs")
                .with_tool("search", "Search", json!({"type": "object"}))
                .with_tool("read_document", "Read", json!({"type": "object"})),
        ));
        let spec = BackendSpec::Container {
            spec: ContainerSpec {
                name: "docs".into(),
                image: "docs-mcp".into(),
                args: vec![],
                env: vec![],
                mounts: vec![],
                working_directory: PathBuf::from("/work"),
                verbose: false,
            },
            runtime,
        };
        Arc::new(
            ToolSet::build(vec![spec], DiscoveryPolicy::FailFast)
                .await
                .unwrap(),
        )
    }

    fn calls(calls: Vec<ToolCall>, prompt: u64, eval: u64) -> ChatChunk {
        ChatChunk {
            tool_calls: calls,
            done: true,
            prompt_eval_count: prompt,
            eval_count: eval,
            ..ChatChunk::default()
        }
    }

    #[tokio::test]
    async fn test_two_calls_then_answer() {
        let toolset = docs_toolset().await;
        let model = Arc::new(ScriptedModel::new(vec![
            vec![calls(
                vec![
                    ToolCall::new("1", "docs.search", json!({"q": "rust"})),
                    ToolCall::new("2", "docs.read_document", json!({"id": 4})),
                ],
                10,
                5,
            )],
            vec![text("The answer\nis "), text("42"), done(20, 7)],
        ]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut driver =
            ConversationDriver::new(model.clone(), toolset.clone(), "test-model").with_events(tx);
        let mut conversation = Conversation::start("", &[], "what is it?");

        let turns = driver
            .run(&mut conversation, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(turns, 2);
        let roles: Vec<_> = conversation.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Tool, Role::Assistant]
        );
        let messages = conversation.messages();
        assert_eq!(messages[1].tool_calls.len(), 2);
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("1"));
        assert_eq!(messages[2].content, r#"docs:search:{"q":"rust"}"#);
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("2"));
        assert_eq!(conversation.final_answer(), Some("The answer\nis 42"));
        assert_eq!(
            driver.usage(),
            TokenUsage {
                prompt: 30,
                response: 12
            }
        );

        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].model, "test-model");
        assert_eq!(requests[0].tools.len(), 2);
        assert_eq!(requests[1].messages.len(), 4);

        drop(driver);
        let mut lines = Vec::new();
        while let Some(event) = rx.recv().await {
            if let DriverEvent::ContentLine(line) = event {
                lines.push(line);
            }
        }
        assert_eq!(lines, vec!["The answer", "is 42"]);

        toolset.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_tool_does_not_stop_the_loop() {
        let toolset = docs_toolset().await;
        let model = Arc::new(ScriptedModel::new(vec![
            vec![calls(vec![ToolCall::new("", "ghost.op", json!({}))], 1, 1)],
            vec![text("sorry"), done(1, 1)],
        ]));
        let mut driver = ConversationDriver::new(model, toolset.clone(), "m");
        let mut conversation = Conversation::start("", &[], "q");

        assert_eq!(
            driver.run(&mut conversation, &CancellationToken::new()).await.unwrap(),
            2
        );
        let result = &conversation.messages()[2];
        assert_eq!(result.role, Role::Tool);
        assert_eq!(
            result.content,
            r#"{"error":"tool not found {name: \"ghost.op\"}"}"#
        );
        // The generated id pairs the call with its result.
        let call_id = &conversation.messages()[1].tool_calls[0].id;
        assert!(call_id.starts_with("call_"));
        assert_eq!(result.tool_call_id.as_ref(), Some(call_id));

        toolset.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_turn_limit() {
        let toolset = docs_toolset().await;
        let model = Arc::new(ScriptedModel::new(vec![
            vec![calls(vec![ToolCall::new("1", "docs.search", json!({}))], 1, 1)],
            vec![calls(vec![ToolCall::new("2", "docs.search", json!({}))], 1, 1)],
        ]));
        let mut driver = ConversationDriver::new(model.clone(), toolset.clone(), "m").with_max_turns(2);
        let mut conversation = Conversation::start("", &[], "q");

        let err = driver
            .run(&mut conversation, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::TurnLimitExceeded { max_turns: 2 }));
        assert_eq!(model.requests().len(), 2);
        assert_eq!(conversation.count_role(Role::Tool), 2);

        toolset.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_stream() {
        let toolset = Arc::new(ToolSet::new());
        let mut driver = ConversationDriver::new(Arc::new(StalledModel), toolset, "m");
        let mut conversation = Conversation::start("", &[], "q");

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = driver.run(&mut conversation, &cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert_eq!(conversation.len(), 1);
    }

    #[tokio::test]
    async fn test_model_failure_is_inference_error() {
        let mut driver = ConversationDriver::new(
            Arc::new(ScriptedModel::new(vec![])),
            Arc::new(ToolSet::new()),
            "m",
        );
        let mut conversation = Conversation::start("", &[], "q");
        let err = driver
            .run(&mut conversation, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Inference(_)));
    }

    /// Fails every operation named `bad.*` except `bad.ok`.
    struct Flaky;

    #[async_trait]
    impl Tool for Flaky {
        fn name(&self) -> &str {
            "bad"
        }

        async fn discover(&self) -> Result<ToolDiscovery, ToolError> {
            Ok(ToolDiscovery {
                definitions: ["bad.op", "bad.ok"]
                    .into_iter()
                    .map(|n| crate::inference::ToolDefinition::function(n, "", Default::default()))
                    .collect(),
                ..ToolDiscovery::default()
            })
        }

        async fn invoke(&self, call: &ToolCall) -> Result<Vec<ChatMessage>, ToolError> {
            if call.name() == "bad.ok" {
                return Ok(vec![ChatMessage::tool_result(call, "fine")]);
            }
            Err(ToolError::Timeout {
                tool: "bad".into(),
                operation: "tools/call op".into(),
                timeout_ms: 1,
            })
        }
    }

    #[tokio::test]
    async fn test_hard_errors_reported_after_all_calls() {
        let mut toolset = ToolSet::new();
        toolset.register(Arc::new(Flaky)).await.unwrap();
        let model = Arc::new(ScriptedModel::new(vec![vec![calls(
            vec![
                ToolCall::new("a", "bad.op", json!({})),
                ToolCall::new("b", "bad.ok", json!({})),
                ToolCall::new("c", "bad.op", json!({})),
            ],
            1,
            1,
        )]]));
        let mut driver = ConversationDriver::new(model, Arc::new(toolset), "m");
        let mut conversation = Conversation::start("", &[], "q");

        let err = driver
            .run(&mut conversation, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            AgentError::ToolDispatch(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(errors.to_string().contains("(id: a)"));
                assert!(errors.to_string().contains("(id: c)"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // The successful call's result stays in history.
        let last = conversation.last().unwrap();
        assert_eq!(last.tool_call_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_take_lines_keeps_partial_tail() {
        let mut pending = String::new();
        assert!(take_lines(&mut pending, "hel").is_empty());
        assert_eq!(take_lines(&mut pending, "lo\nwor"), vec!["hello"]);
        assert_eq!(pending, "wor");
        assert_eq!(take_lines(&mut pending, "ld\r\n\n"), vec!["world", ""]);
    }
}
