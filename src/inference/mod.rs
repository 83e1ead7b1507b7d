//! Inference Client: streaming chat against a local Ollama endpoint.
//!
//! This module handles all communication with the model:
//! - The [`ChatModel`] trait the conversation driver talks to
//! - The Ollama `/api/chat` implementation
//! - NDJSON stream parsing into [`ChatChunk`]s
//! - Message, tool-call and tool-definition types

pub mod client;
pub mod errors;
pub mod streaming;
pub mod types;

// Re-exports for convenience
pub use client::{ChatModel, ChatStream, OllamaClient};
pub use errors::InferenceError;
pub use types::{
    ChatChunk, ChatMessage, ChatRequest, FunctionDefinition, PropertyType, Role, ToolCall,
    ToolCallFunction, ToolDefinition, ToolFunctionParameters, ToolProperty,
};
