//! Agent Core: drives a conversation between the model and the tools.
//!
//! Submodules:
//! - `conversation`: Append-only message history
//! - `driver`: The streaming turn loop, token accounting and progress events
//! - `errors`: Agent-level error types

pub mod conversation;
pub mod driver;
pub mod errors;

// Re-exports for convenience
pub use conversation::Conversation;
pub use driver::{ConversationDriver, DriverEvent, TokenUsage, DEFAULT_MAX_TURNS};
pub use errors::AgentError;
