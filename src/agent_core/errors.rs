//! Agent Core error types.

use thiserror::Error;

use crate::errors::ErrorList;
use crate::inference::InferenceError;
use crate::toolset::ToolError;

/// Errors that end a conversation run.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The model could not be reached or its stream broke.
    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),

    /// One or more tool calls of the last turn failed hard. Results of the
    /// other calls are already in the conversation.
    #[error("tool dispatch failed: {0}")]
    ToolDispatch(ErrorList<ToolError>),

    /// The model kept requesting tools after the last allowed turn.
    #[error("turn limit of {max_turns} reached with tool calls still pending")]
    TurnLimitExceeded { max_turns: usize },

    /// The caller cancelled the run.
    #[error("conversation cancelled")]
    Cancelled,
}
