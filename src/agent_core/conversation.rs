//! Conversation: the ordered message history of one run.
//!
//! Only ever appended to. Tool results follow the assistant message that
//! requested them, tagged with the call id.

use crate::inference::{ChatMessage, Role};

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a system prompt, the tools' instructions, then the user's
    /// question.
    pub fn start(system_prompt: &str, instructions: &[ChatMessage], question: &str) -> Self {
        let mut conversation = Self::new();
        if !system_prompt.is_empty() {
            conversation.push(ChatMessage::system(system_prompt));
        }
        conversation.extend(instructions.iter().cloned());
        conversation.push(ChatMessage::user(question));
        conversation
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = ChatMessage>) {
        self.messages.extend(messages);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn count_role(&self, role: Role) -> usize {
        self.messages.iter().filter(|m| m.role == role).count()
    }

    /// Content of the most recent assistant message.
    pub fn final_answer(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }
}
