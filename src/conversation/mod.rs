//! Conversation types and prompt rendering
//!
//! A [`Conversation`] is built from scratch for every chat request and thrown
//! away once its prompt has been rendered. Adjacent turns from the same
//! speaker are merged, so user and assistant messages always alternate.

pub mod template;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use template::{PromptTemplate, TemplateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

impl Message {
    fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

/// Errors from the message accessors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationError {
    #[error("no messages in conversation")]
    Empty,

    #[error("no {0} messages in conversation")]
    NoMessageOfRole(Role),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Conversation {
    system_prompt: String,
    messages: Vec<Message>,
}

impl Conversation {
    /// Create a conversation, seeding the system slot when `system_prompt` is non-empty
    pub fn new(system_prompt: &str) -> Self {
        let mut conversation = Self::default();
        if !system_prompt.is_empty() {
            conversation.set_system_prompt(system_prompt);
        }
        conversation
    }

    /// Build a conversation from a submitted history.
    ///
    /// Even positions are user turns and odd positions are assistant turns.
    pub fn from_history<S: AsRef<str>>(system_prompt: &str, history: &[S]) -> Self {
        let mut conversation = Self::new(system_prompt);
        for (i, text) in history.iter().enumerate() {
            if i % 2 == 0 {
                conversation.add_user(text.as_ref());
            } else {
                conversation.add_assistant(text.as_ref());
            }
        }
        conversation
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// All messages except the leading system message, if there is one
    pub fn messages_without_system(&self) -> &[Message] {
        match self.messages.first() {
            Some(first) if first.role == Role::System => &self.messages[1..],
            _ => &self.messages,
        }
    }

    /// Set the system prompt. The system message always lives at index 0.
    pub fn set_system_prompt(&mut self, text: &str) {
        self.system_prompt = text.to_string();
        let message = Message::new(Role::System, text);
        match self.messages.first_mut() {
            Some(first) if first.role == Role::System => *first = message,
            _ => self.messages.insert(0, message),
        }
    }

    pub fn add_user(&mut self, text: &str) {
        self.add(Role::User, text);
    }

    pub fn add_assistant(&mut self, text: &str) {
        self.add(Role::Assistant, text);
    }

    fn add(&mut self, role: Role, text: &str) {
        match self.messages.last_mut() {
            Some(last) if last.role == role => {
                last.text.push('\n');
                last.text.push_str(text);
            }
            _ => self.messages.push(Message::new(role, text)),
        }
    }

    /// Replace the text of a trailing assistant message, or append one
    pub fn set_last_assistant(&mut self, text: &str) {
        match self.messages.last_mut() {
            Some(last) if last.role == Role::Assistant => last.text = text.to_string(),
            _ => self.messages.push(Message::new(Role::Assistant, text)),
        }
    }

    /// Append a streamed token to the trailing assistant message.
    ///
    /// Returns the fragment that was actually appended: leading whitespace is
    /// dropped while the assistant message is still empty.
    pub fn append_token(&mut self, token: &str) -> String {
        match self.messages.last_mut() {
            Some(last) if last.role == Role::Assistant => {
                trim_and_append(&mut last.text, token).to_string()
            }
            _ => {
                let mut text = String::new();
                let fragment = trim_and_append(&mut text, token).to_string();
                self.messages.push(Message::new(Role::Assistant, text));
                fragment
            }
        }
    }

    pub fn last_user_message(&self) -> Result<&str, ConversationError> {
        self.last_message_of(Role::User)
    }

    pub fn last_assistant_message(&self) -> Result<&str, ConversationError> {
        self.last_message_of(Role::Assistant)
    }

    // Roles alternate, so the target is at most one position from the end.
    fn last_message_of(&self, role: Role) -> Result<&str, ConversationError> {
        if self.messages.is_empty() {
            return Err(ConversationError::Empty);
        }
        self.messages
            .iter()
            .rev()
            .take(2)
            .find(|m| m.role == role)
            .map(|m| m.text.as_str())
            .ok_or(ConversationError::NoMessageOfRole(role))
    }

    /// Render this conversation into a model prompt
    pub fn render(&self, template: &dyn PromptTemplate) -> Result<String, TemplateError> {
        template.render(self)
    }
}

/// Append `token` to `accumulated`, left-trimming it while `accumulated` is empty.
///
/// Returns the part of `token` that was appended, so the accumulated text
/// never starts with whitespace however many blank fragments arrive first.
pub fn trim_and_append<'a>(accumulated: &mut String, token: &'a str) -> &'a str {
    let fragment = if accumulated.is_empty() {
        token.trim_start()
    } else {
        token
    };
    accumulated.push_str(fragment);
    fragment
}
