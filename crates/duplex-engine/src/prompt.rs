//! Chat-completion message assembly for a [`GenerationRequest`].
//!
//! Only structure lives here: which text goes into which role. The persona
//! and history content itself is supplied by the client.

use serde::Serialize;

use crate::engine::{EngineRole, GenerationRequest};

/// Instruction given to the tool classifier.
pub const TOOL_INSTRUCTION: &str = "Decide whether the user's last message requires calling a tool. \
Answer with a single word: yes or no.";

/// One chat-completion message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    /// `system`, `user` or `assistant`.
    pub role: &'static str,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

/// Build the message list for a request.
pub fn build_messages(request: &GenerationRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(3);
    match request.role {
        EngineRole::Tool => {
            messages.push(ChatMessage::system(TOOL_INSTRUCTION));
        }
        EngineRole::Chat => {
            let mut system = request.persona.clone().unwrap_or_default();
            if let Some(identity) = non_empty(request.user_identity.as_deref()) {
                if !system.is_empty() {
                    system.push_str("\n\n");
                }
                system.push_str("User: ");
                system.push_str(identity);
            }
            if !system.is_empty() {
                messages.push(ChatMessage::system(system));
            }
        }
    }
    if let Some(history) = non_empty(request.history.as_deref()) {
        messages.push(ChatMessage::system(format!("Conversation so far:\n{history}")));
    }
    messages.push(ChatMessage::user(request.utterance.clone()));
    messages
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
