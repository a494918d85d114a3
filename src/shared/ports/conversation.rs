use std::future::Future;
use std::pin::Pin;

use crate::shared::entities::{CallId, ConversationId};
use crate::shared::error::ConversationError;

pub type ConversationFuture<T> = Pin<Box<dyn Future<Output = Result<T, ConversationError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

/// Persistence collaborator for call transcripts.
pub trait ConversationStore: Send + Sync {
    fn begin(
        &self,
        call_id: &CallId,
        correlation_id: Option<&CallId>,
    ) -> ConversationFuture<ConversationId>;

    fn append_message(
        &self,
        role: MessageRole,
        text: String,
        conversation_id: &ConversationId,
    ) -> ConversationFuture<()>;

    fn complete(&self, conversation_id: &ConversationId) -> ConversationFuture<()>;
}
