use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;

use crate::shared::config::ConversationConfig;
use crate::shared::entities::{CallId, ConversationId};
use crate::shared::error::ConversationError;
use crate::shared::ports::{ConversationFuture, ConversationStore, MessageRole};

/// Store used when no conversation API is configured; ids are local UUIDs.
#[derive(Clone, Debug, Default)]
pub struct NoopConversationStore;

impl NoopConversationStore {
    pub fn new() -> Self {
        Self
    }
}

impl ConversationStore for NoopConversationStore {
    fn begin(
        &self,
        call_id: &CallId,
        _correlation_id: Option<&CallId>,
    ) -> ConversationFuture<ConversationId> {
        let id = ConversationId::new(uuid::Uuid::new_v4().to_string());
        log::debug!("[conversation] call_id={} local conversation {}", call_id, id);
        Box::pin(async move { Ok(id) })
    }

    fn append_message(
        &self,
        _role: MessageRole,
        _text: String,
        _conversation_id: &ConversationId,
    ) -> ConversationFuture<()> {
        Box::pin(async move { Ok(()) })
    }

    fn complete(&self, _conversation_id: &ConversationId) -> ConversationFuture<()> {
        Box::pin(async move { Ok(()) })
    }
}

#[derive(Debug, Deserialize)]
struct CreatedConversation {
    id: String,
}

/// JSON-over-HTTP conversation store.
///
/// `POST {base}/conversations`, `POST {base}/conversations/{id}/messages` and
/// `POST {base}/conversations/{id}/complete`.
pub struct HttpConversationStore {
    client: Client,
    base_url: String,
}

impl HttpConversationStore {
    pub fn new(base_url: impl Into<String>, cfg: &ConversationConfig) -> Result<Self, ConversationError> {
        let client = Client::builder()
            .timeout(cfg.http_timeout)
            .build()
            .map_err(|e| ConversationError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn post(&self, path: String, body: serde_json::Value) -> ConversationFuture<reqwest::Response> {
        let client = self.client.clone();
        let url = format!("{}{}", self.base_url, path);
        Box::pin(async move {
            let resp = client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| ConversationError::Transport(e.to_string()))?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(ConversationError::Rejected {
                    status: status.as_u16(),
                    body,
                });
            }
            Ok(resp)
        })
    }
}

impl ConversationStore for HttpConversationStore {
    fn begin(
        &self,
        call_id: &CallId,
        correlation_id: Option<&CallId>,
    ) -> ConversationFuture<ConversationId> {
        let sent = self.post(
            "/conversations".to_string(),
            serde_json::json!({
                "call_id": call_id.as_str(),
                "correlation_id": correlation_id.map(|c| c.as_str()),
                "started_at": Utc::now().to_rfc3339(),
            }),
        );
        Box::pin(async move {
            let created: CreatedConversation = sent
                .await?
                .json()
                .await
                .map_err(|e| ConversationError::Decode(e.to_string()))?;
            Ok(ConversationId::new(created.id))
        })
    }

    fn append_message(
        &self,
        role: MessageRole,
        text: String,
        conversation_id: &ConversationId,
    ) -> ConversationFuture<()> {
        let sent = self.post(
            format!("/conversations/{}/messages", conversation_id),
            serde_json::json!({
                "role": role.as_str(),
                "text": text,
                "created_at": Utc::now().to_rfc3339(),
            }),
        );
        Box::pin(async move {
            sent.await?;
            Ok(())
        })
    }

    fn complete(&self, conversation_id: &ConversationId) -> ConversationFuture<()> {
        let sent = self.post(
            format!("/conversations/{}/complete", conversation_id),
            serde_json::json!({ "ended_at": Utc::now().to_rfc3339() }),
        );
        Box::pin(async move {
            sent.await?;
            Ok(())
        })
    }
}
