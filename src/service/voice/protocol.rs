//! JSON messages exchanged with the realtime voice service.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::shared::config::VoiceConfig;

pub fn session_update(cfg: &VoiceConfig, instructions: &str) -> Value {
    json!({
        "type": "session.update",
        "session": {
            "voice": cfg.voice,
            "instructions": instructions,
            "input_audio_format": cfg.audio_format.as_str(),
            "output_audio_format": cfg.audio_format.as_str(),
            "modalities": ["audio", "text"],
        }
    })
}

pub fn user_text_item(text: &str) -> Value {
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "message",
            "role": "user",
            "content": [{ "type": "input_text", "text": text }]
        }
    })
}

pub fn function_call_output_item(call_id: &str, output: &str) -> Value {
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "function_call_output",
            "call_id": call_id,
            "output": output,
        }
    })
}

pub fn response_create() -> Value {
    json!({ "type": "response.create" })
}

pub fn input_audio_append(wire_audio: &[u8]) -> Value {
    json!({
        "type": "input_audio_buffer.append",
        "audio": STANDARD.encode(wire_audio),
    })
}

pub fn input_audio_commit() -> Value {
    json!({ "type": "input_audio_buffer.commit" })
}

/// Server events the gateway reacts to. Everything else lands in `Other`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "response.content_part.added")]
    ContentPartAdded { part: ContentPart },
    #[serde(rename = "conversation.item.created")]
    ItemCreated { item: ConversationItem },
    #[serde(rename = "response.done")]
    ResponseDone,
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: ErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub audio: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Vec<ItemContent>,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ItemContent {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub transcript: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

impl ErrorBody {
    pub fn describe(&self) -> String {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => format!("{}: {}", code, message),
            (None, Some(message)) => message.clone(),
            (Some(code), None) => code.clone(),
            (None, None) => "unspecified error".to_string(),
        }
    }
}

impl ConversationItem {
    /// Concatenated text or transcript of a message item.
    pub fn text(&self) -> Option<String> {
        let text: String = self
            .content
            .iter()
            .filter_map(|c| c.text.as_deref().or(c.transcript.as_deref()))
            .collect::<Vec<_>>()
            .join(" ");
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

pub fn parse_server_event(raw: &str) -> Result<ServerEvent, serde_json::Error> {
    serde_json::from_str(raw)
}

pub fn decode_audio(b64: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(b64)
}
