use std::fmt;

use tokio::sync::mpsc;

use crate::shared::entities::CallId;
use crate::shared::ports::conversation::MessageRole;

/// Notifications from a voice session to the call controller.
pub enum VoiceEvent {
    /// Assistant audio, μ-law 8 kHz mono.
    AudioChunk {
        call_id: CallId,
        mulaw: Vec<u8>,
    },
    TextMessage {
        call_id: CallId,
        role: MessageRole,
        text: String,
    },
    FunctionCall {
        call_id: CallId,
        function_call_id: String,
        name: String,
        arguments: String,
    },
    ResponseDone {
        call_id: CallId,
    },
    Error {
        call_id: CallId,
        message: String,
    },
    Closed {
        call_id: CallId,
    },
}

impl VoiceEvent {
    pub fn call_id(&self) -> &CallId {
        match self {
            VoiceEvent::AudioChunk { call_id, .. }
            | VoiceEvent::TextMessage { call_id, .. }
            | VoiceEvent::FunctionCall { call_id, .. }
            | VoiceEvent::ResponseDone { call_id }
            | VoiceEvent::Error { call_id, .. }
            | VoiceEvent::Closed { call_id } => call_id,
        }
    }

    /// Stable notification kind, used in logs and by consumers.
    pub fn kind(&self) -> &'static str {
        match self {
            VoiceEvent::AudioChunk { .. } => "audio_chunk",
            VoiceEvent::TextMessage { .. } => "text_message",
            VoiceEvent::FunctionCall { .. } => "function_call",
            VoiceEvent::ResponseDone { .. } => "response_done",
            VoiceEvent::Error { .. } => "openai_error",
            VoiceEvent::Closed { .. } => "closed",
        }
    }
}

impl fmt::Debug for VoiceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AudioChunk { call_id, mulaw } => f
                .debug_struct("AudioChunk")
                .field("call_id", call_id)
                .field("mulaw_len", &mulaw.len())
                .finish(),
            Self::TextMessage {
                call_id,
                role,
                text,
            } => f
                .debug_struct("TextMessage")
                .field("call_id", call_id)
                .field("role", role)
                .field("text_len", &text.len())
                .finish(),
            Self::FunctionCall {
                call_id,
                function_call_id,
                name,
                ..
            } => f
                .debug_struct("FunctionCall")
                .field("call_id", call_id)
                .field("function_call_id", function_call_id)
                .field("name", name)
                .finish(),
            Self::ResponseDone { call_id } => f
                .debug_struct("ResponseDone")
                .field("call_id", call_id)
                .finish(),
            Self::Error { call_id, message } => f
                .debug_struct("Error")
                .field("call_id", call_id)
                .field("message", message)
                .finish(),
            Self::Closed { call_id } => {
                f.debug_struct("Closed").field("call_id", call_id).finish()
            }
        }
    }
}

pub type VoiceEventTx = mpsc::Sender<VoiceEvent>;
pub type VoiceEventRx = mpsc::Receiver<VoiceEvent>;

pub fn voice_event_channel(capacity: usize) -> (VoiceEventTx, VoiceEventRx) {
    mpsc::channel(capacity)
}
