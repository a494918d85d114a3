use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum VoiceError {
    #[error("failed to connect to voice service: {0}")]
    Connect(String),
    #[error("websocket error: {0}")]
    Transport(String),
    #[error("voice service error: {0}")]
    Remote(String),
    #[error("invalid voice service message: {0}")]
    Protocol(String),
}
