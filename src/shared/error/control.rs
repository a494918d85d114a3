use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control plane http error: {0}")]
    Http(String),
    #[error("control plane returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("control plane resource not found: {0}")]
    NotFound(String),
    #[error("event stream error: {0}")]
    EventStream(String),
    #[error("unexpected control plane response: {0}")]
    Decode(String),
    #[error("control plane unreachable after {attempts} attempts: {last}")]
    Unreachable { attempts: u32, last: String },
}

impl From<reqwest::Error> for ControlError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ControlError::Decode(err.to_string())
        } else {
            ControlError::Http(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("conversation store request failed: {0}")]
    Transport(String),
    #[error("conversation store rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("conversation store response invalid: {0}")]
    Decode(String),
}
