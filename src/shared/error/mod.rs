pub mod control;
pub mod media;
pub mod voice;

pub use control::{ControlError, ConversationError};
pub use media::{IngressError, RtpParseError};
pub use voice::VoiceError;
