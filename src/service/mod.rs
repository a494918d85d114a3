pub mod call_control;
pub mod registry;
pub mod voice;

pub use call_control::CallController;
pub use registry::{CallRegistry, RegistryError, SsrcClaim};
pub use voice::{OpenSession, OutboundItem, VoiceSessionManager};
