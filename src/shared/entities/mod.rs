pub mod call;
pub mod identifiers;

pub use call::{CallError, CallSession, CallSessionPatch, CallState};
pub use identifiers::{BridgeId, CallId, CallIdError, ChannelId, ConversationId};
