pub mod ari;
pub mod conversation;

pub use ari::AriClient;
pub use conversation::{HttpConversationStore, NoopConversationStore};
