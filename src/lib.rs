pub mod interface;
pub mod protocol;
pub mod service;
pub mod shared;

// Short paths used by the binary and the e2e tests.
pub use interface::{ari, conversation};
pub use protocol::{ingress, rtp};
pub use service::{call_control, registry, voice};
pub use shared::{config, entities, error, logging, media, ports};
