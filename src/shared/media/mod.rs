pub mod codec;

pub use codec::{AudioCodec, ByteOrder, PcmFormat};
