pub mod packet;
pub mod parser;

pub use packet::RtpPacket;
pub use parser::{parse_rtp_packet, RTP_HEADER_LEN};
