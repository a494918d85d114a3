pub mod ingress;
pub mod rtp;

pub use ingress::{IngressOutcome, MediaIngress, SsrcTable};
pub use rtp::{parse_rtp_packet, RtpPacket};
