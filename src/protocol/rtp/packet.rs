/// Inbound RTP packet, fixed header only.
///
/// CSRC lists, header extensions and padding are not interpreted; the payload is
/// everything after the 12-byte fixed header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Vec<u8>,
}
