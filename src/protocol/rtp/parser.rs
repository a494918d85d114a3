use crate::protocol::rtp::packet::RtpPacket;
use crate::shared::error::RtpParseError;

pub const RTP_HEADER_LEN: usize = 12;

pub fn parse_rtp_packet(buf: &[u8]) -> Result<RtpPacket, RtpParseError> {
    if buf.len() < RTP_HEADER_LEN {
        return Err(RtpParseError::TooShort(buf.len()));
    }

    let b0 = buf[0];
    let b1 = buf[1];

    let version = b0 >> 6;
    if version != 2 {
        return Err(RtpParseError::UnsupportedVersion(version));
    }

    let marker = (b1 & 0b1000_0000) != 0;
    let payload_type = b1 & 0b0111_1111;

    let sequence_number = u16::from_be_bytes([buf[2], buf[3]]);
    let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

    let payload = &buf[RTP_HEADER_LEN..];
    if payload.is_empty() {
        return Err(RtpParseError::EmptyPayload);
    }

    Ok(RtpPacket {
        marker,
        payload_type,
        sequence_number,
        timestamp,
        ssrc,
        payload: payload.to_vec(),
    })
}
