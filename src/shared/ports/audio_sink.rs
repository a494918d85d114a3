use crate::shared::entities::CallId;

/// Receiver of inbound call audio (μ-law, 8 kHz mono), keyed by voice key.
///
/// Implementations must not block: the RTP receive loop calls this per packet.
pub trait AudioSink: Send + Sync {
    fn push_audio(&self, call_id: &CallId, mulaw: Vec<u8>);
}
