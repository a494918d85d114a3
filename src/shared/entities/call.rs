use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::shared::entities::identifiers::{BridgeId, CallId, ChannelId, ConversationId};

/// Lifecycle of one call as driven by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Received,
    Answered,
    PipelineSetup,
    MainBridged,
    SnoopCreated,
    ExternalMediaAwaitingSsrc,
    Streaming,
    CleaningUp,
    Terminated,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Received => "received",
            CallState::Answered => "answered",
            CallState::PipelineSetup => "pipeline_setup",
            CallState::MainBridged => "main_bridged",
            CallState::SnoopCreated => "snoop_created",
            CallState::ExternalMediaAwaitingSsrc => "external_media_awaiting_ssrc",
            CallState::Streaming => "streaming",
            CallState::CleaningUp => "cleaning_up",
            CallState::Terminated => "terminated",
        }
    }

    /// Next state on the setup path.
    fn successor(self) -> Option<CallState> {
        match self {
            CallState::Received => Some(CallState::Answered),
            CallState::Answered => Some(CallState::PipelineSetup),
            CallState::PipelineSetup => Some(CallState::MainBridged),
            CallState::MainBridged => Some(CallState::SnoopCreated),
            CallState::SnoopCreated => Some(CallState::ExternalMediaAwaitingSsrc),
            CallState::ExternalMediaAwaitingSsrc => Some(CallState::Streaming),
            CallState::Streaming => None,
            CallState::CleaningUp => Some(CallState::Terminated),
            CallState::Terminated => None,
        }
    }

    pub fn can_transition_to(self, next: CallState) -> bool {
        match (self, next) {
            (CallState::Terminated, _) => false,
            (CallState::CleaningUp, next) => next == CallState::Terminated,
            (_, CallState::CleaningUp) => true,
            (current, next) => current.successor() == Some(next),
        }
    }

    pub fn is_torn_down(&self) -> bool {
        matches!(self, CallState::CleaningUp | CallState::Terminated)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CallError {
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: CallState, to: CallState },
}

/// Registry record for one active call.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: CallId,
    pub correlation_id: Option<CallId>,
    pub state: CallState,
    pub channel: ChannelId,
    pub bridge: Option<BridgeId>,
    pub media_bridge: Option<BridgeId>,
    pub snoop_channel: Option<ChannelId>,
    pub external_media_channel: Option<ChannelId>,
    /// Source address the PBX announced for the external media stream.
    pub rtp_source: Option<SocketAddr>,
    pub ssrc: Option<u32>,
    pub conversation_id: Option<ConversationId>,
    pub recording: Option<String>,
    pub cancel: CancellationToken,
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(call_id: CallId, channel: ChannelId, correlation_id: Option<CallId>) -> Self {
        Self {
            call_id,
            correlation_id,
            state: CallState::Received,
            channel,
            bridge: None,
            media_bridge: None,
            snoop_channel: None,
            external_media_channel: None,
            rtp_source: None,
            ssrc: None,
            conversation_id: None,
            recording: None,
            cancel: CancellationToken::new(),
            created_at: Utc::now(),
        }
    }

    /// Key used for the voice session and forwarded audio.
    pub fn voice_key(&self) -> &CallId {
        self.correlation_id.as_ref().unwrap_or(&self.call_id)
    }

    /// True when `id` is either the native call id or the correlation id.
    pub fn matches_id(&self, id: &str) -> bool {
        self.call_id.as_str() == id
            || self
                .correlation_id
                .as_ref()
                .is_some_and(|cid| cid.as_str() == id)
    }

    pub fn owns_channel(&self, channel: &ChannelId) -> bool {
        &self.channel == channel
            || self.snoop_channel.as_ref() == Some(channel)
            || self.external_media_channel.as_ref() == Some(channel)
    }

    pub fn transition(&mut self, next: CallState) -> Result<CallState, CallError> {
        if !self.state.can_transition_to(next) {
            return Err(CallError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }

    pub fn apply(&mut self, patch: CallSessionPatch) {
        let CallSessionPatch {
            bridge,
            media_bridge,
            snoop_channel,
            external_media_channel,
            rtp_source,
            ssrc,
            conversation_id,
            recording,
        } = patch;
        if bridge.is_some() {
            self.bridge = bridge;
        }
        if media_bridge.is_some() {
            self.media_bridge = media_bridge;
        }
        if snoop_channel.is_some() {
            self.snoop_channel = snoop_channel;
        }
        if external_media_channel.is_some() {
            self.external_media_channel = external_media_channel;
        }
        if rtp_source.is_some() {
            self.rtp_source = rtp_source;
        }
        if ssrc.is_some() {
            self.ssrc = ssrc;
        }
        if conversation_id.is_some() {
            self.conversation_id = conversation_id;
        }
        if recording.is_some() {
            self.recording = recording;
        }
    }
}

/// Partial update for [`CallSession`]; `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct CallSessionPatch {
    pub bridge: Option<BridgeId>,
    pub media_bridge: Option<BridgeId>,
    pub snoop_channel: Option<ChannelId>,
    pub external_media_channel: Option<ChannelId>,
    pub rtp_source: Option<SocketAddr>,
    pub ssrc: Option<u32>,
    pub conversation_id: Option<ConversationId>,
    pub recording: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> CallSession {
        CallSession::new(
            CallId::new("CH1").unwrap(),
            ChannelId::new("CH1"),
            Some(CallId::new("ABC123").unwrap()),
        )
    }

    #[test]
    fn setup_path_is_strictly_ordered() {
        let mut s = session();
        assert!(s.transition(CallState::MainBridged).is_err());
        assert_eq!(s.state, CallState::Received);
        for next in [
            CallState::Answered,
            CallState::PipelineSetup,
            CallState::MainBridged,
            CallState::SnoopCreated,
            CallState::ExternalMediaAwaitingSsrc,
            CallState::Streaming,
        ] {
            s.transition(next).unwrap();
        }
        assert_eq!(s.state, CallState::Streaming);
    }

    #[test]
    fn terminated_is_absorbing() {
        let mut s = session();
        s.transition(CallState::CleaningUp).unwrap();
        assert!(s.transition(CallState::Answered).is_err());
        s.transition(CallState::Terminated).unwrap();
        assert_eq!(
            s.transition(CallState::CleaningUp),
            Err(CallError::InvalidTransition {
                from: CallState::Terminated,
                to: CallState::CleaningUp
            })
        );
    }

    #[test]
    fn patch_only_touches_provided_fields() {
        let mut s = session();
        s.apply(CallSessionPatch {
            bridge: Some(BridgeId::new("B1")),
            ..Default::default()
        });
        s.apply(CallSessionPatch {
            ssrc: Some(555),
            ..Default::default()
        });
        assert_eq!(s.bridge, Some(BridgeId::new("B1")));
        assert_eq!(s.ssrc, Some(555));
        assert!(s.snoop_channel.is_none());
    }

    #[test]
    fn voice_key_prefers_correlation_id() {
        let s = session();
        assert_eq!(s.voice_key().as_str(), "ABC123");
        assert!(s.matches_id("CH1"));
        assert!(s.matches_id("ABC123"));
        assert!(!s.matches_id("CH2"));
    }
}
