pub mod audio_sink;
pub mod control_plane;
pub mod conversation;
pub mod voice_event;

pub use audio_sink::AudioSink;
pub use control_plane::{
    ChannelInfo, ControlEvent, ControlFuture, ControlPlanePort, ExternalMediaChannel,
    ExternalMediaRequest, SnoopRequest,
};
pub use conversation::{ConversationFuture, ConversationStore, MessageRole};
pub use voice_event::{voice_event_channel, VoiceEvent, VoiceEventRx, VoiceEventTx};
