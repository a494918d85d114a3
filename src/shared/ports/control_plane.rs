use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::shared::entities::{BridgeId, ChannelId};
use crate::shared::error::ControlError;

pub type ControlFuture<T> = Pin<Box<dyn Future<Output = Result<T, ControlError>> + Send>>;

/// Channel snapshot carried by control-plane events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub name: String,
    pub caller_number: Option<String>,
}

/// Events delivered by the control plane for the gateway's application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// A channel entered the application. Fired for primary calls and for
    /// sub-channels the gateway created itself.
    ChannelEnteredApp {
        channel: ChannelInfo,
        args: Vec<String>,
    },
    ChannelLeftApp {
        channel: ChannelId,
    },
    ChannelDestroyed {
        channel: ChannelId,
        cause: Option<i64>,
    },
    HangupRequested {
        channel: ChannelId,
    },
    DtmfReceived {
        channel: ChannelId,
        digit: char,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnoopRequest {
    pub channel: ChannelId,
    pub snoop_id: ChannelId,
    pub app: String,
    pub app_args: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalMediaRequest {
    pub channel_id: ChannelId,
    pub app: String,
    /// `host:port` the PBX streams RTP to.
    pub external_host: String,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalMediaChannel {
    pub channel: ChannelId,
    /// Local RTP address the PBX reported for the stream, when it reports one.
    pub rtp_source: Option<SocketAddr>,
}

/// Command side of the telephony control plane.
pub trait ControlPlanePort: Send + Sync {
    /// Checks that the control plane is reachable.
    fn connect(&self) -> ControlFuture<()>;
    /// Subscribes to the application's event stream.
    fn subscribe_app(&self) -> ControlFuture<mpsc::Receiver<ControlEvent>>;
    fn answer(&self, channel: &ChannelId) -> ControlFuture<()>;
    /// Starts playback of `media` (e.g. `sound:greeting`); returns the playback id.
    fn play(&self, channel: &ChannelId, media: &str) -> ControlFuture<String>;
    fn hangup(&self, channel: &ChannelId) -> ControlFuture<()>;
    fn get_variable(&self, channel: &ChannelId, name: &str) -> ControlFuture<Option<String>>;
    fn create_bridge(&self) -> ControlFuture<BridgeId>;
    fn add_channel(&self, bridge: &BridgeId, channel: &ChannelId) -> ControlFuture<()>;
    /// Starts recording the bridge; returns the recording name.
    fn record_bridge(&self, bridge: &BridgeId, name: &str) -> ControlFuture<String>;
    fn destroy_bridge(&self, bridge: &BridgeId) -> ControlFuture<()>;
    fn snoop(&self, request: SnoopRequest) -> ControlFuture<ChannelId>;
    fn external_media(&self, request: ExternalMediaRequest) -> ControlFuture<ExternalMediaChannel>;
    /// Uploads an encoded sound so it can be played as `sound:<name>`.
    fn upload_sound(&self, name: &str, data: Vec<u8>) -> ControlFuture<()>;
}
