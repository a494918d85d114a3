use crate::shared::entities::{CallId, ChannelId};
use crate::shared::ports::ChannelInfo;

pub const SNOOP_PREFIX: &str = "snoop-";
pub const EXTERNAL_MEDIA_PREFIX: &str = "extmedia-";
const SNOOP_ARG: &str = "snoop";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Primary,
    /// Snoop channel; `parent` is `None` when it cannot be attributed.
    Snoop { parent: Option<CallId> },
    ExternalMedia,
}

pub fn snoop_channel_id(call_id: &CallId) -> ChannelId {
    ChannelId::new(format!("{}{}", SNOOP_PREFIX, call_id))
}

pub fn snoop_app_args(call_id: &CallId) -> String {
    format!("{},{}", SNOOP_ARG, call_id)
}

pub fn external_media_channel_id(call_id: &CallId) -> ChannelId {
    ChannelId::new(format!("{}{}", EXTERNAL_MEDIA_PREFIX, call_id))
}

/// Classifies a channel that entered the application.
pub fn classify_channel(channel: &ChannelInfo, args: &[String]) -> ChannelKind {
    if let Some(parent) = snoop_parent_from_args(args) {
        return ChannelKind::Snoop {
            parent: CallId::new(parent).ok(),
        };
    }
    let id = channel.id.as_str();
    if let Some(parent) = id.strip_prefix(SNOOP_PREFIX) {
        return ChannelKind::Snoop {
            parent: CallId::new(parent).ok(),
        };
    }
    if channel.name.starts_with("Snoop/") {
        return ChannelKind::Snoop { parent: None };
    }
    if id.starts_with(EXTERNAL_MEDIA_PREFIX) || channel.name.starts_with("UnicastRTP/") {
        return ChannelKind::ExternalMedia;
    }
    ChannelKind::Primary
}

/// Accepts both the split form (`["snoop", "CH1"]`) and the raw `snoop,CH1`.
fn snoop_parent_from_args(args: &[String]) -> Option<&str> {
    match args {
        [first, parent, ..] if first == SNOOP_ARG => Some(parent.as_str()),
        [single] => single
            .strip_prefix(SNOOP_ARG)
            .and_then(|rest| rest.strip_prefix(','))
            .filter(|parent| !parent.is_empty()),
        _ => None,
    }
}
