//! ARI event JSON → `ControlEvent`.

use serde::Deserialize;

use crate::shared::entities::ChannelId;
use crate::shared::ports::{ChannelInfo, ControlEvent};

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<RawChannel>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cause: Option<i64>,
    #[serde(default)]
    digit: Option<String>,
    #[serde(default)]
    application: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    caller: Option<RawCaller>,
}

#[derive(Debug, Deserialize)]
struct RawCaller {
    #[serde(default)]
    number: String,
}

impl RawChannel {
    fn into_info(self) -> ChannelInfo {
        let caller_number = self
            .caller
            .map(|c| c.number)
            .filter(|n| !n.trim().is_empty());
        ChannelInfo {
            id: ChannelId::new(self.id),
            name: self.name,
            caller_number,
        }
    }
}

/// Parses one event frame. `Ok(None)` for event types the gateway ignores.
pub fn parse_event(raw: &str) -> Result<Option<ControlEvent>, serde_json::Error> {
    let ev: RawEvent = serde_json::from_str(raw)?;
    let kind = ev.kind.as_str();
    if kind == "ApplicationReplaced" {
        return Ok(Some(ControlEvent::Error {
            message: format!(
                "application {} replaced by another client",
                ev.application.as_deref().unwrap_or("?")
            ),
        }));
    }
    let Some(channel) = ev.channel else {
        return Ok(None);
    };
    let event = match kind {
        "StasisStart" => ControlEvent::ChannelEnteredApp {
            channel: channel.into_info(),
            args: ev.args,
        },
        "StasisEnd" => ControlEvent::ChannelLeftApp {
            channel: ChannelId::new(channel.id),
        },
        "ChannelDestroyed" => ControlEvent::ChannelDestroyed {
            channel: ChannelId::new(channel.id),
            cause: ev.cause,
        },
        "ChannelHangupRequest" => ControlEvent::HangupRequested {
            channel: ChannelId::new(channel.id),
        },
        "ChannelDtmfReceived" => {
            let Some(digit) = ev.digit.as_deref().and_then(|d| d.chars().next()) else {
                return Ok(None);
            };
            ControlEvent::DtmfReceived {
                channel: ChannelId::new(channel.id),
                digit,
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}
