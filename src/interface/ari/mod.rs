//! ARI adapter: REST commands over `reqwest`, events over a WebSocket.

mod events;

use std::net::{IpAddr, SocketAddr};

use futures_util::StreamExt;
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::shared::config::AriConfig;
use crate::shared::entities::{BridgeId, ChannelId};
use crate::shared::error::ControlError;
use crate::shared::ports::{
    ControlEvent, ControlFuture, ControlPlanePort, ExternalMediaChannel, ExternalMediaRequest,
    SnoopRequest,
};

pub use events::parse_event;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct VariableResponse {
    value: String,
}

#[derive(Debug, Deserialize)]
struct RecordingResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ChannelResponse {
    id: String,
    #[serde(default)]
    channelvars: std::collections::HashMap<String, String>,
}

pub struct AriClient {
    client: Client,
    cfg: AriConfig,
}

impl AriClient {
    pub fn new(cfg: AriConfig) -> Result<Self, ControlError> {
        let client = Client::builder().timeout(cfg.http_timeout).build()?;
        Ok(Self { client, cfg })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ControlError> {
        let mut url = Url::parse(&self.cfg.base_url)
            .map_err(|e| ControlError::Http(format!("invalid ARI url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| ControlError::Http("ARI url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<RequestBuilder, ControlError> {
        let url = self.url(segments)?;
        Ok(self
            .client
            .request(method, url)
            .basic_auth(&self.cfg.user, Some(&self.cfg.password))
            .query(query))
    }

    /// WebSocket URL for the application's event stream.
    fn events_url(&self) -> Result<Url, ControlError> {
        let mut url = self.url(&["events"])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ControlError::Http("cannot derive websocket url".to_string()))?;
        url.query_pairs_mut()
            .append_pair("app", &self.cfg.app)
            .append_pair(
                "api_key",
                &format!("{}:{}", self.cfg.user, self.cfg.password),
            )
            .append_pair("subscribeAll", "false");
        Ok(url)
    }
}

async fn send(req: RequestBuilder) -> Result<Response, ControlError> {
    let resp = req.send().await?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().path().to_string();
    let body = resp.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(ControlError::NotFound(url));
    }
    Err(ControlError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn send_json<T: DeserializeOwned>(req: RequestBuilder) -> Result<T, ControlError> {
    let resp = send(req).await?;
    resp.json::<T>()
        .await
        .map_err(|e| ControlError::Decode(e.to_string()))
}

async fn send_unit(req: Result<RequestBuilder, ControlError>) -> Result<(), ControlError> {
    send(req?).await.map(drop)
}

/// Address the PBX sends external media from, when it reports one.
fn rtp_source(vars: &std::collections::HashMap<String, String>) -> Option<SocketAddr> {
    let ip = vars.get("UNICASTRTP_LOCAL_ADDRESS")?.parse::<IpAddr>().ok()?;
    let port = vars.get("UNICASTRTP_LOCAL_PORT")?.parse::<u16>().ok()?;
    Some(SocketAddr::new(ip, port))
}

impl ControlPlanePort for AriClient {
    fn connect(&self) -> ControlFuture<()> {
        let req = self.request(Method::GET, &["asterisk", "info"], &[]);
        Box::pin(send_unit(req))
    }

    fn subscribe_app(&self) -> ControlFuture<mpsc::Receiver<ControlEvent>> {
        let url = self.events_url();
        let app = self.cfg.app.clone();
        Box::pin(async move {
            let url = url?;
            let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| ControlError::EventStream(e.to_string()))?;
            log::info!("[ari] event stream open for app {}", app);
            let (write_half, mut stream) = ws.split();
            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            tokio::spawn(async move {
                // the write half stays alive so pings keep being answered
                let _write_half = write_half;
                while let Some(msg) = stream.next().await {
                    let text = match msg {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(frame)) => {
                            log::warn!("[ari] event stream closed: {:?}", frame);
                            break;
                        }
                        Ok(_) => continue,
                        Err(err) => {
                            log::warn!("[ari] event stream error: {}", err);
                            break;
                        }
                    };
                    match parse_event(&text) {
                        Ok(Some(ev)) => {
                            if tx.send(ev).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => log::warn!("[ari] unreadable event: {}", err),
                    }
                }
                log::info!("[ari] event reader for app {} stopped", app);
            });
            Ok(rx)
        })
    }

    fn answer(&self, channel: &ChannelId) -> ControlFuture<()> {
        let req = self.request(Method::POST, &["channels", channel.as_str(), "answer"], &[]);
        Box::pin(send_unit(req))
    }

    fn play(&self, channel: &ChannelId, media: &str) -> ControlFuture<String> {
        let req = self.request(
            Method::POST,
            &["channels", channel.as_str(), "play"],
            &[("media", media)],
        );
        Box::pin(async move {
            let playback: IdResponse = send_json(req?).await?;
            Ok(playback.id)
        })
    }

    fn hangup(&self, channel: &ChannelId) -> ControlFuture<()> {
        let req = self.request(Method::DELETE, &["channels", channel.as_str()], &[]);
        Box::pin(send_unit(req))
    }

    fn get_variable(&self, channel: &ChannelId, name: &str) -> ControlFuture<Option<String>> {
        let req = self.request(
            Method::GET,
            &["channels", channel.as_str(), "variable"],
            &[("variable", name)],
        );
        Box::pin(async move {
            match send_json::<VariableResponse>(req?).await {
                Ok(var) if var.value.is_empty() => Ok(None),
                Ok(var) => Ok(Some(var.value)),
                Err(ControlError::NotFound(_)) => Ok(None),
                Err(err) => Err(err),
            }
        })
    }

    fn create_bridge(&self) -> ControlFuture<BridgeId> {
        let req = self.request(Method::POST, &["bridges"], &[("type", "mixing")]);
        Box::pin(async move {
            let bridge: IdResponse = send_json(req?).await?;
            Ok(BridgeId::new(bridge.id))
        })
    }

    fn add_channel(&self, bridge: &BridgeId, channel: &ChannelId) -> ControlFuture<()> {
        let req = self.request(
            Method::POST,
            &["bridges", bridge.as_str(), "addChannel"],
            &[("channel", channel.as_str())],
        );
        Box::pin(send_unit(req))
    }

    fn record_bridge(&self, bridge: &BridgeId, name: &str) -> ControlFuture<String> {
        let req = self.request(
            Method::POST,
            &["bridges", bridge.as_str(), "record"],
            &[("name", name), ("format", "wav"), ("ifExists", "overwrite")],
        );
        Box::pin(async move {
            let recording: RecordingResponse = send_json(req?).await?;
            Ok(recording.name)
        })
    }

    fn destroy_bridge(&self, bridge: &BridgeId) -> ControlFuture<()> {
        let req = self.request(Method::DELETE, &["bridges", bridge.as_str()], &[]);
        Box::pin(send_unit(req))
    }

    fn snoop(&self, request: SnoopRequest) -> ControlFuture<ChannelId> {
        let req = self.request(
            Method::POST,
            &["channels", request.channel.as_str(), "snoop"],
            &[
                ("snoopId", request.snoop_id.as_str()),
                ("app", request.app.as_str()),
                ("appArgs", request.app_args.as_str()),
                ("spy", "in"),
            ],
        );
        Box::pin(async move {
            let channel: IdResponse = send_json(req?).await?;
            Ok(ChannelId::new(channel.id))
        })
    }

    fn external_media(&self, request: ExternalMediaRequest) -> ControlFuture<ExternalMediaChannel> {
        let req = self.request(
            Method::POST,
            &["channels", "externalMedia"],
            &[
                ("channelId", request.channel_id.as_str()),
                ("app", request.app.as_str()),
                ("external_host", request.external_host.as_str()),
                ("format", request.format.as_str()),
                ("encapsulation", "rtp"),
                ("transport", "udp"),
                ("direction", "both"),
            ],
        );
        Box::pin(async move {
            let channel: ChannelResponse = send_json(req?).await?;
            Ok(ExternalMediaChannel {
                rtp_source: rtp_source(&channel.channelvars),
                channel: ChannelId::new(channel.id),
            })
        })
    }

    fn upload_sound(&self, name: &str, data: Vec<u8>) -> ControlFuture<()> {
        let req = self
            .request(Method::POST, &["sounds", name], &[])
            .map(|rb| rb.header("content-type", "audio/wav").body(data));
        Box::pin(send_unit(req))
    }
}
