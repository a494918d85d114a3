use std::future::Future;
use std::pin::Pin;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::shared::config::VoiceConfig;
use crate::shared::error::VoiceError;

const LINK_CHANNEL_CAPACITY: usize = 256;

pub type VoiceFuture<T> = Pin<Box<dyn Future<Output = Result<T, VoiceError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeFrame {
    Text(String),
    Close,
}

/// One open connection. Dropping `outbound` closes the socket; `inbound`
/// yields `None` once the remote side has closed.
pub struct RealtimeLink {
    pub outbound: mpsc::Sender<RealtimeFrame>,
    pub inbound: mpsc::Receiver<Result<String, VoiceError>>,
}

pub trait RealtimeConnector: Send + Sync {
    fn connect(&self) -> VoiceFuture<RealtimeLink>;
}

/// Realtime connector over `tokio-tungstenite`.
pub struct WsConnector {
    endpoint: String,
    api_key: String,
}

impl WsConnector {
    pub fn new(cfg: &VoiceConfig) -> Self {
        Self {
            endpoint: cfg.endpoint(),
            api_key: cfg.api_key.clone(),
        }
    }
}

impl RealtimeConnector for WsConnector {
    fn connect(&self) -> VoiceFuture<RealtimeLink> {
        let endpoint = self.endpoint.clone();
        let api_key = self.api_key.clone();
        Box::pin(async move {
            let mut request = endpoint
                .as_str()
                .into_client_request()
                .map_err(|e| VoiceError::Connect(e.to_string()))?;
            let auth = HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| VoiceError::Connect(format!("invalid api key header: {}", e)))?;
            request.headers_mut().insert("Authorization", auth);
            request
                .headers_mut()
                .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

            let (ws, _response) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| VoiceError::Connect(e.to_string()))?;
            let (mut sink, mut stream) = ws.split();

            let (out_tx, mut out_rx) = mpsc::channel::<RealtimeFrame>(LINK_CHANNEL_CAPACITY);
            let (in_tx, in_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);

            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    match frame {
                        RealtimeFrame::Text(text) => {
                            if let Err(err) = sink.send(Message::text(text)).await {
                                log::warn!("[voice] websocket send failed: {}", err);
                                return;
                            }
                        }
                        RealtimeFrame::Close => break,
                    }
                }
                if let Err(err) = sink.send(Message::Close(None)).await {
                    log::debug!("[voice] websocket close frame not sent: {}", err);
                }
            });

            tokio::spawn(async move {
                while let Some(msg) = stream.next().await {
                    let item = match msg {
                        Ok(Message::Text(text)) => Ok(text.to_string()),
                        Ok(Message::Close(frame)) => {
                            log::info!("[voice] websocket closed by remote: {:?}", frame);
                            break;
                        }
                        Ok(_) => continue,
                        Err(err) => Err(VoiceError::Transport(err.to_string())),
                    };
                    let failed = item.is_err();
                    if in_tx.send(item).await.is_err() || failed {
                        break;
                    }
                }
            });

            Ok(RealtimeLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}
