//! Per-call voice session actor.
//!
//! The actor owns the WebSocket link, the pending-audio queue and the commit
//! timer. All of it is dropped together when the actor exits.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};

use crate::service::voice::protocol::{self, ServerEvent};
use crate::service::voice::transport::{RealtimeConnector, RealtimeFrame, RealtimeLink};
use crate::shared::config::{AudioWireFormat, VoiceConfig};
use crate::shared::entities::{CallId, ConversationId};
use crate::shared::error::VoiceError;
use crate::shared::media::{AudioCodec, PcmFormat};
use crate::shared::ports::{ConversationStore, MessageRole, VoiceEvent, VoiceEventTx};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceSessionState {
    Connecting,
    SessionNegotiating,
    Ready,
    Closing,
    Closed,
}

/// Conversation item injected by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundItem {
    UserText(String),
    FunctionCallOutput { call_id: String, output: String },
}

#[derive(Debug)]
pub(crate) enum SessionCommand {
    Audio(Vec<u8>),
    Item(OutboundItem),
    Close,
}

pub(crate) struct SessionHandle {
    pub(crate) generation: u64,
    pub(crate) commands: mpsc::Sender<SessionCommand>,
    pub(crate) state: watch::Receiver<VoiceSessionState>,
}

pub(crate) type SessionMap = Arc<Mutex<HashMap<CallId, SessionHandle>>>;

enum Exit {
    Requested,
    RemoteClosed,
    Failed(VoiceError),
}

pub(crate) struct SessionActor {
    pub(crate) call_id: CallId,
    pub(crate) generation: u64,
    pub(crate) conversation_id: Option<ConversationId>,
    pub(crate) instructions: String,
    pub(crate) cfg: VoiceConfig,
    pub(crate) connector: Arc<dyn RealtimeConnector>,
    pub(crate) events: VoiceEventTx,
    pub(crate) store: Arc<dyn ConversationStore>,
    pub(crate) commands: mpsc::Receiver<SessionCommand>,
    pub(crate) state: watch::Sender<VoiceSessionState>,
    pub(crate) sessions: SessionMap,
}

struct Pending {
    chunks: VecDeque<Vec<u8>>,
    capacity: usize,
    dropped: u64,
}

impl Pending {
    fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Queues a chunk, evicting the oldest one when full.
    fn push(&mut self, chunk: Vec<u8>) -> bool {
        let evicted = if self.chunks.len() >= self.capacity {
            self.chunks.pop_front();
            self.dropped += 1;
            true
        } else {
            false
        };
        self.chunks.push_back(chunk);
        evicted
    }
}

impl SessionActor {
    pub(crate) async fn run(mut self) {
        let mut pending = Pending::new(self.cfg.pending_audio_capacity);
        let exit = match self.connect(&mut pending).await {
            Ok(Some(mut link)) => {
                let exit = self.serve(&mut link, &mut pending).await;
                self.set_state(VoiceSessionState::Closing);
                if link.outbound.send(RealtimeFrame::Close).await.is_err() {
                    log::debug!("[voice] call_id={} link already closed", self.call_id);
                }
                exit
            }
            Ok(None) => Exit::Requested,
            Err(err) => Exit::Failed(err),
        };
        if pending.dropped > 0 {
            log::warn!(
                "[voice] call_id={} dropped {} pending audio chunk(s) before ready",
                self.call_id,
                pending.dropped
            );
        }
        drop(pending);
        self.finish(exit).await;
    }

    /// Connects while queueing audio. `Ok(None)` means close was requested first.
    async fn connect(&mut self, pending: &mut Pending) -> Result<Option<RealtimeLink>, VoiceError> {
        log::info!("[voice] call_id={} connecting", self.call_id);
        let connect = self.connector.connect();
        tokio::pin!(connect);
        loop {
            tokio::select! {
                res = &mut connect => {
                    let link = res?;
                    self.set_state(VoiceSessionState::SessionNegotiating);
                    return Ok(Some(link));
                }
                cmd = self.commands.recv() => match cmd {
                    Some(SessionCommand::Audio(chunk)) => self.enqueue(pending, chunk),
                    Some(SessionCommand::Item(item)) => self.drop_item(&item),
                    Some(SessionCommand::Close) | None => return Ok(None),
                },
            }
        }
    }

    async fn serve(&mut self, link: &mut RealtimeLink, pending: &mut Pending) -> Exit {
        let mut commit_at: Option<Instant> = None;
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    let res = match cmd {
                        Some(SessionCommand::Audio(chunk)) => {
                            if self.is_ready() {
                                self.send_audio(link, &chunk, &mut commit_at).await
                            } else {
                                self.enqueue(pending, chunk);
                                Ok(())
                            }
                        }
                        Some(SessionCommand::Item(item)) => {
                            if self.is_ready() {
                                self.send_item(link, &item).await
                            } else {
                                self.drop_item(&item);
                                Ok(())
                            }
                        }
                        Some(SessionCommand::Close) | None => return Exit::Requested,
                    };
                    if let Err(err) = res {
                        return Exit::Failed(err);
                    }
                }
                msg = link.inbound.recv() => {
                    let res = match msg {
                        Some(Ok(text)) => self.dispatch(link, &text, pending, &mut commit_at).await,
                        Some(Err(err)) => Err(err),
                        None => return Exit::RemoteClosed,
                    };
                    if let Err(err) = res {
                        return Exit::Failed(err);
                    }
                }
                _ = wait_deadline(commit_at) => {
                    commit_at = None;
                    if let Err(err) = send_json(link, &protocol::input_audio_commit()).await {
                        return Exit::Failed(err);
                    }
                    log::debug!("[voice] call_id={} input audio committed", self.call_id);
                }
            }
        }
    }

    async fn dispatch(
        &mut self,
        link: &mut RealtimeLink,
        raw: &str,
        pending: &mut Pending,
        commit_at: &mut Option<Instant>,
    ) -> Result<(), VoiceError> {
        let event = match protocol::parse_server_event(raw) {
            Ok(event) => event,
            Err(err) => {
                log::warn!("[voice] call_id={} unreadable server message: {}", self.call_id, err);
                return Ok(());
            }
        };
        match event {
            ServerEvent::SessionCreated => self.on_session_created(link, pending, commit_at).await?,
            ServerEvent::AudioDelta { delta } => self.forward_audio(&delta).await,
            ServerEvent::ContentPartAdded { part } => {
                if part.kind == "audio" {
                    if let Some(audio) = part.audio.as_deref() {
                        self.forward_audio(audio).await;
                    }
                }
            }
            ServerEvent::ItemCreated { item } => match item.kind.as_str() {
                "message" => {
                    let role = item
                        .role
                        .as_deref()
                        .and_then(MessageRole::parse)
                        .unwrap_or(MessageRole::Assistant);
                    if let Some(text) = item.text() {
                        self.record_message(role, text.clone());
                        self.emit(VoiceEvent::TextMessage {
                            call_id: self.call_id.clone(),
                            role,
                            text,
                        })
                        .await;
                    }
                }
                "function_call" => {
                    self.emit(VoiceEvent::FunctionCall {
                        call_id: self.call_id.clone(),
                        function_call_id: item.call_id.unwrap_or_default(),
                        name: item.name.unwrap_or_default(),
                        arguments: item.arguments.unwrap_or_default(),
                    })
                    .await;
                }
                other => log::debug!("[voice] call_id={} item {} ignored", self.call_id, other),
            },
            ServerEvent::ResponseDone => {
                self.emit(VoiceEvent::ResponseDone {
                    call_id: self.call_id.clone(),
                })
                .await;
            }
            ServerEvent::Error { error } => return Err(VoiceError::Remote(error.describe())),
            ServerEvent::Other => {}
        }
        Ok(())
    }

    async fn on_session_created(
        &mut self,
        link: &mut RealtimeLink,
        pending: &mut Pending,
        commit_at: &mut Option<Instant>,
    ) -> Result<(), VoiceError> {
        if *self.state.borrow() != VoiceSessionState::SessionNegotiating {
            log::debug!("[voice] call_id={} repeated session.created ignored", self.call_id);
            return Ok(());
        }
        send_json(link, &protocol::session_update(&self.cfg, &self.instructions)).await?;
        send_json(link, &protocol::user_text_item(&self.cfg.greeting_text)).await?;
        send_json(link, &protocol::response_create()).await?;
        self.set_state(VoiceSessionState::Ready);

        let flushed = pending.chunks.len();
        while let Some(chunk) = pending.chunks.pop_front() {
            self.send_audio(link, &chunk, commit_at).await?;
        }
        log::info!(
            "[voice] call_id={} ready, flushed {} queued chunk(s)",
            self.call_id,
            flushed
        );
        Ok(())
    }

    async fn send_audio(
        &self,
        link: &mut RealtimeLink,
        mulaw: &[u8],
        commit_at: &mut Option<Instant>,
    ) -> Result<(), VoiceError> {
        let wire = match self.cfg.audio_format {
            AudioWireFormat::G711Ulaw => mulaw.to_vec(),
            AudioWireFormat::Pcm16 => AudioCodec::new(PcmFormat::REALTIME_PCM16).decode_mulaw(mulaw),
        };
        send_json(link, &protocol::input_audio_append(&wire)).await?;
        *commit_at = Some(Instant::now() + self.cfg.commit_debounce);
        Ok(())
    }

    async fn send_item(&self, link: &mut RealtimeLink, item: &OutboundItem) -> Result<(), VoiceError> {
        let msg = match item {
            OutboundItem::UserText(text) => protocol::user_text_item(text),
            OutboundItem::FunctionCallOutput { call_id, output } => {
                protocol::function_call_output_item(call_id, output)
            }
        };
        send_json(link, &msg).await?;
        send_json(link, &protocol::response_create()).await
    }

    async fn forward_audio(&self, b64: &str) {
        let wire = match protocol::decode_audio(b64) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("[voice] call_id={} bad audio payload: {}", self.call_id, err);
                return;
            }
        };
        let mulaw = match self.cfg.audio_format {
            AudioWireFormat::G711Ulaw => wire,
            AudioWireFormat::Pcm16 => AudioCodec::new(PcmFormat::REALTIME_PCM16).encode_mulaw(&wire),
        };
        if mulaw.is_empty() {
            return;
        }
        self.emit(VoiceEvent::AudioChunk {
            call_id: self.call_id.clone(),
            mulaw,
        })
        .await;
    }

    fn record_message(&self, role: MessageRole, text: String) {
        let Some(conversation_id) = self.conversation_id.clone() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let call_id = self.call_id.clone();
        tokio::spawn(async move {
            if let Err(err) = store.append_message(role, text, &conversation_id).await {
                log::warn!("[voice] call_id={} append_message failed: {}", call_id, err);
            }
        });
    }

    fn enqueue(&self, pending: &mut Pending, chunk: Vec<u8>) {
        if pending.push(chunk) && pending.dropped == 1 {
            log::warn!(
                "[voice] call_id={} pending audio full ({}), dropping oldest",
                self.call_id,
                pending.capacity
            );
        }
    }

    fn drop_item(&self, item: &OutboundItem) {
        log::warn!(
            "[voice] call_id={} session not ready, dropped {:?}",
            self.call_id,
            item
        );
    }

    fn is_ready(&self) -> bool {
        *self.state.borrow() == VoiceSessionState::Ready
    }

    fn set_state(&self, next: VoiceSessionState) {
        self.state.send_replace(next);
    }

    async fn emit(&self, event: VoiceEvent) {
        let kind = event.kind();
        if self.events.send(event).await.is_err() {
            log::debug!("[voice] call_id={} {} not delivered: receiver gone", self.call_id, kind);
        }
    }

    async fn finish(self, exit: Exit) {
        match &exit {
            Exit::Requested => log::info!("[voice] call_id={} closed", self.call_id),
            Exit::RemoteClosed => log::info!("[voice] call_id={} closed by remote", self.call_id),
            Exit::Failed(err) => log::warn!("[voice] call_id={} session failed: {}", self.call_id, err),
        }
        {
            let mut map = self
                .sessions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if map
                .get(&self.call_id)
                .is_some_and(|h| h.generation == self.generation)
            {
                map.remove(&self.call_id);
            }
        }
        self.set_state(VoiceSessionState::Closed);
        if let Exit::Failed(err) = exit {
            self.emit(VoiceEvent::Error {
                call_id: self.call_id.clone(),
                message: err.to_string(),
            })
            .await;
        }
        self.emit(VoiceEvent::Closed {
            call_id: self.call_id.clone(),
        })
        .await;
    }
}

async fn send_json(link: &mut RealtimeLink, msg: &Value) -> Result<(), VoiceError> {
    link.outbound
        .send(RealtimeFrame::Text(msg.to_string()))
        .await
        .map_err(|_| VoiceError::Transport("websocket writer closed".to_string()))
}

async fn wait_deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
