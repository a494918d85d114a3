//! Realtime voice-AI sessions, one per call.
//!
//! `VoiceSessionManager` is the only entry point. Each open session is an actor
//! task (see `session`) fed through a command channel; the manager only keeps
//! the handle map.

pub mod protocol;
mod session;
pub mod transport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;

use crate::shared::config::VoiceConfig;
use crate::shared::entities::{CallId, ConversationId};
use crate::shared::ports::{AudioSink, ConversationStore, VoiceEventTx};

pub use session::{OutboundItem, VoiceSessionState};
pub use transport::{RealtimeConnector, RealtimeFrame, RealtimeLink, VoiceFuture, WsConnector};

use session::{SessionActor, SessionCommand, SessionHandle, SessionMap};

const SESSION_COMMAND_CAPACITY: usize = 512;

pub struct OpenSession {
    pub call_id: CallId,
    pub correlation_id: Option<CallId>,
    pub conversation_id: Option<ConversationId>,
    pub instructions: String,
}

impl OpenSession {
    /// Sessions are keyed like forwarded audio: correlation id first.
    fn key(&self) -> &CallId {
        self.correlation_id.as_ref().unwrap_or(&self.call_id)
    }
}

#[derive(Clone)]
pub struct VoiceSessionManager {
    cfg: VoiceConfig,
    connector: Arc<dyn RealtimeConnector>,
    events: VoiceEventTx,
    store: Arc<dyn ConversationStore>,
    sessions: SessionMap,
    generation: Arc<AtomicU64>,
}

impl VoiceSessionManager {
    pub fn new(
        cfg: VoiceConfig,
        connector: Arc<dyn RealtimeConnector>,
        events: VoiceEventTx,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            cfg,
            connector,
            events,
            store,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CallId, SessionHandle>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawns a session actor. Returns `false` when one is already open.
    pub fn open(&self, req: OpenSession) -> bool {
        let key = req.key().clone();
        let mut map = self.lock();
        if map.contains_key(&key) {
            log::warn!("[voice] call_id={} session already open, ignored", key);
            return false;
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (cmd_tx, cmd_rx) = mpsc::channel(SESSION_COMMAND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(VoiceSessionState::Connecting);
        map.insert(
            key.clone(),
            SessionHandle {
                generation,
                commands: cmd_tx,
                state: state_rx,
            },
        );
        drop(map);

        log::info!(
            "[voice] call_id={} opening session (native call_id={})",
            key,
            req.call_id
        );
        let actor = SessionActor {
            call_id: key,
            generation,
            conversation_id: req.conversation_id,
            instructions: req.instructions,
            cfg: self.cfg.clone(),
            connector: Arc::clone(&self.connector),
            events: self.events.clone(),
            store: Arc::clone(&self.store),
            commands: cmd_rx,
            state: state_tx,
            sessions: Arc::clone(&self.sessions),
        };
        tokio::spawn(actor.run());
        true
    }

    pub fn send_audio_chunk(&self, call_id: &CallId, mulaw: Vec<u8>) {
        self.send(call_id, SessionCommand::Audio(mulaw));
    }

    /// Injects a conversation item followed by `response.create`. Dropped
    /// unless the session is ready.
    pub fn send_text_message(&self, call_id: &CallId, item: OutboundItem) {
        self.send(call_id, SessionCommand::Item(item));
    }

    /// Closes and forgets the session. Returns `false` when none was open.
    pub fn close(&self, call_id: &CallId) -> bool {
        let Some(handle) = self.lock().remove(call_id) else {
            log::debug!("[voice] call_id={} close: no open session", call_id);
            return false;
        };
        if let Err(TrySendError::Full(_)) = handle.commands.try_send(SessionCommand::Close) {
            // the actor also stops once every command sender is gone
            log::debug!("[voice] call_id={} command queue full on close", call_id);
        }
        true
    }

    pub fn is_open(&self, call_id: &CallId) -> bool {
        self.lock().contains_key(call_id)
    }

    pub fn state(&self, call_id: &CallId) -> Option<VoiceSessionState> {
        self.lock().get(call_id).map(|h| *h.state.borrow())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn send(&self, call_id: &CallId, cmd: SessionCommand) {
        let map = self.lock();
        let Some(handle) = map.get(call_id) else {
            log::debug!("[voice] call_id={} no session, dropped {:?}", call_id, cmd);
            return;
        };
        match handle.commands.try_send(cmd) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("[voice] call_id={} command queue full, dropped", call_id);
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("[voice] call_id={} session is shutting down", call_id);
            }
        }
    }
}

impl AudioSink for VoiceSessionManager {
    fn push_audio(&self, call_id: &CallId, mulaw: Vec<u8>) {
        self.send_audio_chunk(call_id, mulaw);
    }
}
