//! Call-control state machine.
//!
//! The controller reacts to control-plane events and voice events for every
//! call. The dispatch loop itself never awaits a control-plane command: setup,
//! cleanup and playback run in spawned tasks that re-check the registry after
//! each suspension point.

mod classify;
mod cleanup;
mod playback;
mod setup;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::ingress::MediaIngress;
use crate::service::registry::CallRegistry;
use crate::service::voice::VoiceSessionManager;
use crate::shared::config::Config;
use crate::shared::entities::ChannelId;
use crate::shared::error::ControlError;
use crate::shared::ports::{
    ControlEvent, ControlPlanePort, ConversationStore, VoiceEvent, VoiceEventRx,
};

pub use classify::{
    classify_channel, external_media_channel_id, snoop_app_args, snoop_channel_id, ChannelKind,
};
pub use setup::SetupError;

use playback::PlaybackQueues;

struct ControllerInner {
    cfg: Config,
    control: Arc<dyn ControlPlanePort>,
    registry: CallRegistry,
    ingress: MediaIngress,
    voice: VoiceSessionManager,
    store: Arc<dyn ConversationStore>,
    playback: PlaybackQueues,
}

#[derive(Clone)]
pub struct CallController {
    inner: Arc<ControllerInner>,
}

impl CallController {
    pub fn new(
        cfg: Config,
        control: Arc<dyn ControlPlanePort>,
        registry: CallRegistry,
        ingress: MediaIngress,
        voice: VoiceSessionManager,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                cfg,
                control,
                registry,
                ingress,
                voice,
                store,
                playback: PlaybackQueues::default(),
            }),
        }
    }

    pub fn registry(&self) -> &CallRegistry {
        &self.inner.registry
    }

    /// Runs until `shutdown` fires or the control plane stays unreachable.
    ///
    /// A closed event stream triggers a reconnect with the same backoff as the
    /// initial connection. On shutdown, and when the control plane is given up
    /// on, every active call is cleaned up.
    pub async fn run(
        &self,
        mut voice_events: VoiceEventRx,
        shutdown: CancellationToken,
    ) -> Result<(), ControlError> {
        loop {
            let mut events = match self.connect_with_backoff(&shutdown).await {
                Ok(Some(events)) => events,
                Ok(None) => break,
                Err(err) => {
                    self.shutdown_calls().await;
                    return Err(err);
                }
            };
            log::info!("[call] subscribed to app {}", self.inner.cfg.ari.app);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        self.shutdown_calls().await;
                        return Ok(());
                    }
                    ev = events.recv() => match ev {
                        Some(ev) => self.handle_control_event(ev),
                        None => {
                            log::warn!("[call] control event stream closed, reconnecting");
                            break;
                        }
                    },
                    Some(ev) = voice_events.recv() => self.handle_voice_event(ev),
                }
            }
        }
        self.shutdown_calls().await;
        Ok(())
    }

    /// `Ok(None)` when shutdown was requested while connecting.
    async fn connect_with_backoff(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Option<mpsc::Receiver<ControlEvent>>, ControlError> {
        let ari = &self.inner.cfg.ari;
        let attempts = ari.connect_attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            let res = async {
                self.inner.control.connect().await?;
                self.inner.control.subscribe_app().await
            }
            .await;
            match res {
                Ok(events) => return Ok(Some(events)),
                Err(err) => {
                    log::warn!(
                        "[call] control plane connect attempt {}/{} failed: {}",
                        attempt,
                        attempts,
                        err
                    );
                    last = err.to_string();
                }
            }
            if attempt == attempts {
                break;
            }
            let delay = backoff_delay(ari.connect_base_delay, ari.connect_max_delay, attempt);
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        log::error!("[call] control plane unreachable after {} attempts", attempts);
        Err(ControlError::Unreachable { attempts, last })
    }

    pub fn handle_control_event(&self, ev: ControlEvent) {
        match ev {
            ControlEvent::ChannelEnteredApp { channel, args } => {
                match classify_channel(&channel, &args) {
                    ChannelKind::Primary => {
                        if self.inner.registry.find_by_channel(&channel.id).is_some() {
                            log::debug!("[call] duplicate entry for channel {} ignored", channel.id);
                            return;
                        }
                        tokio::spawn(self.clone().setup_primary(channel));
                    }
                    ChannelKind::Snoop { parent } => {
                        tokio::spawn(self.clone().attach_snoop(channel, parent));
                    }
                    ChannelKind::ExternalMedia => {
                        log::info!("[call] external media channel {} entered app", channel.id);
                    }
                }
            }
            ControlEvent::ChannelLeftApp { channel } => self.on_channel_gone(&channel, "left app"),
            ControlEvent::ChannelDestroyed { channel, cause } => {
                log::debug!("[call] channel {} destroyed (cause {:?})", channel, cause);
                self.on_channel_gone(&channel, "destroyed");
            }
            ControlEvent::HangupRequested { channel } => {
                self.on_channel_gone(&channel, "hangup requested")
            }
            ControlEvent::DtmfReceived { channel, digit } => {
                match self.inner.registry.find_by_channel(&channel) {
                    Some(session) => {
                        log::info!("[call] call_id={} dtmf {}", session.call_id, digit)
                    }
                    None => log::debug!("[call] dtmf {} on untracked channel {}", digit, channel),
                }
            }
            ControlEvent::Error { message } => {
                log::warn!("[call] control plane error: {}", message);
            }
        }
    }

    fn on_channel_gone(&self, channel: &ChannelId, what: &str) {
        let Some(session) = self.inner.registry.find_by_channel(channel) else {
            log::debug!("[call] untracked channel {} {}", channel, what);
            return;
        };
        if &session.channel != channel {
            log::info!(
                "[call] call_id={} media channel {} {}",
                session.call_id,
                channel,
                what
            );
            return;
        }
        log::info!("[call] call_id={} channel {}, cleaning up", session.call_id, what);
        let controller = self.clone();
        tokio::spawn(async move {
            controller.cleanup(session.call_id.as_str()).await;
        });
    }

    pub fn handle_voice_event(&self, ev: VoiceEvent) {
        match ev {
            VoiceEvent::AudioChunk { call_id, mulaw } => {
                self.enqueue_playback(call_id, mulaw);
            }
            VoiceEvent::TextMessage {
                call_id,
                role,
                text,
            } => {
                log::info!(
                    "[call] call_id={} {} message ({} chars)",
                    call_id,
                    role.as_str(),
                    text.chars().count()
                );
            }
            VoiceEvent::FunctionCall {
                call_id,
                function_call_id,
                name,
                ..
            } => {
                log::info!(
                    "[call] call_id={} function call {} ({})",
                    call_id,
                    name,
                    function_call_id
                );
            }
            VoiceEvent::ResponseDone { call_id } => {
                log::debug!("[call] call_id={} response done", call_id);
            }
            VoiceEvent::Error { call_id, message } => {
                log::warn!("[call] call_id={} voice session error: {}", call_id, message);
                let controller = self.clone();
                tokio::spawn(async move {
                    controller.cleanup(call_id.as_str()).await;
                });
            }
            VoiceEvent::Closed { call_id } => {
                log::info!("[call] call_id={} voice session closed", call_id);
            }
        }
    }

    async fn shutdown_calls(&self) {
        let active = self.inner.registry.scan(|_| true);
        if active.is_empty() {
            return;
        }
        log::info!("[call] shutting down {} active call(s)", active.len());
        for session in active {
            self.cleanup(session.call_id.as_str()).await;
        }
    }
}

fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

#[cfg(test)]
pub(crate) mod testing;
