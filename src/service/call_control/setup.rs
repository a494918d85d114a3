use std::time::Duration;

use thiserror::Error;

use crate::service::call_control::classify::{
    external_media_channel_id, snoop_app_args, snoop_channel_id,
};
use crate::service::call_control::CallController;
use crate::service::registry::RegistryError;
use crate::service::voice::OpenSession;
use crate::shared::entities::{
    BridgeId, CallId, CallSession, CallSessionPatch, CallState, ChannelId,
};
use crate::shared::error::{ControlError, IngressError};
use crate::shared::ports::{ChannelInfo, ExternalMediaRequest, SnoopRequest};

const EXTERNAL_MEDIA_FORMAT: &str = "slin";
/// The snoop channel can enter the app before the snoop command returns.
const SNOOP_PARENT_WAIT: Duration = Duration::from_millis(1_000);
const SNOOP_PARENT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Ingress(#[from] IngressError),
    /// The call was cleaned up while setup was suspended.
    #[error("call went away during setup")]
    Abandoned,
}

impl CallController {
    pub(crate) async fn setup_primary(self, channel: ChannelInfo) {
        let call_id = match CallId::from_channel(&channel.id) {
            Ok(id) => id,
            Err(err) => {
                log::warn!("[call] channel with unusable id ignored: {}", err);
                return;
            }
        };
        let correlation_id = self.read_correlation(&channel.id).await;
        let session = CallSession::new(call_id.clone(), channel.id.clone(), correlation_id);
        if let Err(err) = self.inner.registry.add(session) {
            log::debug!("[call] call_id={} not registered: {}", call_id, err);
            return;
        }
        log::info!(
            "[call] call_id={} new call from {} ({})",
            call_id,
            channel.caller_number.as_deref().unwrap_or("unknown"),
            channel.name
        );
        match self.build_primary_pipeline(&call_id, &channel.id).await {
            Ok(()) => log::info!("[call] call_id={} pipeline ready, awaiting snoop", call_id),
            Err(SetupError::Abandoned) => {
                log::info!("[call] call_id={} ended during setup", call_id)
            }
            Err(err) => {
                log::warn!("[call] call_id={} setup failed: {}", call_id, err);
                self.cleanup(call_id.as_str()).await;
            }
        }
    }

    async fn read_correlation(&self, channel: &ChannelId) -> Option<CallId> {
        for name in &self.inner.cfg.ari.correlation_variables {
            match self.inner.control.get_variable(channel, name).await {
                Ok(Some(value)) => {
                    if let Ok(id) = CallId::new(value.trim()) {
                        return Some(id);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    log::debug!("[call] channel {} variable {}: {}", channel, name, err);
                }
            }
        }
        None
    }

    async fn build_primary_pipeline(
        &self,
        call_id: &CallId,
        channel: &ChannelId,
    ) -> Result<(), SetupError> {
        let control = &self.inner.control;

        control.answer(channel).await?;
        self.advance(call_id, CallState::Answered)?;
        self.advance(call_id, CallState::PipelineSetup)?;

        let correlation_id = self.current(call_id)?.correlation_id;
        let conversation_id = match self
            .inner
            .store
            .begin(call_id, correlation_id.as_ref())
            .await
        {
            Ok(id) => Some(id),
            Err(err) => {
                log::warn!("[call] call_id={} conversation not started: {}", call_id, err);
                None
            }
        };
        self.patch(
            call_id,
            CallSessionPatch {
                conversation_id: conversation_id.clone(),
                ..Default::default()
            },
        )?;

        let bridge = control.create_bridge().await?;
        if let Err(err) = self.patch(
            call_id,
            CallSessionPatch {
                bridge: Some(bridge.clone()),
                ..Default::default()
            },
        ) {
            self.release_bridge(&bridge).await;
            return Err(err);
        }

        let recording = control
            .record_bridge(&bridge, &format!("call-{}", call_id))
            .await?;
        self.patch(
            call_id,
            CallSessionPatch {
                recording: Some(recording),
                ..Default::default()
            },
        )?;

        control.add_channel(&bridge, channel).await?;
        self.advance(call_id, CallState::MainBridged)?;

        let voice_key = correlation_id.clone().unwrap_or_else(|| call_id.clone());
        self.inner.voice.open(OpenSession {
            call_id: call_id.clone(),
            correlation_id,
            conversation_id,
            instructions: self.inner.cfg.voice.initial_prompt.clone(),
        });
        if self.current(call_id).is_err() {
            // cleanup ran between the transition and the open
            self.inner.voice.close(&voice_key);
            return Err(SetupError::Abandoned);
        }

        let snoop = control
            .snoop(SnoopRequest {
                channel: channel.clone(),
                snoop_id: snoop_channel_id(call_id),
                app: self.inner.cfg.ari.app.clone(),
                app_args: snoop_app_args(call_id),
            })
            .await?;
        if let Err(err) = self.patch(
            call_id,
            CallSessionPatch {
                snoop_channel: Some(snoop.clone()),
                ..Default::default()
            },
        ) {
            self.release_channel(&snoop).await;
            return Err(err);
        }
        self.advance(call_id, CallState::SnoopCreated)?;
        Ok(())
    }

    pub(crate) async fn attach_snoop(self, snoop: ChannelInfo, parent: Option<CallId>) {
        let Some(parent) = parent else {
            log::warn!("[call] snoop {} has no parent, hanging up", snoop.id);
            self.release_channel(&snoop.id).await;
            return;
        };
        let Some(call_id) = self.await_snoop_parent(&parent).await else {
            log::warn!(
                "[call] snoop {} parent {} not awaiting media, hanging up",
                snoop.id,
                parent
            );
            self.release_channel(&snoop.id).await;
            return;
        };
        match self.build_media_path(&call_id, &snoop.id).await {
            Ok(()) => log::info!("[call] call_id={} external media requested", call_id),
            Err(SetupError::Abandoned) => {
                log::info!("[call] call_id={} ended during media setup", call_id);
                self.release_channel(&snoop.id).await;
            }
            Err(err) => {
                log::warn!("[call] call_id={} media setup failed: {}", call_id, err);
                self.cleanup(call_id.as_str()).await;
            }
        }
    }

    /// Waits briefly for the parent to reach `SnoopCreated`.
    async fn await_snoop_parent(&self, parent: &CallId) -> Option<CallId> {
        let deadline = tokio::time::Instant::now() + SNOOP_PARENT_WAIT;
        loop {
            let session = self.inner.registry.find(parent.as_str())?;
            match session.state {
                CallState::SnoopCreated => return Some(session.call_id),
                CallState::MainBridged if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(SNOOP_PARENT_POLL).await;
                }
                _ => return None,
            }
        }
    }

    async fn build_media_path(&self, call_id: &CallId, snoop: &ChannelId) -> Result<(), SetupError> {
        let control = &self.inner.control;
        control.answer(snoop).await?;
        self.current(call_id)?;

        let local = self.inner.ingress.ensure_ready().await?;
        let external_host = format!("{}:{}", self.inner.cfg.ingress.advertised_host, local.port());
        let external = control
            .external_media(ExternalMediaRequest {
                channel_id: external_media_channel_id(call_id),
                app: self.inner.cfg.ari.app.clone(),
                external_host,
                format: EXTERNAL_MEDIA_FORMAT.to_string(),
            })
            .await?;
        if let Err(err) = self.patch(
            call_id,
            CallSessionPatch {
                external_media_channel: Some(external.channel.clone()),
                rtp_source: external.rtp_source,
                ..Default::default()
            },
        ) {
            self.release_channel(&external.channel).await;
            return Err(err);
        }

        let media_bridge = control.create_bridge().await?;
        if let Err(err) = self.patch(
            call_id,
            CallSessionPatch {
                media_bridge: Some(media_bridge.clone()),
                ..Default::default()
            },
        ) {
            self.release_bridge(&media_bridge).await;
            return Err(err);
        }
        control.add_channel(&media_bridge, snoop).await?;
        control.add_channel(&media_bridge, &external.channel).await?;
        self.advance(call_id, CallState::ExternalMediaAwaitingSsrc)?;
        Ok(())
    }

    fn current(&self, call_id: &CallId) -> Result<CallSession, SetupError> {
        self.inner
            .registry
            .get(call_id)
            .ok_or(SetupError::Abandoned)
    }

    fn advance(&self, call_id: &CallId, next: CallState) -> Result<(), SetupError> {
        match self.inner.registry.transition(call_id, next) {
            Ok(_) => Ok(()),
            Err(RegistryError::NotFound(_)) => Err(SetupError::Abandoned),
            Err(err) => Err(err.into()),
        }
    }

    fn patch(&self, call_id: &CallId, patch: CallSessionPatch) -> Result<(), SetupError> {
        match self.inner.registry.update(call_id, patch) {
            Ok(_) => Ok(()),
            Err(RegistryError::NotFound(_)) => Err(SetupError::Abandoned),
            Err(err) => Err(err.into()),
        }
    }

    /// Hangs up a channel no call owns any more.
    async fn release_channel(&self, channel: &ChannelId) {
        if let Err(err) = self.inner.control.hangup(channel).await {
            log::debug!("[call] hangup of unowned channel {}: {}", channel, err);
        }
    }

    async fn release_bridge(&self, bridge: &BridgeId) {
        if let Err(err) = self.inner.control.destroy_bridge(bridge).await {
            log::debug!("[call] destroy of unowned bridge {}: {}", bridge, err);
        }
    }
}
