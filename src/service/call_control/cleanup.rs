use crate::service::call_control::playback::lock_queues;
use crate::service::call_control::CallController;
use crate::shared::entities::{CallId, CallState};
use crate::shared::error::ControlError;

impl CallController {
    /// Tears a call down. `id` may be the native call id or the correlation id.
    ///
    /// The session leaves the registry before anything else happens, so a
    /// second caller finds nothing and returns `false`.
    pub async fn cleanup(&self, id: &str) -> bool {
        let Some(mut session) = self.inner.registry.take_for_cleanup(id) else {
            log::debug!("[call] cleanup of {}: nothing to do", id);
            return false;
        };
        session.cancel.cancel();
        lock_queues(&self.inner.playback).remove(&session.call_id);
        log::info!("[call] call_id={} cleaning up", session.call_id);

        let call_id = &session.call_id;
        let control = &self.inner.control;

        let release_ssrc = async {
            self.inner.ingress.release_call(call_id);
        };
        let snoop = async {
            if let Some(channel) = &session.snoop_channel {
                report(call_id, "hangup snoop", control.hangup(channel).await);
            }
        };
        let main_bridge = async {
            if let Some(bridge) = &session.bridge {
                report(call_id, "destroy bridge", control.destroy_bridge(bridge).await);
            }
        };
        let media_bridge = async {
            if let Some(bridge) = &session.media_bridge {
                report(call_id, "destroy media bridge", control.destroy_bridge(bridge).await);
            }
        };
        let external = async {
            if let Some(channel) = &session.external_media_channel {
                report(call_id, "hangup external media", control.hangup(channel).await);
            }
        };
        let main = async {
            report(call_id, "hangup", control.hangup(&session.channel).await);
        };
        let voice = async {
            self.inner.voice.close(session.voice_key());
        };
        let conversation = async {
            if let Some(conversation_id) = &session.conversation_id {
                if let Err(err) = self.inner.store.complete(conversation_id).await {
                    log::warn!("[call] call_id={} complete conversation: {}", call_id, err);
                }
            }
        };
        tokio::join!(
            release_ssrc,
            snoop,
            main_bridge,
            media_bridge,
            external,
            main,
            voice,
            conversation
        );

        if let Err(err) = session.transition(CallState::Terminated) {
            log::warn!("[call] call_id={} {}", session.call_id, err);
        }
        log::info!("[call] call_id={} {}", session.call_id, session.state);
        true
    }
}

fn report(call_id: &CallId, what: &str, res: Result<(), ControlError>) {
    match res {
        Ok(()) => {}
        Err(ControlError::NotFound(resource)) => {
            log::debug!("[call] call_id={} {}: {} already gone", call_id, what, resource);
        }
        Err(err) => log::warn!("[call] call_id={} {} failed: {}", call_id, what, err),
    }
}
