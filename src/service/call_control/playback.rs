use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use hound::{SampleFormat, WavSpec, WavWriter};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::service::call_control::CallController;
use crate::shared::entities::{CallId, CallSession};
use crate::shared::error::ControlError;
use crate::shared::media::codec::decode_mulaw_samples;

const PLAYBACK_QUEUE_CAPACITY: usize = 256;

/// Per-call playback queues, keyed by native call id.
pub(crate) type PlaybackQueues = Arc<Mutex<HashMap<CallId, mpsc::Sender<Vec<u8>>>>>;

pub(super) fn lock_queues(
    queues: &PlaybackQueues,
) -> MutexGuard<'_, HashMap<CallId, mpsc::Sender<Vec<u8>>>> {
    queues
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("wav encode failed: {0}")]
    Wav(#[from] hound::Error),
    #[error("temp file: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Control(#[from] ControlError),
}

/// Encodes μ-law 8 kHz mono as a PCM16 WAV.
pub fn mulaw_to_wav(mulaw: &[u8]) -> Result<Vec<u8>, hound::Error> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for sample in decode_mulaw_samples(mulaw) {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Writes the WAV to a temp file removed when the returned handle drops.
fn write_temp_wav(dir: &Path, wav: &[u8]) -> Result<NamedTempFile, std::io::Error> {
    let mut file = tempfile::Builder::new()
        .prefix("voicebot-")
        .suffix(".wav")
        .tempfile_in(dir)?;
    file.write_all(wav)?;
    file.flush()?;
    Ok(file)
}

/// `sound:` URI for a file on the PBX host, without the extension.
fn file_media_uri(path: &Path) -> String {
    format!("sound:{}", path.with_extension("").display())
}

impl CallController {
    /// Queues assistant audio for the call's playback worker, starting the
    /// worker on first use. Chunks of one call are played strictly in order.
    pub(crate) fn enqueue_playback(&self, voice_key: CallId, mulaw: Vec<u8>) {
        let Some(session) = self.inner.registry.find(voice_key.as_str()) else {
            log::debug!("[call] call_id={} playback for ended call dropped", voice_key);
            return;
        };
        let mut queues = lock_queues(&self.inner.playback);
        let queue = queues
            .entry(session.call_id.clone())
            .or_insert_with(|| self.spawn_playback_worker(session.clone()));
        match queue.try_send(mulaw) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("[call] call_id={} playback queue full, chunk dropped", session.call_id);
            }
            Err(TrySendError::Closed(_)) => {
                queues.remove(&session.call_id);
                log::debug!("[call] call_id={} playback worker gone, chunk dropped", session.call_id);
            }
        }
    }

    fn spawn_playback_worker(&self, session: CallSession) -> mpsc::Sender<Vec<u8>> {
        let (tx, rx) = mpsc::channel(PLAYBACK_QUEUE_CAPACITY);
        tokio::spawn(self.clone().run_playback(session, rx));
        tx
    }

    async fn run_playback(self, session: CallSession, mut rx: mpsc::Receiver<Vec<u8>>) {
        let cancel = session.cancel.clone();
        loop {
            let mulaw = tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = rx.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
            };
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("[call] call_id={} playback cancelled", session.call_id);
                    break;
                }
                res = self.play_chunk(&session, &mulaw) => {
                    if let Err(err) = res {
                        log::warn!("[call] call_id={} playback failed: {}", session.call_id, err);
                    }
                }
            }
        }
        drop(rx);
        let mut queues = lock_queues(&self.inner.playback);
        if queues
            .get(&session.call_id)
            .is_some_and(|queue| queue.is_closed())
        {
            queues.remove(&session.call_id);
        }
    }

    async fn play_chunk(&self, session: &CallSession, mulaw: &[u8]) -> Result<(), PlaybackError> {
        let wav = mulaw_to_wav(mulaw)?;
        let temp = write_temp_wav(&self.inner.cfg.playback.dir, &wav)?;
        let name = temp
            .path()
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("voicebot-{}", uuid::Uuid::new_v4()));
        let control = &self.inner.control;

        let uploaded = match control.upload_sound(&name, wav).await {
            Ok(()) => true,
            Err(err) => {
                log::debug!("[call] call_id={} sound upload failed: {}", session.call_id, err);
                false
            }
        };
        if !self.inner.registry.contains(&session.call_id) {
            return Ok(());
        }
        if uploaded {
            match control.play(&session.channel, &format!("sound:{}", name)).await {
                Ok(playback) => {
                    log::debug!("[call] call_id={} playing {}", session.call_id, playback);
                    return Ok(());
                }
                Err(err) => {
                    log::debug!("[call] call_id={} play sound:{} failed: {}", session.call_id, name, err);
                }
            }
            if !self.inner.registry.contains(&session.call_id) {
                return Ok(());
            }
        }
        let playback = control
            .play(&session.channel, &file_media_uri(temp.path()))
            .await?;
        log::debug!("[call] call_id={} playing file {}", session.call_id, playback);
        Ok(())
    }
}
