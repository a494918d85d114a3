//! Process-wide table of active calls.
//!
//! Every operation takes the lock once and completes without awaiting, so
//! callers interleaving at suspension points never observe a half-applied
//! update (lookup and mutation always happen in the same critical section).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::shared::entities::{
    CallError, CallId, CallSession, CallSessionPatch, CallState, ChannelId,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("call {0} is already registered")]
    AlreadyExists(CallId),
    #[error("call {0} is not registered")]
    NotFound(CallId),
    #[error(transparent)]
    Transition(#[from] CallError),
}

/// Result of trying to bind an unknown SSRC to a waiting call.
#[derive(Debug)]
pub enum SsrcClaim {
    Bound(CallSession),
    NoneWaiting,
    Ambiguous(usize),
}

#[derive(Clone, Default)]
pub struct CallRegistry {
    inner: Arc<Mutex<HashMap<CallId, CallSession>>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CallId, CallSession>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, session: CallSession) -> Result<(), RegistryError> {
        let mut map = self.lock();
        if map.contains_key(&session.call_id) {
            return Err(RegistryError::AlreadyExists(session.call_id));
        }
        map.insert(session.call_id.clone(), session);
        Ok(())
    }

    /// Merges `patch` into the session and returns the updated snapshot.
    pub fn update(
        &self,
        call_id: &CallId,
        patch: CallSessionPatch,
    ) -> Result<CallSession, RegistryError> {
        let mut map = self.lock();
        let session = map
            .get_mut(call_id)
            .ok_or_else(|| RegistryError::NotFound(call_id.clone()))?;
        session.apply(patch);
        Ok(session.clone())
    }

    pub fn get(&self, call_id: &CallId) -> Option<CallSession> {
        self.lock().get(call_id).cloned()
    }

    pub fn contains(&self, call_id: &CallId) -> bool {
        self.lock().contains_key(call_id)
    }

    pub fn remove(&self, call_id: &CallId) -> Option<CallSession> {
        self.lock().remove(call_id)
    }

    /// Looks a call up by native call id or correlation id.
    pub fn find(&self, id: &str) -> Option<CallSession> {
        let map = self.lock();
        if let Some(session) = map.values().find(|s| s.call_id.as_str() == id) {
            return Some(session.clone());
        }
        map.values().find(|s| s.matches_id(id)).cloned()
    }

    /// Looks a call up by any channel it owns (primary, snoop or external media).
    pub fn find_by_channel(&self, channel: &ChannelId) -> Option<CallSession> {
        self.lock()
            .values()
            .find(|s| s.owns_channel(channel))
            .cloned()
    }

    /// Applies a validated state transition and returns the previous state.
    pub fn transition(&self, call_id: &CallId, next: CallState) -> Result<CallState, RegistryError> {
        let mut map = self.lock();
        let session = map
            .get_mut(call_id)
            .ok_or_else(|| RegistryError::NotFound(call_id.clone()))?;
        Ok(session.transition(next)?)
    }

    /// Removes the call identified by native or correlation id and marks it
    /// `CleaningUp`. Returns `None` when another caller already took it.
    pub fn take_for_cleanup(&self, id: &str) -> Option<CallSession> {
        let mut map = self.lock();
        let key = map
            .values()
            .find(|s| s.matches_id(id))
            .map(|s| s.call_id.clone())?;
        let mut session = map.remove(&key)?;
        if let Err(err) = session.transition(CallState::CleaningUp) {
            log::warn!("[registry] call_id={} {}", key, err);
        }
        Some(session)
    }

    /// Binds `ssrc` to the call waiting for its external media stream.
    ///
    /// A waiting call whose announced RTP source equals `src` wins; otherwise the
    /// binding only happens when exactly one call is waiting.
    pub fn claim_awaiting_ssrc(&self, ssrc: u32, src: SocketAddr) -> SsrcClaim {
        let mut map = self.lock();
        let waiting: Vec<&CallId> = map
            .values()
            .filter(|s| s.state == CallState::ExternalMediaAwaitingSsrc)
            .map(|s| &s.call_id)
            .collect();
        let by_source = map
            .values()
            .find(|s| {
                s.state == CallState::ExternalMediaAwaitingSsrc && s.rtp_source == Some(src)
            })
            .map(|s| s.call_id.clone());
        let chosen = match (by_source, waiting.len()) {
            (Some(call_id), _) => call_id,
            (None, 0) => return SsrcClaim::NoneWaiting,
            (None, 1) => waiting[0].clone(),
            (None, n) => return SsrcClaim::Ambiguous(n),
        };
        let Some(session) = map.get_mut(&chosen) else {
            return SsrcClaim::NoneWaiting;
        };
        session.ssrc = Some(ssrc);
        if let Err(err) = session.transition(CallState::Streaming) {
            log::warn!("[registry] call_id={} {}", chosen, err);
        }
        SsrcClaim::Bound(session.clone())
    }

    pub fn scan<F>(&self, mut predicate: F) -> Vec<CallSession>
    where
        F: FnMut(&CallSession) -> bool,
    {
        self.lock()
            .values()
            .filter(|s| predicate(s))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
