use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::shared::entities::CallId;

/// SSRC → native call id.
#[derive(Clone, Default)]
pub struct SsrcTable {
    inner: Arc<Mutex<HashMap<u32, CallId>>>,
}

impl SsrcTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, CallId>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, ssrc: u32) -> Option<CallId> {
        self.lock().get(&ssrc).cloned()
    }

    /// Binds `ssrc`, returning the call it was previously bound to.
    pub fn bind(&self, ssrc: u32, call_id: CallId) -> Option<CallId> {
        self.lock().insert(ssrc, call_id)
    }

    /// Removes the mapping only if it still points at `call_id`.
    pub fn remove_if(&self, ssrc: u32, call_id: &CallId) -> bool {
        let mut map = self.lock();
        if map.get(&ssrc) == Some(call_id) {
            map.remove(&ssrc);
            return true;
        }
        false
    }

    /// Drops every SSRC bound to `call_id`; returns how many were removed.
    pub fn release_call(&self, call_id: &CallId) -> usize {
        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, bound| bound != call_id);
        before - map.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
