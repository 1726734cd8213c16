//! Cancellation bookkeeping for in-flight pipeline operations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Running and paused flags shared by the orchestrator and the registry.
#[derive(Debug, Default)]
pub struct RunFlags {
    running: AtomicBool,
    paused: AtomicBool,
    resumed: Notify,
}

impl RunFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `running` if it was clear. Returns false when already running.
    pub fn try_start(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
        if !paused {
            self.resumed.notify_waiters();
        }
    }

    /// Clear both flags and release anyone waiting on a pause.
    pub fn clear(&self) {
        self.running.store(false, Ordering::Release);
        self.paused.store(false, Ordering::Release);
        self.resumed.notify_waiters();
    }

    /// Block while paused. Returns false if `token` was cancelled meanwhile.
    pub async fn wait_while_paused(&self, token: &CancellationToken) -> bool {
        loop {
            // Created before the flag check so a resume in between is not lost
            let resumed = self.resumed.notified();
            if token.is_cancelled() {
                return false;
            }
            if !self.is_paused() {
                return true;
            }
            tokio::select! {
                _ = resumed => {}
                _ = token.cancelled() => return false,
            }
        }
    }
}

/// Maps operation ids to cancellation tokens.
///
/// Unknown ids are a no-op everywhere.
#[derive(Debug)]
pub struct AbortRegistry {
    entries: Mutex<HashMap<String, CancellationToken>>,
    flags: Arc<RunFlags>,
}

impl AbortRegistry {
    pub fn new(flags: Arc<RunFlags>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            flags,
        }
    }

    /// Register an operation whose token is a child of `parent`.
    ///
    /// Re-registering an id replaces the previous token without cancelling it.
    pub fn register(&self, id: impl Into<String>, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        self.entries.lock().insert(id.into(), token.clone());
        token
    }

    /// Forget a finished operation without cancelling it.
    pub fn remove(&self, id: &str) {
        self.entries.lock().remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Cancel and remove one operation. Returns whether it existed.
    pub fn cancel_one(&self, id: &str) -> bool {
        match self.entries.lock().remove(id) {
            Some(token) => {
                token.cancel();
                debug!(operation = %id, "Operation cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel and remove every operation whose id matches `predicate`.
    pub fn cancel_where(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let mut entries = self.entries.lock();
        let ids: Vec<String> = entries.keys().filter(|id| predicate(id)).cloned().collect();
        for id in &ids {
            if let Some(token) = entries.remove(id) {
                token.cancel();
            }
        }
        ids.len()
    }

    /// Cancel and clear every operation, then clear the running/paused flags.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(String, CancellationToken)> = self.entries.lock().drain().collect();
        for (_, token) in &drained {
            token.cancel();
        }
        self.flags.clear();
        debug!(cancelled = drained.len(), "All operations cancelled");
        drained.len()
    }
}
