//! Directory of connected sessions plus storage for disconnected ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use session_store::{SessionSnapshot, SessionStorage};
use tracing::debug;

use crate::error::RuntimeError;
use crate::runtime::client::SessionClient;
use crate::session::{AppSession, StoredSessionState};

/// A connected session and its transport.
pub struct ActiveSessionInfo {
    pub session: Arc<AppSession>,
    pub client: Arc<dyn SessionClient>,
    script_run_count: AtomicU64,
}

impl ActiveSessionInfo {
    #[must_use]
    pub fn new(session: Arc<AppSession>, client: Arc<dyn SessionClient>, run_count: u64) -> Self {
        Self {
            session,
            client,
            script_run_count: AtomicU64::new(run_count),
        }
    }

    /// Completed successful script runs, the age unit of the message cache.
    #[must_use]
    pub fn script_run_count(&self) -> u64 {
        self.script_run_count.load(Ordering::SeqCst)
    }

    pub(crate) fn increment_script_run_count(&self) -> u64 {
        self.script_run_count.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub struct SessionManager {
    active: HashMap<String, Arc<ActiveSessionInfo>>,
    storage: Box<dyn SessionStorage>,
}

impl SessionManager {
    #[must_use]
    pub fn new(storage: Box<dyn SessionStorage>) -> Self {
        Self {
            active: HashMap::new(),
            storage,
        }
    }

    pub fn add(&mut self, info: ActiveSessionInfo) -> Arc<ActiveSessionInfo> {
        let info = Arc::new(info);
        self.active
            .insert(info.session.id().to_string(), Arc::clone(&info));
        info
    }

    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<ActiveSessionInfo>> {
        self.active.get(session_id).cloned()
    }

    #[must_use]
    pub fn is_active(&self, session_id: &str) -> bool {
        self.active.contains_key(session_id)
    }

    pub fn remove(&mut self, session_id: &str) -> Option<Arc<ActiveSessionInfo>> {
        self.active.remove(session_id)
    }

    /// Every active session, ordered by id so a sweep visits them in a stable order.
    #[must_use]
    pub fn snapshot_active(&self) -> Vec<Arc<ActiveSessionInfo>> {
        let mut sessions: Vec<Arc<ActiveSessionInfo>> = self.active.values().cloned().collect();
        sessions.sort_by(|a, b| a.session.id().cmp(b.session.id()));
        sessions
    }

    pub fn drain_active(&mut self) -> Vec<Arc<ActiveSessionInfo>> {
        let mut sessions: Vec<Arc<ActiveSessionInfo>> =
            self.active.drain().map(|(_, info)| info).collect();
        sessions.sort_by(|a, b| a.session.id().cmp(b.session.id()));
        sessions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Persists `info` so a later connect with the same id can resume it.
    pub fn store(&mut self, info: &ActiveSessionInfo) -> Result<(), RuntimeError> {
        let session_id = info.session.id();
        let state = serde_json::to_value(info.session.snapshot()).map_err(|source| {
            RuntimeError::SessionState {
                session_id: session_id.to_string(),
                source,
            }
        })?;
        let snapshot = SessionSnapshot::now(session_id, info.script_run_count(), state)?;
        self.storage.save(snapshot)?;
        debug!(session_id, "session stored for reconnect");
        Ok(())
    }

    /// Removes and returns the stored state of `session_id` with its script run count.
    pub fn take_stored(
        &mut self,
        session_id: &str,
    ) -> Result<Option<(StoredSessionState, u64)>, RuntimeError> {
        let Some(snapshot) = self.storage.load(session_id)? else {
            return Ok(None);
        };
        self.storage.delete(session_id)?;

        let state: StoredSessionState =
            serde_json::from_value(snapshot.state).map_err(|source| RuntimeError::SessionState {
                session_id: session_id.to_string(),
                source,
            })?;
        Ok(Some((state, snapshot.script_run_count)))
    }

    pub fn delete_stored(&mut self, session_id: &str) -> Result<(), RuntimeError> {
        self.storage.delete(session_id)?;
        Ok(())
    }

    pub fn stored_ids(&self) -> Result<Vec<String>, RuntimeError> {
        Ok(self.storage.list()?)
    }

    pub fn evict_expired(&mut self) -> Result<Vec<String>, RuntimeError> {
        Ok(self.storage.evict_expired()?)
    }
}
