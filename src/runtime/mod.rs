//! Process-wide owner of sessions, the message cache and the loop thread.
//!
//! The loop thread drains every active session's message queue, runs tasks scheduled
//! through [`LoopHandle::call_soon`] and polls watched sources. The message cache is only
//! touched from that thread; other threads schedule cache work as tasks.

pub mod client;
pub mod send;
pub mod session_manager;

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use session_store::{MemorySessionStorage, SessionStorage};
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::core::back_msg::BackMsg;
use crate::core::forward_msg::{ForwardMsg, UserInfo};
use crate::core::forward_msg_cache::ForwardMsgCache;
use crate::error::RuntimeError;
use crate::event_loop::LoopHandle;
use crate::script::context::Script;
use crate::session::app_session::new_session_id;
use crate::session::{AppSession, SessionServices};
use crate::sync::lock_unpoisoned;

pub use client::{SessionClient, SessionClientDisconnectedError};
pub use session_manager::{ActiveSessionInfo, SessionManager};

const LOOP_THREAD_NAME: &str = "scriptflow-runtime";

static CURRENT: Lazy<Mutex<Weak<Runtime>>> = Lazy::new(|| Mutex::new(Weak::new()));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Initial,
    NoSessionsConnected,
    SessionsConnected,
    Stopping,
    /// Terminal.
    Stopped,
}

pub struct Runtime {
    weak_self: Weak<Runtime>,
    config: RuntimeConfig,
    script: Arc<dyn Script>,
    services: SessionServices,
    loop_handle: LoopHandle,
    message_cache: Mutex<ForwardMsgCache>,
    sessions: Mutex<SessionManager>,
    state: Mutex<RuntimeState>,
    state_changed: Condvar,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Creates the process runtime with in-memory storage for disconnected sessions.
    ///
    /// Fails with [`RuntimeError::AlreadyExists`] while another runtime that has not
    /// stopped is alive.
    pub fn new(
        config: RuntimeConfig,
        script: Arc<dyn Script>,
        services: SessionServices,
    ) -> Result<Arc<Self>, RuntimeError> {
        let storage = MemorySessionStorage::new(
            config.disconnected_session_ttl,
            config.max_stored_sessions,
        );
        Self::with_storage(config, script, services, Box::new(storage))
    }

    pub fn with_storage(
        config: RuntimeConfig,
        script: Arc<dyn Script>,
        services: SessionServices,
        storage: Box<dyn SessionStorage>,
    ) -> Result<Arc<Self>, RuntimeError> {
        let mut current = lock_unpoisoned(&CURRENT);
        if let Some(existing) = current.upgrade() {
            if existing.state() != RuntimeState::Stopped {
                return Err(RuntimeError::AlreadyExists);
            }
        }

        let runtime = Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            message_cache: Mutex::new(ForwardMsgCache::new(config.max_cached_message_age)),
            config,
            script,
            services,
            loop_handle: LoopHandle::new(),
            sessions: Mutex::new(SessionManager::new(storage)),
            state: Mutex::new(RuntimeState::Initial),
            state_changed: Condvar::new(),
            loop_thread: Mutex::new(None),
        });
        *current = Arc::downgrade(&runtime);
        Ok(runtime)
    }

    /// The live runtime, if one exists.
    #[must_use]
    pub fn instance() -> Option<Arc<Self>> {
        lock_unpoisoned(&CURRENT).upgrade()
    }

    #[must_use]
    pub fn state(&self) -> RuntimeState {
        *self.lock_state()
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_handle
    }

    /// Starts the loop thread. Starting a running runtime is a no-op.
    pub fn start(&self) -> Result<(), RuntimeError> {
        let mut state = self.lock_state();
        match *state {
            RuntimeState::Initial => {}
            RuntimeState::Stopping | RuntimeState::Stopped => return Err(RuntimeError::Stopped),
            RuntimeState::NoSessionsConnected | RuntimeState::SessionsConnected => return Ok(()),
        }
        let Some(runtime) = self.weak_self.upgrade() else {
            return Err(RuntimeError::Stopped);
        };

        let join_handle = thread::Builder::new()
            .name(LOOP_THREAD_NAME.to_string())
            .spawn(move || runtime.run_loop())
            .map_err(RuntimeError::LoopSpawn)?;
        *lock_unpoisoned(&self.loop_thread) = Some(join_handle);

        *state = if self.lock_sessions().is_empty() {
            RuntimeState::NoSessionsConnected
        } else {
            RuntimeState::SessionsConnected
        };
        self.state_changed.notify_all();
        info!("runtime started");
        Ok(())
    }

    /// Asks the loop to stop. Returns immediately; see [`Runtime::wait_until_stopped`].
    pub fn stop(&self) {
        {
            let mut state = self.lock_state();
            let current = *state;
            match current {
                RuntimeState::Stopping | RuntimeState::Stopped => return,
                RuntimeState::Initial => {
                    *state = RuntimeState::Stopping;
                    self.state_changed.notify_all();
                    drop(state);
                    self.on_stopped();
                    return;
                }
                RuntimeState::NoSessionsConnected | RuntimeState::SessionsConnected => {}
            }
        }

        let weak_runtime = self.weak_self.clone();
        self.loop_handle.call_soon(move || {
            if let Some(runtime) = weak_runtime.upgrade() {
                runtime.set_state(RuntimeState::Stopping);
                runtime.loop_handle.request_stop();
            }
        });
    }

    /// Blocks until the runtime reaches [`RuntimeState::Stopped`]. Returns `false` on
    /// timeout.
    pub fn wait_until_stopped(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        {
            let mut state = self.lock_state();
            while *state != RuntimeState::Stopped {
                match deadline {
                    None => {
                        state = self
                            .state_changed
                            .wait(state)
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                    }
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return false;
                        }
                        state = self
                            .state_changed
                            .wait_timeout(state, deadline - now)
                            .map(|(state, _)| state)
                            .unwrap_or_else(|poisoned| poisoned.into_inner().0);
                    }
                }
            }
        }

        let finished = lock_unpoisoned(&self.loop_thread).take();
        if let Some(join_handle) = finished {
            if join_handle.thread().id() != thread::current().id() {
                let _ = join_handle.join();
            }
        }
        true
    }

    /// Creates a session for `client`, or resumes `existing_session_id` if it was stored
    /// on disconnect and has not expired. Returns the session id.
    pub fn connect_session(
        &self,
        client: Arc<dyn SessionClient>,
        user_info: UserInfo,
        existing_session_id: Option<&str>,
    ) -> Result<String, RuntimeError> {
        let (session_id, evicted) = {
            let mut state = self.lock_state();
            if matches!(*state, RuntimeState::Stopping | RuntimeState::Stopped) {
                return Err(RuntimeError::Stopped);
            }
            let mut sessions = self.lock_sessions();

            let mut restored = None;
            if let Some(existing_id) = existing_session_id {
                if sessions.is_active(existing_id) {
                    warn!(
                        session_id = existing_id,
                        "session is already connected; starting a new one"
                    );
                } else {
                    match sessions.take_stored(existing_id) {
                        Ok(Some(stored)) => restored = Some((existing_id.to_string(), stored)),
                        Ok(None) => {
                            debug!(session_id = existing_id, "no stored session to resume")
                        }
                        Err(error) => {
                            warn!(session_id = existing_id, %error, "discarding unreadable stored session")
                        }
                    }
                }
            }

            let session_id = restored
                .as_ref()
                .map_or_else(new_session_id, |(id, _)| id.clone());
            let session = AppSession::new(
                session_id.clone(),
                Arc::clone(&self.script),
                self.config.clone(),
                user_info,
                self.loop_handle.clone(),
                self.services.clone(),
            );
            let run_count = match restored {
                Some((_, (stored_state, run_count))) => {
                    session.restore(stored_state);
                    info!(session_id = %session_id, run_count, "session resumed");
                    run_count
                }
                None => {
                    info!(session_id = %session_id, "session connected");
                    0
                }
            };
            sessions.add(ActiveSessionInfo::new(session, client, run_count));

            if *state != RuntimeState::Initial {
                *state = RuntimeState::SessionsConnected;
                self.state_changed.notify_all();
            }
            (session_id, evict_stored(&mut sessions))
        };

        self.release_evicted(evicted);
        self.loop_handle.notify_connection();
        Ok(session_id)
    }

    /// Detaches the client of `session_id` and stores the session for a later reconnect.
    /// Unknown ids are ignored.
    pub fn disconnect_session(&self, session_id: &str) -> Result<(), RuntimeError> {
        let Some(info) = self.remove_active(session_id) else {
            return Ok(());
        };

        info.session.disconnect_file_watchers();
        info.session.shutdown_for_disconnect();

        let (result, evicted) = {
            let mut sessions = self.lock_sessions();
            let result = sessions.store(&info);
            (result, evict_stored(&mut sessions))
        };
        self.release_evicted(evicted);
        info!(session_id, "session disconnected");
        result
    }

    /// Ends `session_id` for good, whether it is connected or stored. Unknown ids are
    /// ignored.
    pub fn close_session(&self, session_id: &str) -> Result<(), RuntimeError> {
        if let Some(info) = self.remove_active(session_id) {
            info.session.shutdown();
        }
        let result = self.lock_sessions().delete_stored(session_id);
        self.release_evicted(vec![session_id.to_string()]);
        debug!(session_id, "session closed");
        result
    }

    /// Hands `msg` to the loop thread for the session's request handlers.
    pub fn handle_backmsg(&self, session_id: &str, msg: BackMsg) -> Result<(), RuntimeError> {
        if matches!(self.state(), RuntimeState::Stopping | RuntimeState::Stopped) {
            return Err(RuntimeError::Stopped);
        }
        let Some(info) = self.lock_sessions().get(session_id) else {
            return Err(RuntimeError::SessionNotFound(session_id.to_string()));
        };
        let session = Arc::downgrade(&info.session);
        self.loop_handle.call_soon(move || {
            if let Some(session) = session.upgrade() {
                session.handle_backmsg(msg);
            }
        });
        Ok(())
    }

    #[must_use]
    pub fn is_active_session(&self, session_id: &str) -> bool {
        self.lock_sessions().is_active(session_id)
    }

    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<Arc<AppSession>> {
        self.lock_sessions()
            .get(session_id)
            .map(|info| Arc::clone(&info.session))
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    /// Ids of disconnected sessions that can still be resumed.
    pub fn stored_session_ids(&self) -> Result<Vec<String>, RuntimeError> {
        self.lock_sessions().stored_ids()
    }

    /// Looks up a cached message body, for clients that miss a referenced hash.
    #[must_use]
    pub fn cached_message(&self, hash: &str) -> Option<ForwardMsg> {
        lock_unpoisoned(&self.message_cache).get_message(hash)
    }

    /// Schedules a poll of every session's watched sources on the loop thread.
    pub fn poll_source_changes(&self) {
        let weak_runtime = self.weak_self.clone();
        self.loop_handle.call_soon(move || {
            if let Some(runtime) = weak_runtime.upgrade() {
                runtime.poll_sessions();
            }
        });
    }

    fn run_loop(self: Arc<Self>) {
        info!("runtime loop started");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.loop_body()));
        if let Err(payload) = outcome {
            let message = payload
                .downcast_ref::<&str>()
                .map(|message| (*message).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(%message, "runtime loop panicked");
        }
        self.on_stopped();
    }

    fn loop_body(&self) {
        let mut next_poll = self
            .config
            .source_poll_interval
            .map(|interval| Instant::now() + interval);

        loop {
            self.loop_handle.run_pending_tasks();
            if self.loop_handle.stop_requested() {
                return;
            }
            self.maybe_poll_sources(&mut next_poll);

            let timeout = next_poll.map(|at| at.saturating_duration_since(Instant::now()));
            if self.lock_sessions().is_empty() {
                self.loop_handle.wait_for_connection(timeout);
                continue;
            }

            self.loop_handle.take_need_send_data();
            self.send_queued_messages();
            self.loop_handle.run_pending_tasks();
            if self.loop_handle.stop_requested() {
                return;
            }
            self.loop_handle.wait_for_data(timeout);
        }
    }

    fn maybe_poll_sources(&self, next_poll: &mut Option<Instant>) {
        let (Some(at), Some(interval)) = (*next_poll, self.config.source_poll_interval) else {
            return;
        };
        let now = Instant::now();
        if now < at {
            return;
        }
        self.poll_sessions();
        *next_poll = Some(now + interval);
    }

    fn poll_sessions(&self) {
        let sessions = self.lock_sessions().snapshot_active();
        for info in sessions {
            if info.session.poll_source_changes() {
                debug!(session_id = info.session.id(), "watched source changed");
            }
        }
    }

    /// One pass over every active session's message queue.
    fn send_queued_messages(&self) {
        let per_yield = self.config.messages_per_yield.max(1);
        let sessions = self.lock_sessions().snapshot_active();

        for info in sessions {
            let session_id = info.session.id();
            if !self.is_active_session(session_id) {
                continue;
            }
            let messages = info.session.flush_browser_queue();
            for (sent, msg) in messages.into_iter().enumerate() {
                let outbound = {
                    let mut cache = lock_unpoisoned(&self.message_cache);
                    send::prepare_for_send(
                        &mut cache,
                        &info,
                        msg,
                        self.config.min_cached_message_size,
                    )
                };

                if let Err(error) = info.client.write_forward_msg(&outbound) {
                    warn!(session_id, %error, "client write failed; disconnecting session");
                    // The client may have missed cached content; resend it in full on resume.
                    lock_unpoisoned(&self.message_cache).remove_refs_for_session(session_id);
                    if let Err(error) = self.disconnect_session(session_id) {
                        warn!(session_id, %error, "failed to store disconnected session");
                    }
                    break;
                }
                if (sent + 1) % per_yield == 0 {
                    thread::yield_now();
                }
            }
            thread::yield_now();
        }
    }

    fn on_stopped(&self) {
        let (active, stored) = {
            let mut sessions = self.lock_sessions();
            let stored = sessions.stored_ids().unwrap_or_else(|error| {
                warn!(%error, "failed to list stored sessions on stop");
                Vec::new()
            });
            (sessions.drain_active(), stored)
        };

        for info in &active {
            info.session.shutdown();
        }
        {
            let mut sessions = self.lock_sessions();
            for session_id in &stored {
                if let Err(error) = sessions.delete_stored(session_id) {
                    warn!(session_id = %session_id, %error, "failed to delete stored session");
                }
                self.services.uploaded_files.remove_session_files(session_id);
            }
        }

        self.loop_handle.run_pending_tasks();
        lock_unpoisoned(&self.message_cache).clear();
        self.set_state(RuntimeState::Stopped);
        info!(
            closed_sessions = active.len() + stored.len(),
            "runtime stopped"
        );
    }

    fn remove_active(&self, session_id: &str) -> Option<Arc<ActiveSessionInfo>> {
        let mut state = self.lock_state();
        let mut sessions = self.lock_sessions();
        let info = sessions.remove(session_id)?;
        if sessions.is_empty() && *state == RuntimeState::SessionsConnected {
            *state = RuntimeState::NoSessionsConnected;
            self.state_changed.notify_all();
        }
        Some(info)
    }

    /// Drops uploaded files now and cache references on the loop thread.
    fn release_evicted(&self, session_ids: Vec<String>) {
        if session_ids.is_empty() {
            return;
        }
        for session_id in &session_ids {
            self.services.uploaded_files.remove_session_files(session_id);
        }
        let weak_runtime = self.weak_self.clone();
        self.loop_handle.call_soon(move || {
            if let Some(runtime) = weak_runtime.upgrade() {
                let mut cache = lock_unpoisoned(&runtime.message_cache);
                for session_id in &session_ids {
                    cache.remove_refs_for_session(session_id);
                }
            }
        });
    }

    fn set_state(&self, next: RuntimeState) {
        let mut state = self.lock_state();
        if *state != next {
            debug!(from = ?*state, to = ?next, "runtime state changed");
            *state = next;
        }
        self.state_changed.notify_all();
    }

    fn lock_state(&self) -> MutexGuard<'_, RuntimeState> {
        lock_unpoisoned(&self.state)
    }

    fn lock_sessions(&self) -> MutexGuard<'_, SessionManager> {
        lock_unpoisoned(&self.sessions)
    }
}

fn evict_stored(sessions: &mut SessionManager) -> Vec<String> {
    sessions.evict_expired().unwrap_or_else(|error| {
        warn!(%error, "failed to evict expired sessions");
        Vec::new()
    })
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state())
            .field("sessions", &self.session_count())
            .finish()
    }
}
