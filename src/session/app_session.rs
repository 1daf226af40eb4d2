//! One browser connection's view of the running script.
//!
//! Thread roles:
//! - The runtime loop thread calls the request handlers, flushes the message queue and
//!   runs every task this session schedules through its [`LoopHandle`].
//! - The active runner's thread delivers lifecycle events and deltas through
//!   [`ScriptRunnerListener`]. Lifecycle events are applied on that thread; the runner's
//!   final `Shutdown` report is forwarded to the loop thread so that runner replacement
//!   never races a request handler.
//!
//! All mutable bookkeeping lives in one `Mutex<SessionInner>`.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::core::back_msg::BackMsg;
use crate::core::client_state::ClientState;
use crate::core::delta::{Delta, ExceptionInfo};
use crate::core::forward_msg::{
    ClientConfig, EnvironmentInfo, ForwardMsg, ForwardMsgPayload, NewSession,
    ScriptFinishedStatus, SessionEvent, SessionStatus, UserInfo,
};
use crate::core::message_queue::MessageQueue;
use crate::event_loop::LoopHandle;
use crate::script::context::Script;
use crate::script::request_queue::{RerunData, ScriptRequest, ScriptRequestQueue};
use crate::script::runner::{
    RunnerId, ScriptRunnerEvent, ScriptRunnerHandle, ScriptRunnerListener, ScriptRunnerParams,
};
use crate::script::widget_state::WidgetStateStore;
use crate::services::SubscriptionId;
use crate::session::watcher::SourcesWatcher;
use crate::session::{SessionServices, StoredSessionState};
use crate::sync::lock_unpoisoned;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppSessionState {
    NotRunning,
    IsRunning,
    /// Terminal.
    ShutdownRequested,
}

struct SessionInner {
    state: AppSessionState,
    client_state: ClientState,
    active_runner: Option<ScriptRunnerHandle>,
    next_runner_id: RunnerId,
    run_on_save: bool,
    sources_watcher: Option<Box<dyn SourcesWatcher>>,
    secrets_subscription: Option<SubscriptionId>,
}

pub struct AppSession {
    id: String,
    weak_self: Weak<AppSession>,
    script: Arc<dyn Script>,
    config: RuntimeConfig,
    user_info: UserInfo,
    message_queue: MessageQueue,
    request_queue: Arc<ScriptRequestQueue>,
    widget_states: Arc<WidgetStateStore>,
    loop_handle: LoopHandle,
    services: SessionServices,
    inner: Mutex<SessionInner>,
}

/// Fresh process-unique session id.
#[must_use]
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

impl AppSession {
    /// Creates a session and attaches its file and secrets watchers.
    pub fn new(
        id: String,
        script: Arc<dyn Script>,
        config: RuntimeConfig,
        user_info: UserInfo,
        loop_handle: LoopHandle,
        services: SessionServices,
    ) -> Arc<Self> {
        let run_on_save = config.run_on_save;
        let session = Arc::new_cyclic(|weak_self| Self {
            id,
            weak_self: weak_self.clone(),
            script,
            config,
            user_info,
            message_queue: MessageQueue::new(),
            request_queue: Arc::new(ScriptRequestQueue::new()),
            widget_states: Arc::new(WidgetStateStore::new()),
            loop_handle,
            services,
            inner: Mutex::new(SessionInner {
                state: AppSessionState::NotRunning,
                client_state: ClientState::default(),
                active_runner: None,
                next_runner_id: 1,
                run_on_save,
                sources_watcher: None,
                secrets_subscription: None,
            }),
        });
        session.register_file_watchers();
        debug!(session_id = %session.id, "session created");
        session
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> AppSessionState {
        self.lock_inner().state
    }

    #[must_use]
    pub fn client_state(&self) -> ClientState {
        self.lock_inner().client_state.clone()
    }

    #[must_use]
    pub fn run_on_save(&self) -> bool {
        self.lock_inner().run_on_save
    }

    #[must_use]
    pub fn has_script_runner(&self) -> bool {
        self.lock_inner().active_runner.is_some()
    }

    #[must_use]
    pub fn active_runner_id(&self) -> Option<RunnerId> {
        self.lock_inner()
            .active_runner
            .as_ref()
            .map(|runner| runner.runner_id)
    }

    #[must_use]
    pub fn request_queue(&self) -> &ScriptRequestQueue {
        &self.request_queue
    }

    #[must_use]
    pub fn widget_states(&self) -> &WidgetStateStore {
        &self.widget_states
    }

    #[must_use]
    pub fn has_watchers(&self) -> bool {
        let inner = self.lock_inner();
        inner.sources_watcher.is_some() || inner.secrets_subscription.is_some()
    }

    /// Queues `msg` for the browser and wakes the loop.
    pub fn enqueue(&self, msg: ForwardMsg) {
        if !self.config.display_enabled {
            return;
        }
        self.message_queue.enqueue(msg);
        self.loop_handle.notify_data();
    }

    /// Reports an error raised outside the script lifecycle.
    ///
    /// Replays a finished/started/finished sequence so the browser resets any half-shown
    /// run, then shows the exception as the first element.
    pub fn enqueue_exception(&self, exception: ExceptionInfo) {
        if self.state() == AppSessionState::ShutdownRequested {
            debug!(session_id = %self.id, %exception, "dropping exception after shutdown");
            return;
        }
        self.apply_lifecycle_event(ScriptRunnerEvent::ScriptStoppedWithSuccess);
        self.apply_lifecycle_event(ScriptRunnerEvent::ScriptStarted);
        self.apply_lifecycle_event(ScriptRunnerEvent::ScriptStoppedWithSuccess);
        self.enqueue(ForwardMsg::delta(Delta::exception(exception), vec![0, 0]));
    }

    /// Takes everything queued for the browser.
    pub fn flush_browser_queue(&self) -> Vec<ForwardMsg> {
        self.message_queue.flush()
    }

    /// Requests a rerun against `client_state`, or against the last known state when
    /// `None`. Starts a runner if none is alive.
    ///
    /// The last known state keeps no fired triggers, so a bare rerun never repeats a press.
    pub fn request_rerun(&self, client_state: Option<ClientState>) {
        let spawn_result = {
            let mut inner = self.lock_inner();
            if inner.state == AppSessionState::ShutdownRequested {
                warn!(session_id = %self.id, "discarding rerun request after shutdown");
                return;
            }

            let data = match client_state {
                Some(client_state) => {
                    inner.client_state = client_state.without_fired_triggers();
                    RerunData::from_client_state(client_state)
                }
                None => RerunData::from_client_state(inner.client_state.clone()),
            };
            if !self.request_queue.enqueue(ScriptRequest::Rerun(data)) {
                warn!(session_id = %self.id, "rerun refused by a shut down request queue");
                return;
            }
            self.maybe_spawn_runner(&mut inner)
        };

        self.report_spawn_failure(spawn_result);
    }

    pub fn handle_stop_script_request(&self) {
        let inner = self.lock_inner();
        if inner.state == AppSessionState::ShutdownRequested {
            warn!(session_id = %self.id, "discarding stop request after shutdown");
            return;
        }
        if inner.active_runner.is_some() {
            self.request_queue.enqueue(ScriptRequest::Stop);
        }
    }

    /// Clears process-wide computed caches and this session's widget values.
    pub fn handle_clear_cache_request(&self) {
        self.services.caches.clear_all();
        self.widget_states.clear();
    }

    pub fn handle_set_run_on_save_request(&self, enabled: bool) {
        let status = {
            let mut inner = self.lock_inner();
            if inner.state == AppSessionState::ShutdownRequested {
                warn!(session_id = %self.id, "discarding run-on-save change after shutdown");
                return;
            }
            inner.run_on_save = enabled;
            session_status(&inner)
        };
        self.enqueue(ForwardMsg::session_status_changed(status));
    }

    /// Dispatches a client request. A failing handler is reported to the browser.
    pub fn handle_backmsg(&self, msg: BackMsg) {
        let result = match msg {
            BackMsg::RerunScript { client_state } => {
                self.request_rerun(client_state);
                Ok(())
            }
            BackMsg::StopScript => {
                self.handle_stop_script_request();
                Ok(())
            }
            BackMsg::ClearCache => {
                self.handle_clear_cache_request();
                Ok(())
            }
            BackMsg::SetRunOnSave { enabled } => {
                self.handle_set_run_on_save_request(enabled);
                Ok(())
            }
            BackMsg::UploadFile { widget_id, file } => self
                .services
                .uploaded_files
                .add_file(&self.id, &widget_id, file)
                .map_err(|error| ExceptionInfo::new("UploadError", error.to_string())),
        };

        if let Err(exception) = result {
            warn!(session_id = %self.id, error = %exception, "client request failed");
            self.enqueue_exception(exception);
        }
    }

    /// A watched source file changed on disk.
    pub fn on_source_file_changed(&self) {
        let rerun = {
            let inner = self.lock_inner();
            if inner.state == AppSessionState::ShutdownRequested {
                return;
            }
            inner.run_on_save && self.config.allow_run_on_save
        };

        if rerun {
            self.request_rerun(None);
        } else {
            self.enqueue(ForwardMsg::session_event(SessionEvent::ScriptChangedOnDisk));
        }
    }

    /// Polls the sources watcher. Returns whether a change was handled.
    pub fn poll_source_changes(&self) -> bool {
        let changed = {
            let mut inner = self.lock_inner();
            match inner.sources_watcher.as_mut() {
                Some(watcher) => watcher.poll_changes(),
                None => false,
            }
        };
        if changed {
            self.on_source_file_changed();
        }
        changed
    }

    /// Attaches the sources watcher and secrets listener if they are not attached.
    pub fn register_file_watchers(&self) {
        let mut inner = self.lock_inner();
        if inner.state == AppSessionState::ShutdownRequested {
            return;
        }
        if inner.sources_watcher.is_none() {
            let paths = self.script.watched_paths();
            inner.sources_watcher = Some(self.services.watcher_factory.create(&paths));
        }
        if inner.secrets_subscription.is_none() {
            let weak_session = self.weak_self.clone();
            let loop_handle = self.loop_handle.clone();
            let id = self.services.secrets.subscribe(move || {
                let weak_session = weak_session.clone();
                loop_handle.call_soon(move || {
                    if let Some(session) = weak_session.upgrade() {
                        session.on_source_file_changed();
                    }
                });
            });
            inner.secrets_subscription = Some(id);
        }
    }

    pub fn disconnect_file_watchers(&self) {
        let (watcher, subscription) = {
            let mut inner = self.lock_inner();
            (
                inner.sources_watcher.take(),
                inner.secrets_subscription.take(),
            )
        };
        if let Some(mut watcher) = watcher {
            watcher.close();
        }
        if let Some(subscription) = subscription {
            self.services.secrets.unsubscribe(subscription);
        }
    }

    /// State to persist when the client disconnects.
    #[must_use]
    pub fn snapshot(&self) -> StoredSessionState {
        let inner = self.lock_inner();
        StoredSessionState {
            client_state: ClientState::new(
                inner.client_state.query_string.clone(),
                self.widget_states.as_widget_states(),
            ),
            run_on_save: inner.run_on_save,
        }
    }

    /// Re-applies state saved by [`AppSession::snapshot`].
    pub fn restore(&self, stored: StoredSessionState) {
        self.widget_states.apply(&stored.client_state.widget_states);
        let mut inner = self.lock_inner();
        inner.client_state = stored.client_state;
        inner.run_on_save = stored.run_on_save;
    }

    /// Stops the session for good. Only the first call has any effect.
    pub fn shutdown(&self) {
        self.shutdown_with(true);
    }

    /// Like [`AppSession::shutdown`] but keeps uploaded files, for sessions that may be
    /// restored on reconnect.
    pub fn shutdown_for_disconnect(&self) {
        self.shutdown_with(false);
    }

    fn shutdown_with(&self, remove_files: bool) {
        let (watcher, subscription) = {
            let mut inner = self.lock_inner();
            if inner.state == AppSessionState::ShutdownRequested {
                return;
            }
            info!(session_id = %self.id, "session shutting down");
            inner.state = AppSessionState::ShutdownRequested;
            if inner.active_runner.is_some() {
                self.request_queue.enqueue(ScriptRequest::Shutdown);
            }
            (
                inner.sources_watcher.take(),
                inner.secrets_subscription.take(),
            )
        };

        if remove_files {
            self.services.uploaded_files.remove_session_files(&self.id);
        }
        if let Some(mut watcher) = watcher {
            watcher.close();
        }
        if let Some(subscription) = subscription {
            self.services.secrets.unsubscribe(subscription);
        }
    }

    fn apply_lifecycle_event(&self, event: ScriptRunnerEvent) {
        let mut messages = Vec::with_capacity(3);
        let mut clear_queue = false;
        let mut script_succeeded = false;

        {
            let mut inner = self.lock_inner();
            if inner.state == AppSessionState::ShutdownRequested {
                debug!(session_id = %self.id, ?event, "ignoring runner event after shutdown");
                return;
            }
            let was_running = inner.state == AppSessionState::IsRunning;

            match event {
                ScriptRunnerEvent::ScriptStarted => {
                    inner.state = AppSessionState::IsRunning;
                    clear_queue = true;
                    messages.push(self.new_session_msg(&inner));
                }
                ScriptRunnerEvent::ScriptStoppedWithSuccess => {
                    inner.state = AppSessionState::NotRunning;
                    script_succeeded = true;
                    messages.push(ForwardMsg::script_finished(
                        ScriptFinishedStatus::FinishedSuccessfully,
                    ));
                }
                ScriptRunnerEvent::ScriptStoppedWithCompileError(exception) => {
                    inner.state = AppSessionState::NotRunning;
                    messages.push(ForwardMsg::script_finished(
                        ScriptFinishedStatus::FinishedWithCompileError,
                    ));
                    messages.push(ForwardMsg::session_event(
                        SessionEvent::ScriptCompilationException(exception),
                    ));
                }
                ScriptRunnerEvent::Shutdown { .. } => return,
            }

            let is_running = inner.state == AppSessionState::IsRunning;
            if was_running != is_running {
                messages.push(ForwardMsg::session_status_changed(session_status(&inner)));
            }
        }

        if clear_queue {
            self.message_queue.clear();
        }
        for msg in messages {
            self.enqueue(msg);
        }
        if script_succeeded {
            let weak_session = self.weak_self.clone();
            self.loop_handle.call_soon(move || {
                if let Some(session) = weak_session.upgrade() {
                    session.update_watched_modules();
                }
            });
        }
    }

    fn update_watched_modules(&self) {
        let paths = self.script.watched_paths();
        let mut inner = self.lock_inner();
        if let Some(watcher) = inner.sources_watcher.as_mut() {
            watcher.update_watched_modules(&paths);
        }
    }

    /// Runs on the loop thread once runner `runner_id` has exited.
    fn on_runner_shutdown(&self, runner_id: RunnerId, client_state: ClientState) {
        let spawn_result = {
            let mut inner = self.lock_inner();
            let is_current = inner
                .active_runner
                .as_ref()
                .is_some_and(|runner| runner.runner_id == runner_id);
            if !is_current {
                debug!(session_id = %self.id, runner_id, "ignoring shutdown of stale runner");
                return;
            }

            inner.client_state = client_state;
            if let Some(mut finished) = inner.active_runner.take() {
                if let Some(join_handle) = finished.join_handle.take() {
                    let is_current_thread = join_handle.thread().id() == thread::current().id();
                    if !is_current_thread && join_handle.is_finished() {
                        let _ = join_handle.join();
                    }
                }
            }

            if inner.state == AppSessionState::ShutdownRequested {
                return;
            }
            self.maybe_spawn_runner(&mut inner)
        };

        self.report_spawn_failure(spawn_result);
    }

    /// Starts a runner generation if requests are pending and none is alive.
    fn maybe_spawn_runner(&self, inner: &mut SessionInner) -> io::Result<()> {
        if inner.state == AppSessionState::ShutdownRequested
            || inner.active_runner.is_some()
            || !self.request_queue.has_request()
        {
            return Ok(());
        }
        let Some(listener) = self.weak_self.upgrade() else {
            return Ok(());
        };

        let runner_id = inner.next_runner_id;
        inner.next_runner_id += 1;
        let params = ScriptRunnerParams {
            runner_id,
            session_id: self.id.clone(),
            script: Arc::clone(&self.script),
            client_state: inner.client_state.clone(),
            request_queue: Arc::clone(&self.request_queue),
            widget_states: Arc::clone(&self.widget_states),
            uploaded_files: Arc::clone(&self.services.uploaded_files),
            listener: listener as Arc<dyn ScriptRunnerListener>,
        };

        let handle = self.services.runner_factory.spawn(params)?;
        debug!(session_id = %self.id, runner_id, "script runner spawned");
        inner.active_runner = Some(handle);
        Ok(())
    }

    fn report_spawn_failure(&self, result: io::Result<()>) {
        if let Err(spawn_error) = result {
            error!(session_id = %self.id, error = %spawn_error, "failed to start script runner");
            self.enqueue_exception(ExceptionInfo::new(
                "RunnerSpawnError",
                spawn_error.to_string(),
            ));
        }
    }

    fn is_current_runner(&self, runner_id: RunnerId) -> bool {
        self.lock_inner()
            .active_runner
            .as_ref()
            .is_some_and(|runner| runner.runner_id == runner_id)
    }

    fn new_session_msg(&self, inner: &SessionInner) -> ForwardMsg {
        ForwardMsg::new(ForwardMsgPayload::NewSession(NewSession {
            script_run_id: Uuid::new_v4().to_string(),
            session_id: self.id.clone(),
            script_name: self.script.name().to_string(),
            environment: EnvironmentInfo::default(),
            user_info: self.user_info.clone(),
            config: ClientConfig {
                max_cached_message_age: self.config.max_cached_message_age,
                allow_run_on_save: self.config.allow_run_on_save,
            },
            status: SessionStatus {
                run_on_save: inner.run_on_save,
                script_is_running: true,
            },
        }))
    }

    fn lock_inner(&self) -> MutexGuard<'_, SessionInner> {
        lock_unpoisoned(&self.inner)
    }
}

impl ScriptRunnerListener for AppSession {
    fn on_script_runner_event(&self, runner_id: RunnerId, event: ScriptRunnerEvent) {
        if let ScriptRunnerEvent::Shutdown { client_state } = event {
            let weak_session = self.weak_self.clone();
            self.loop_handle.call_soon(move || {
                if let Some(session) = weak_session.upgrade() {
                    session.on_runner_shutdown(runner_id, client_state);
                }
            });
            return;
        }

        if !self.is_current_runner(runner_id) {
            debug!(session_id = %self.id, runner_id, ?event, "ignoring event from stale runner");
            return;
        }
        self.apply_lifecycle_event(event);
    }

    fn enqueue_forward_msg(&self, runner_id: RunnerId, msg: ForwardMsg) {
        if !self.is_current_runner(runner_id) {
            debug!(session_id = %self.id, runner_id, "dropping message from stale runner");
            return;
        }
        self.enqueue(msg);
    }
}

fn session_status(inner: &SessionInner) -> SessionStatus {
    SessionStatus {
        run_on_save: inner.run_on_save,
        script_is_running: inner.state == AppSessionState::IsRunning,
    }
}

impl std::fmt::Debug for AppSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
