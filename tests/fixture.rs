#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use scriptflow::core::forward_msg::{ForwardMsg, ForwardMsgPayload};
use scriptflow::runtime::{SessionClient, SessionClientDisconnectedError};
use scriptflow::script::runner::{
    RunnerId, ScriptRunnerEvent, ScriptRunnerFactory, ScriptRunnerHandle, ScriptRunnerParams,
};
use scriptflow::session::NoopWatcherFactory;
use scriptflow::{RuntimeConfig, SessionServices};

pub const WAIT: Duration = Duration::from_secs(5);

/// Runner factory that starts no threads. Tests drive the recorded runners by hand.
#[derive(Default)]
pub struct ManualRunnerFactory {
    spawned: Mutex<Vec<Arc<ScriptRunnerParams>>>,
}

impl ManualRunnerFactory {
    pub fn spawned_count(&self) -> usize {
        lock(&self.spawned).len()
    }

    pub fn runner(&self, index: usize) -> Arc<ScriptRunnerParams> {
        Arc::clone(&lock(&self.spawned)[index])
    }

    pub fn last(&self) -> Arc<ScriptRunnerParams> {
        let spawned = lock(&self.spawned);
        Arc::clone(spawned.last().expect("a runner should have been spawned"))
    }
}

impl ScriptRunnerFactory for ManualRunnerFactory {
    fn spawn(&self, params: ScriptRunnerParams) -> io::Result<ScriptRunnerHandle> {
        let runner_id = params.runner_id;
        lock(&self.spawned).push(Arc::new(params));
        Ok(ScriptRunnerHandle::detached(runner_id))
    }
}

/// Emits `event` as runner `params` would.
pub fn emit(params: &ScriptRunnerParams, event: ScriptRunnerEvent) {
    params.listener.on_script_runner_event(params.runner_id, event);
}

pub fn emit_from(params: &ScriptRunnerParams, runner_id: RunnerId, event: ScriptRunnerEvent) {
    params.listener.on_script_runner_event(runner_id, event);
}

/// Client that records every message and can be told to fail writes.
#[derive(Default)]
pub struct RecordingClient {
    messages: Mutex<Vec<ForwardMsg>>,
    failing: AtomicBool,
    failing_deltas: AtomicBool,
}

impl RecordingClient {
    pub fn messages(&self) -> Vec<ForwardMsg> {
        lock(&self.messages).clone()
    }

    pub fn fail_writes(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    /// Accepts control messages but fails on the first delta.
    pub fn fail_delta_writes(&self) {
        self.failing_deltas.store(true, Ordering::SeqCst);
    }
}

impl SessionClient for RecordingClient {
    fn write_forward_msg(&self, msg: &ForwardMsg) -> Result<(), SessionClientDisconnectedError> {
        if self.failing.load(Ordering::SeqCst)
            || (msg.is_delta() && self.failing_deltas.load(Ordering::SeqCst))
        {
            return Err(SessionClientDisconnectedError::new("socket closed"));
        }
        lock(&self.messages).push(msg.clone());
        Ok(())
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Short name of a message's payload, for order assertions.
pub fn kind(msg: &ForwardMsg) -> &'static str {
    match &msg.payload {
        ForwardMsgPayload::NewSession(_) => "new_session",
        ForwardMsgPayload::SessionStatusChanged(_) => "session_status_changed",
        ForwardMsgPayload::ScriptFinished { .. } => "script_finished",
        ForwardMsgPayload::SessionEvent { .. } => "session_event",
        ForwardMsgPayload::Delta { .. } => "delta",
        ForwardMsgPayload::RefHash { .. } => "ref_hash",
    }
}

pub fn kinds(messages: &[ForwardMsg]) -> Vec<&'static str> {
    messages.iter().map(kind).collect()
}

pub fn test_config() -> RuntimeConfig {
    RuntimeConfig::default().with_source_poll_interval(None)
}

pub fn manual_services(factory: &Arc<ManualRunnerFactory>) -> SessionServices {
    SessionServices::default()
        .with_runner_factory(Arc::clone(factory) as Arc<dyn ScriptRunnerFactory>)
        .with_watcher_factory(Arc::new(NoopWatcherFactory))
}

pub fn threaded_services() -> SessionServices {
    SessionServices::default().with_watcher_factory(Arc::new(NoopWatcherFactory))
}

/// Serializes tests that create the process runtime.
pub fn runtime_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    lock(LOCK.get_or_init(|| Mutex::new(())))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
