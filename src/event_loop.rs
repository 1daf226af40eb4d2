//! Wake primitive and task queue of the runtime's loop thread.
//!
//! Other threads never touch loop-owned state directly: they either flip a wake flag or
//! hand the loop a closure through [`LoopHandle::call_soon`].

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::sync::lock_unpoisoned;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct LoopWakeState {
    tasks: VecDeque<Task>,
    need_send_data: bool,
    connection_signaled: bool,
    stop_requested: bool,
}

#[derive(Default)]
struct LoopWake {
    state: Mutex<LoopWakeState>,
    cvar: Condvar,
}

/// Cloneable handle to the loop's wake state.
#[derive(Clone, Default)]
pub struct LoopHandle {
    wake: Arc<LoopWake>,
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("LoopHandle")
            .field("pending_tasks", &state.tasks.len())
            .field("need_send_data", &state.need_send_data)
            .field("stop_requested", &state.stop_requested)
            .finish()
    }
}

impl LoopHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `task` to run on the loop thread.
    pub fn call_soon(&self, task: impl FnOnce() + Send + 'static) {
        let mut state = self.lock_state();
        state.tasks.push_back(Box::new(task));
        self.wake.cvar.notify_all();
    }

    /// A session has queued messages.
    pub fn notify_data(&self) {
        let mut state = self.lock_state();
        state.need_send_data = true;
        self.wake.cvar.notify_all();
    }

    /// A session has connected.
    pub fn notify_connection(&self) {
        let mut state = self.lock_state();
        state.connection_signaled = true;
        self.wake.cvar.notify_all();
    }

    /// Sets the loop's stop flag. Call from the loop thread; other threads go through
    /// `call_soon`.
    pub fn request_stop(&self) {
        let mut state = self.lock_state();
        state.stop_requested = true;
        self.wake.cvar.notify_all();
    }

    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.lock_state().stop_requested
    }

    #[must_use]
    pub fn has_pending_tasks(&self) -> bool {
        !self.lock_state().tasks.is_empty()
    }

    /// Runs scheduled tasks until none remain, including tasks scheduled by the tasks
    /// themselves. Returns how many ran.
    pub fn run_pending_tasks(&self) -> usize {
        let mut ran = 0usize;
        loop {
            let batch: Vec<Task> = {
                let mut state = self.lock_state();
                state.tasks.drain(..).collect()
            };
            if batch.is_empty() {
                return ran;
            }
            for task in batch {
                task();
                ran += 1;
            }
        }
    }

    /// Clears and returns the data-pending flag.
    pub fn take_need_send_data(&self) -> bool {
        std::mem::take(&mut self.lock_state().need_send_data)
    }

    /// Blocks until a connection is signaled, a task is scheduled, stop is requested or
    /// `timeout` elapses.
    pub fn wait_for_connection(&self, timeout: Option<Duration>) {
        let mut state = self.wait_while(timeout, |state| !state.connection_signaled);
        state.connection_signaled = false;
    }

    /// Blocks until data is pending, a task is scheduled, stop is requested or `timeout`
    /// elapses.
    pub fn wait_for_data(&self, timeout: Option<Duration>) {
        let _state = self.wait_while(timeout, |state| !state.need_send_data);
    }

    fn wait_while(
        &self,
        timeout: Option<Duration>,
        idle: impl Fn(&LoopWakeState) -> bool,
    ) -> MutexGuard<'_, LoopWakeState> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.lock_state();

        while !state.stop_requested && state.tasks.is_empty() && idle(&state) {
            match deadline {
                None => {
                    state = self
                        .wake
                        .cvar
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    state = self
                        .wake
                        .cvar
                        .wait_timeout(state, deadline - now)
                        .map(|(state, _)| state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0);
                }
            }
        }

        state
    }

    fn lock_state(&self) -> MutexGuard<'_, LoopWakeState> {
        lock_unpoisoned(&self.wake.state)
    }
}
