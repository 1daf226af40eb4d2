//! Worker that executes a session's script on its own thread.
//!
//! One runner generation drains the request queue until it is empty or a shutdown is
//! observed, then reports [`ScriptRunnerEvent::Shutdown`] and exits. Every event goes to
//! the session through [`ScriptRunnerListener`] tagged with the runner id so that late
//! events from an earlier generation can be told apart.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::core::client_state::ClientState;
use crate::core::delta::{Delta, ExceptionInfo};
use crate::core::forward_msg::ForwardMsg;
use crate::script::context::{Interrupt, Script, ScriptContext, ScriptError};
use crate::script::request_queue::{RerunData, ScriptRequest, ScriptRequestQueue};
use crate::script::widget_state::WidgetStateStore;
use crate::services::UploadedFileManager;

pub type RunnerId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptRunnerEvent {
    ScriptStarted,
    ScriptStoppedWithSuccess,
    ScriptStoppedWithCompileError(ExceptionInfo),
    /// The runner has exited. Carries the client state of its last run.
    Shutdown { client_state: ClientState },
}

/// Receives everything a runner produces. Called on the runner's thread.
pub trait ScriptRunnerListener: Send + Sync {
    fn on_script_runner_event(&self, runner_id: RunnerId, event: ScriptRunnerEvent);

    fn enqueue_forward_msg(&self, runner_id: RunnerId, msg: ForwardMsg);
}

pub struct ScriptRunnerParams {
    pub runner_id: RunnerId,
    pub session_id: String,
    pub script: Arc<dyn Script>,
    pub client_state: ClientState,
    pub request_queue: Arc<ScriptRequestQueue>,
    pub widget_states: Arc<WidgetStateStore>,
    pub uploaded_files: Arc<UploadedFileManager>,
    pub listener: Arc<dyn ScriptRunnerListener>,
}

#[derive(Debug)]
pub struct ScriptRunnerHandle {
    pub runner_id: RunnerId,
    pub join_handle: Option<JoinHandle<()>>,
}

impl ScriptRunnerHandle {
    /// Handle for a runner driven outside of a dedicated thread.
    #[must_use]
    pub fn detached(runner_id: RunnerId) -> Self {
        Self {
            runner_id,
            join_handle: None,
        }
    }
}

/// Creates runner generations for a session.
pub trait ScriptRunnerFactory: Send + Sync {
    fn spawn(&self, params: ScriptRunnerParams) -> io::Result<ScriptRunnerHandle>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadScriptRunnerFactory;

impl ScriptRunnerFactory for ThreadScriptRunnerFactory {
    fn spawn(&self, params: ScriptRunnerParams) -> io::Result<ScriptRunnerHandle> {
        ScriptRunner::new(params).start()
    }
}

pub struct ScriptRunner {
    params: ScriptRunnerParams,
}

impl ScriptRunner {
    #[must_use]
    pub fn new(params: ScriptRunnerParams) -> Self {
        Self { params }
    }

    #[must_use]
    pub fn runner_id(&self) -> RunnerId {
        self.params.runner_id
    }

    pub fn start(self) -> io::Result<ScriptRunnerHandle> {
        let runner_id = self.params.runner_id;
        let join_handle = thread::Builder::new()
            .name(format!("script-runner-{runner_id}"))
            .spawn(move || self.run())?;

        Ok(ScriptRunnerHandle {
            runner_id,
            join_handle: Some(join_handle),
        })
    }

    /// Processes requests until the queue is drained or a shutdown is observed.
    ///
    /// Runs on the calling thread; [`ScriptRunner::start`] calls it on a new one.
    pub fn run(mut self) {
        let runner_id = self.params.runner_id;
        let session_id = self.params.session_id.clone();
        debug!(runner_id, session_id = %session_id, "script runner started");

        let mut shutdown = false;
        while !shutdown {
            let Some(request) = self.params.request_queue.dequeue() else {
                break;
            };
            match request {
                ScriptRequest::Rerun(data) => shutdown = self.run_script(data),
                ScriptRequest::Stop => {
                    debug!(runner_id, "stop requested while no script is running");
                }
                ScriptRequest::Shutdown => shutdown = true,
            }
        }

        let client_state = ClientState::new(
            self.params.client_state.query_string.clone(),
            self.params.widget_states.as_widget_states(),
        );
        debug!(runner_id, session_id = %session_id, shutdown, "script runner exiting");
        self.emit(ScriptRunnerEvent::Shutdown { client_state });
    }

    /// Executes the script, restarting in place on rerun interrupts. Returns `true` once a
    /// shutdown has been observed.
    fn run_script(&mut self, data: RerunData) -> bool {
        let mut data = data;
        loop {
            self.params.client_state.query_string = data.query_string.clone();
            if let Some(states) = &data.widget_states {
                self.params.client_state.widget_states = states.clone();
            }

            self.emit(ScriptRunnerEvent::ScriptStarted);

            if let Err(exception) = self.params.script.compile() {
                debug!(runner_id = self.params.runner_id, error = %exception, "script failed to compile");
                self.emit(ScriptRunnerEvent::ScriptStoppedWithCompileError(exception));
                return false;
            }

            self.params
                .widget_states
                .on_script_will_rerun(data.widget_states.as_ref());

            let mut ctx = ScriptContext::new(
                self.params.runner_id,
                self.params.session_id.clone(),
                data.query_string.clone(),
                Arc::clone(&self.params.request_queue),
                Arc::clone(&self.params.widget_states),
                Arc::clone(&self.params.uploaded_files),
                Arc::clone(&self.params.listener),
            );
            let script = Arc::clone(&self.params.script);
            let outcome = catch_unwind(AssertUnwindSafe(|| script.run(&mut ctx)));

            let next = match outcome {
                Ok(Ok(())) => RunOutcome::Completed,
                Ok(Err(ScriptError::Exception(exception))) => {
                    ctx.push_delta(Delta::exception(exception));
                    RunOutcome::Completed
                }
                Ok(Err(ScriptError::Interrupted(Interrupt::Stop))) => RunOutcome::Stopped,
                Ok(Err(ScriptError::Interrupted(Interrupt::Rerun(next)))) => {
                    RunOutcome::Rerun(next)
                }
                Ok(Err(ScriptError::Interrupted(Interrupt::Shutdown))) => RunOutcome::Shutdown,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!(runner_id = self.params.runner_id, message = %message, "script panicked");
                    ctx.push_delta(Delta::exception(ExceptionInfo::new("Panic", message)));
                    RunOutcome::Completed
                }
            };

            if matches!(next, RunOutcome::Completed) {
                self.params
                    .widget_states
                    .on_script_finished(ctx.seen_widget_ids());
            }
            self.emit(ScriptRunnerEvent::ScriptStoppedWithSuccess);

            match next {
                RunOutcome::Rerun(next) => data = next,
                RunOutcome::Shutdown => return true,
                RunOutcome::Completed | RunOutcome::Stopped => return false,
            }
        }
    }

    fn emit(&self, event: ScriptRunnerEvent) {
        self.params
            .listener
            .on_script_runner_event(self.params.runner_id, event);
    }
}

enum RunOutcome {
    Completed,
    Stopped,
    Rerun(RerunData),
    Shutdown,
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "script panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::client_state::{WidgetStates, WidgetValue};
    use crate::core::forward_msg::ForwardMsgPayload;
    use crate::script::context::script_fn;
    use crate::sync::lock_unpoisoned;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ScriptRunnerEvent>>,
        deltas: Mutex<Vec<Delta>>,
    }

    impl ScriptRunnerListener for Recorder {
        fn on_script_runner_event(&self, _runner_id: RunnerId, event: ScriptRunnerEvent) {
            lock_unpoisoned(&self.events).push(event);
        }

        fn enqueue_forward_msg(&self, _runner_id: RunnerId, msg: ForwardMsg) {
            if let ForwardMsgPayload::Delta { delta } = msg.payload {
                lock_unpoisoned(&self.deltas).push(delta);
            }
        }
    }

    fn runner(
        script: Arc<dyn Script>,
        recorder: &Arc<Recorder>,
    ) -> (ScriptRunner, Arc<ScriptRequestQueue>) {
        let queue = Arc::new(ScriptRequestQueue::new());
        let params = ScriptRunnerParams {
            runner_id: 1,
            session_id: "session".to_string(),
            script,
            client_state: ClientState::default(),
            request_queue: Arc::clone(&queue),
            widget_states: Arc::new(WidgetStateStore::new()),
            uploaded_files: Arc::new(UploadedFileManager::default()),
            listener: Arc::clone(recorder) as Arc<dyn ScriptRunnerListener>,
        };
        (ScriptRunner::new(params), queue)
    }

    fn events(recorder: &Recorder) -> Vec<ScriptRunnerEvent> {
        lock_unpoisoned(&recorder.events).clone()
    }

    #[test]
    fn successful_run_emits_started_success_shutdown() {
        let recorder = Arc::new(Recorder::default());
        let (runner, queue) = runner(
            script_fn(|ctx| {
                ctx.text("hello")?;
                Ok(())
            }),
            &recorder,
        );
        queue.enqueue(ScriptRequest::Rerun(RerunData::new("a=1", None)));
        runner.run();

        assert_eq!(
            events(&recorder),
            vec![
                ScriptRunnerEvent::ScriptStarted,
                ScriptRunnerEvent::ScriptStoppedWithSuccess,
                ScriptRunnerEvent::Shutdown {
                    client_state: ClientState::new("a=1", WidgetStates::new()),
                },
            ]
        );
        assert_eq!(lock_unpoisoned(&recorder.deltas).clone(), vec![Delta::text("hello")]);
    }

    #[test]
    fn compile_error_skips_execution() {
        struct Broken;
        impl Script for Broken {
            fn compile(&self) -> Result<(), ExceptionInfo> {
                Err(ExceptionInfo::new("SyntaxError", "bad token"))
            }

            fn run(&self, ctx: &mut ScriptContext) -> Result<(), ScriptError> {
                ctx.text("unreachable")?;
                Ok(())
            }
        }

        let recorder = Arc::new(Recorder::default());
        let (runner, queue) = runner(Arc::new(Broken), &recorder);
        queue.enqueue(ScriptRequest::Rerun(RerunData::default()));
        runner.run();

        let recorded = events(&recorder);
        assert_eq!(recorded[0], ScriptRunnerEvent::ScriptStarted);
        assert_eq!(
            recorded[1],
            ScriptRunnerEvent::ScriptStoppedWithCompileError(ExceptionInfo::new(
                "SyntaxError",
                "bad token"
            ))
        );
        assert!(lock_unpoisoned(&recorder.deltas).is_empty());
    }

    #[test]
    fn script_exception_becomes_exception_delta() {
        let recorder = Arc::new(Recorder::default());
        let (runner, queue) = runner(
            script_fn(|_ctx| Err(ExceptionInfo::new("ValueError", "bad value").into())),
            &recorder,
        );
        queue.enqueue(ScriptRequest::Rerun(RerunData::default()));
        runner.run();

        assert_eq!(
            lock_unpoisoned(&recorder.deltas).clone(),
            vec![Delta::exception(ExceptionInfo::new("ValueError", "bad value"))]
        );
        assert_eq!(events(&recorder)[1], ScriptRunnerEvent::ScriptStoppedWithSuccess);
    }

    #[test]
    fn script_panic_becomes_exception_delta() {
        let recorder = Arc::new(Recorder::default());
        let (runner, queue) = runner(
            script_fn(|_ctx| -> Result<(), ScriptError> { panic!("boom") }),
            &recorder,
        );
        queue.enqueue(ScriptRequest::Rerun(RerunData::default()));
        runner.run();

        assert_eq!(
            lock_unpoisoned(&recorder.deltas).clone(),
            vec![Delta::exception(ExceptionInfo::new("Panic", "boom"))]
        );
        assert!(matches!(
            events(&recorder).last(),
            Some(ScriptRunnerEvent::Shutdown { .. })
        ));
    }

    #[test]
    fn rerun_request_restarts_the_script() {
        let recorder = Arc::new(Recorder::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let script_runs = Arc::clone(&runs);
        let (runner, queue) = runner(
            script_fn(move |ctx| {
                if script_runs.fetch_add(1, Ordering::SeqCst) == 0 {
                    ctx.rerun()?;
                }
                ctx.text("done")?;
                Ok(())
            }),
            &recorder,
        );
        queue.enqueue(ScriptRequest::Rerun(RerunData::new("page=1", None)));
        runner.run();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(
            events(&recorder),
            vec![
                ScriptRunnerEvent::ScriptStarted,
                ScriptRunnerEvent::ScriptStoppedWithSuccess,
                ScriptRunnerEvent::ScriptStarted,
                ScriptRunnerEvent::ScriptStoppedWithSuccess,
                ScriptRunnerEvent::Shutdown {
                    client_state: ClientState::new("page=1", WidgetStates::new()),
                },
            ]
        );
        assert_eq!(lock_unpoisoned(&recorder.deltas).clone(), vec![Delta::text("done")]);
    }

    #[test]
    fn rerun_queued_behind_a_stop_still_runs() {
        let recorder = Arc::new(Recorder::default());
        let completed = Arc::new(Mutex::new(Vec::new()));
        let script_completed = Arc::clone(&completed);
        let (runner, queue) = runner(
            script_fn(move |ctx| {
                ctx.text("working")?;
                let query = ctx.query_string().to_string();
                lock_unpoisoned(&script_completed).push(query);
                Ok(())
            }),
            &recorder,
        );
        queue.enqueue(ScriptRequest::Rerun(RerunData::new("a", None)));
        queue.enqueue(ScriptRequest::Stop);
        queue.enqueue(ScriptRequest::Rerun(RerunData::new("b", None)));
        runner.run();

        assert_eq!(lock_unpoisoned(&completed).clone(), vec!["b".to_string()]);
        assert!(queue.is_empty());
        assert_eq!(
            events(&recorder).last(),
            Some(&ScriptRunnerEvent::Shutdown {
                client_state: ClientState::new("b", WidgetStates::new()),
            })
        );
    }

    #[test]
    fn shutdown_during_run_ends_the_runner() {
        let recorder = Arc::new(Recorder::default());
        let queue_slot: Arc<Mutex<Option<Arc<ScriptRequestQueue>>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&queue_slot);
        let (runner, queue) = runner(
            script_fn(move |ctx| {
                if let Some(queue) = lock_unpoisoned(&slot).as_ref() {
                    queue.enqueue(ScriptRequest::Shutdown);
                }
                ctx.text("never")?;
                Ok(())
            }),
            &recorder,
        );
        *lock_unpoisoned(&queue_slot) = Some(Arc::clone(&queue));
        queue.enqueue(ScriptRequest::Rerun(RerunData::default()));
        queue.enqueue(ScriptRequest::Stop);
        runner.run();

        assert!(lock_unpoisoned(&recorder.deltas).is_empty());
        assert!(matches!(
            events(&recorder).last(),
            Some(ScriptRunnerEvent::Shutdown { .. })
        ));
        // The stop request queued behind the shutdown was never consumed.
        assert_eq!(queue.pending(), vec![ScriptRequest::Stop]);
    }

    #[test]
    fn widget_values_flow_into_the_final_client_state() {
        let recorder = Arc::new(Recorder::default());
        let (runner, queue) = runner(
            script_fn(|ctx| {
                let clicked = ctx.widget("go", "button", WidgetValue::Trigger(false))?;
                ctx.text(format!("clicked={}", clicked.is_fired_trigger()))?;
                Ok(())
            }),
            &recorder,
        );
        queue.enqueue(ScriptRequest::Rerun(RerunData::new(
            "",
            Some(WidgetStates::new().with("go", WidgetValue::Trigger(true))),
        )));
        runner.run();

        let deltas = lock_unpoisoned(&recorder.deltas).clone();
        assert_eq!(deltas.last(), Some(&Delta::text("clicked=true")));
        assert_eq!(
            events(&recorder).last(),
            Some(&ScriptRunnerEvent::Shutdown {
                client_state: ClientState::new(
                    "",
                    WidgetStates::new().with("go", WidgetValue::Trigger(false))
                ),
            })
        );
    }
}
