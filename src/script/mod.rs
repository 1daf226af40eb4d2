//! Script execution: the request mailbox, the per-run context and the runner thread.

pub mod context;
pub mod request_queue;
pub mod runner;
pub mod widget_state;

pub use context::{script_fn, Interrupt, Script, ScriptContext, ScriptError};
pub use request_queue::{RerunData, ScriptRequest, ScriptRequestQueue};
pub use runner::{
    RunnerId, ScriptRunner, ScriptRunnerEvent, ScriptRunnerFactory, ScriptRunnerHandle,
    ScriptRunnerListener, ScriptRunnerParams, ThreadScriptRunnerFactory,
};
pub use widget_state::WidgetStateStore;
