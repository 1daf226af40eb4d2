//! The interface a user script runs against.
//!
//! Every call that produces output first consults the request queue; that is the only
//! point at which a running script can be stopped or restarted.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::core::back_msg::UploadedFile;
use crate::core::client_state::WidgetValue;
use crate::core::delta::{Block, BlockKind, Delta, Element, ExceptionInfo};
use crate::core::forward_msg::{widget_delta, ForwardMsg};
use crate::script::request_queue::{RerunData, ScriptRequest, ScriptRequestQueue};
use crate::script::runner::{RunnerId, ScriptRunnerListener};
use crate::script::widget_state::WidgetStateStore;
use crate::services::UploadedFileManager;

/// Control request observed by a running script. Propagate it with `?`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Interrupt {
    #[error("script stop requested")]
    Stop,
    #[error("script rerun requested")]
    Rerun(RerunData),
    #[error("session shutdown requested")]
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    #[error(transparent)]
    Interrupted(#[from] Interrupt),
    #[error(transparent)]
    Exception(#[from] ExceptionInfo),
}

/// A script that can be executed top to bottom any number of times.
pub trait Script: Send + Sync {
    fn name(&self) -> &str {
        "main"
    }

    /// Checked before every run. An error ends the run with a compile error.
    fn compile(&self) -> Result<(), ExceptionInfo> {
        Ok(())
    }

    /// Source files whose modification should be reported to the session.
    fn watched_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn run(&self, ctx: &mut ScriptContext) -> Result<(), ScriptError>;
}

impl<F> Script for F
where
    F: Fn(&mut ScriptContext) -> Result<(), ScriptError> + Send + Sync,
{
    fn run(&self, ctx: &mut ScriptContext) -> Result<(), ScriptError> {
        self(ctx)
    }
}

/// Wraps a closure as a shareable [`Script`].
pub fn script_fn<F>(f: F) -> Arc<dyn Script>
where
    F: Fn(&mut ScriptContext) -> Result<(), ScriptError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Per-run handle given to [`Script::run`].
pub struct ScriptContext {
    runner_id: RunnerId,
    session_id: String,
    query_string: String,
    request_queue: Arc<ScriptRequestQueue>,
    widget_states: Arc<WidgetStateStore>,
    uploaded_files: Arc<UploadedFileManager>,
    listener: Arc<dyn ScriptRunnerListener>,
    next_index: u32,
    seen_widget_ids: HashSet<String>,
}

impl ScriptContext {
    pub(crate) fn new(
        runner_id: RunnerId,
        session_id: String,
        query_string: String,
        request_queue: Arc<ScriptRequestQueue>,
        widget_states: Arc<WidgetStateStore>,
        uploaded_files: Arc<UploadedFileManager>,
        listener: Arc<dyn ScriptRunnerListener>,
    ) -> Self {
        Self {
            runner_id,
            session_id,
            query_string,
            request_queue,
            widget_states,
            uploaded_files,
            listener,
            next_index: 0,
            seen_widget_ids: HashSet::new(),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    /// Returns the pending control request, if any, as an [`Interrupt`].
    pub fn check_interrupt(&mut self) -> Result<(), Interrupt> {
        match self.request_queue.dequeue() {
            None => Ok(()),
            Some(ScriptRequest::Stop) => Err(Interrupt::Stop),
            Some(ScriptRequest::Rerun(data)) => Err(Interrupt::Rerun(data)),
            Some(ScriptRequest::Shutdown) => Err(Interrupt::Shutdown),
        }
    }

    /// Requests a fresh run from the top with the current query string.
    pub fn rerun(&mut self) -> Result<(), Interrupt> {
        self.request_queue.enqueue(ScriptRequest::Rerun(RerunData::new(
            self.query_string.clone(),
            None,
        )));
        self.check_interrupt()
    }

    /// Appends `delta` to the main container and returns its index.
    pub fn enqueue(&mut self, delta: Delta) -> Result<u32, Interrupt> {
        self.check_interrupt()?;
        Ok(self.push_delta(delta))
    }

    pub fn text(&mut self, body: impl Into<String>) -> Result<u32, Interrupt> {
        self.enqueue(Delta::text(body))
    }

    pub fn markdown(&mut self, body: impl Into<String>) -> Result<u32, Interrupt> {
        self.enqueue(Delta::new_element(Element::Markdown { body: body.into() }))
    }

    pub fn empty(&mut self) -> Result<u32, Interrupt> {
        self.enqueue(Delta::new_element(Element::Empty))
    }

    pub fn exception(&mut self, info: ExceptionInfo) -> Result<u32, Interrupt> {
        self.enqueue(Delta::exception(info))
    }

    pub fn table(
        &mut self,
        columns: Vec<String>,
        rows: Vec<Vec<String>>,
    ) -> Result<u32, Interrupt> {
        self.enqueue(Delta::new_element(Element::Table { columns, rows }))
    }

    pub fn block(&mut self, kind: BlockKind, label: Option<String>) -> Result<u32, Interrupt> {
        self.enqueue(Delta::AddBlock {
            block: Block { kind, label },
        })
    }

    /// Appends rows to the table previously written at `index`.
    pub fn add_rows(&mut self, index: u32, rows: Vec<Vec<String>>) -> Result<(), Interrupt> {
        self.check_interrupt()?;
        self.send(Delta::AddRows { rows }, index);
        Ok(())
    }

    /// Declares widget `id` and returns its current value.
    pub fn widget(
        &mut self,
        id: &str,
        kind: &str,
        default: WidgetValue,
    ) -> Result<WidgetValue, Interrupt> {
        self.check_interrupt()?;
        let value = self.widget_states.register(id, default);
        self.seen_widget_ids.insert(id.to_string());
        self.push_delta(widget_delta(id, kind, Some(value.clone())));
        Ok(value)
    }

    /// Files uploaded to widget `widget_id` in this session.
    #[must_use]
    pub fn uploaded_files(&self, widget_id: &str) -> Vec<UploadedFile> {
        self.uploaded_files.get_files(&self.session_id, widget_id)
    }

    pub(crate) fn push_delta(&mut self, delta: Delta) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        self.send(delta, index);
        index
    }

    pub(crate) fn seen_widget_ids(&self) -> &HashSet<String> {
        &self.seen_widget_ids
    }

    fn send(&self, delta: Delta, index: u32) {
        self.listener
            .enqueue_forward_msg(self.runner_id, ForwardMsg::delta(delta, vec![0, index]));
    }
}
