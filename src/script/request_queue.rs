//! Control mailbox between a session and its script runner.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::core::client_state::{coalesce_widget_states, ClientState, WidgetStates};
use crate::sync::lock_unpoisoned;

/// State a rerun is performed against. `widget_states: None` keeps the values already in
/// the session's widget store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RerunData {
    pub query_string: String,
    pub widget_states: Option<WidgetStates>,
}

impl RerunData {
    #[must_use]
    pub fn new(query_string: impl Into<String>, widget_states: Option<WidgetStates>) -> Self {
        Self {
            query_string: query_string.into(),
            widget_states,
        }
    }

    #[must_use]
    pub fn from_client_state(client_state: ClientState) -> Self {
        Self {
            query_string: client_state.query_string,
            widget_states: Some(client_state.widget_states),
        }
    }

    /// Merges a newer rerun into this pending one.
    #[must_use]
    pub fn coalesce(self, newer: RerunData) -> RerunData {
        RerunData {
            query_string: newer.query_string,
            widget_states: coalesce_widget_states(self.widget_states, newer.widget_states),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptRequest {
    Rerun(RerunData),
    Stop,
    Shutdown,
}

#[derive(Debug, Default)]
struct RequestQueueState {
    requests: VecDeque<ScriptRequest>,
    shutdown: bool,
}

/// Thread-safe FIFO of [`ScriptRequest`]s.
///
/// Writers: the runtime loop thread and the script thread itself (self-rerun). Reader: the
/// script runner. A `Rerun` at the tail absorbs the next `Rerun`; everything else stays in
/// FIFO order. `Shutdown` moves to the head and seals the queue.
#[derive(Debug, Default)]
pub struct ScriptRequestQueue {
    state: Mutex<RequestQueueState>,
}

impl ScriptRequestQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the request was refused because the queue is shut down.
    pub fn enqueue(&self, request: ScriptRequest) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        if state.shutdown {
            return false;
        }

        match request {
            ScriptRequest::Shutdown => {
                state.shutdown = true;
                state.requests.push_front(ScriptRequest::Shutdown);
            }
            ScriptRequest::Rerun(data) => {
                match state.requests.back_mut() {
                    Some(ScriptRequest::Rerun(pending)) => {
                        let old = std::mem::take(pending);
                        *pending = old.coalesce(data);
                    }
                    _ => state.requests.push_back(ScriptRequest::Rerun(data)),
                }
            }
            ScriptRequest::Stop => state.requests.push_back(ScriptRequest::Stop),
        }
        true
    }

    pub fn dequeue(&self) -> Option<ScriptRequest> {
        lock_unpoisoned(&self.state).requests.pop_front()
    }

    #[must_use]
    pub fn has_request(&self) -> bool {
        !lock_unpoisoned(&self.state).requests.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.state).requests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.has_request()
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        lock_unpoisoned(&self.state).shutdown
    }

    /// Copy of the pending requests, head first.
    #[must_use]
    pub fn pending(&self) -> Vec<ScriptRequest> {
        lock_unpoisoned(&self.state).requests.iter().cloned().collect()
    }
}
