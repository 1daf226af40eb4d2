//! Per-session outbound message buffer.
//!
//! Single writer discipline: the session's script thread enqueues, the runtime loop thread
//! flushes. Both go through the internal mutex.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::core::forward_msg::{DeltaPath, ForwardMsg, ForwardMsgPayload};
use crate::sync::lock_unpoisoned;

#[derive(Debug, Default)]
struct QueueState {
    messages: Vec<ForwardMsg>,
    delta_index_by_path: HashMap<DeltaPath, usize>,
}

#[derive(Debug, Default)]
pub struct MessageQueue {
    state: Mutex<QueueState>,
}

impl MessageQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `msg`, or folds it into a queued delta that targets the same delta path.
    ///
    /// A composed message keeps the queue position of the message it replaces.
    pub fn enqueue(&self, msg: ForwardMsg) {
        let mut state = lock_unpoisoned(&self.state);

        if !msg.is_delta() {
            state.messages.push(msg);
            return;
        }

        let path = msg.metadata.delta_path.clone();
        let msg = match state.delta_index_by_path.get(&path).copied() {
            Some(index) => match compose_messages(&state.messages[index], msg) {
                Ok(composed) => {
                    state.messages[index] = composed;
                    return;
                }
                Err(msg) => msg,
            },
            None => msg,
        };

        let index = state.messages.len();
        state.delta_index_by_path.insert(path, index);
        state.messages.push(msg);
    }

    /// Takes every queued message in order, leaving the queue empty.
    pub fn flush(&self) -> Vec<ForwardMsg> {
        let mut state = lock_unpoisoned(&self.state);
        state.delta_index_by_path.clear();
        std::mem::take(&mut state.messages)
    }

    /// Discards every queued message.
    pub fn clear(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.messages.clear();
        state.delta_index_by_path.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock_unpoisoned(&self.state).messages.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.state).messages.len()
    }
}

fn compose_messages(old: &ForwardMsg, new: ForwardMsg) -> Result<ForwardMsg, ForwardMsg> {
    let Some(old_delta) = old.as_delta() else {
        return Err(new);
    };

    let ForwardMsg {
        hash,
        metadata,
        payload,
    } = new;
    let ForwardMsgPayload::Delta { delta } = payload else {
        return Err(ForwardMsg {
            hash,
            metadata,
            payload,
        });
    };

    match old_delta.compose(delta) {
        Ok(composed) => Ok(ForwardMsg {
            hash: None,
            metadata,
            payload: ForwardMsgPayload::Delta { delta: composed },
        }),
        Err(delta) => Err(ForwardMsg {
            hash,
            metadata,
            payload: ForwardMsgPayload::Delta { delta },
        }),
    }
}
