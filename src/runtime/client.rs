//! Transport boundary for one connected browser.

use thiserror::Error;

use crate::core::forward_msg::ForwardMsg;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("session client disconnected: {reason}")]
pub struct SessionClientDisconnectedError {
    pub reason: String,
}

impl SessionClientDisconnectedError {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Writes messages to one browser connection. Called from the runtime loop thread.
pub trait SessionClient: Send + Sync {
    fn write_forward_msg(&self, msg: &ForwardMsg) -> Result<(), SessionClientDisconnectedError>;
}
