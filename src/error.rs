use std::io;

use session_store::SessionStoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("a runtime already exists in this process")]
    AlreadyExists,

    #[error("the runtime is stopping or stopped")]
    Stopped,

    #[error("failed to spawn the runtime loop thread: {0}")]
    LoopSpawn(#[source] io::Error),

    #[error("session storage failed: {0}")]
    Storage(#[from] SessionStoreError),

    #[error("no session with id '{0}'")]
    SessionNotFound(String),

    #[error("failed to encode state of session '{session_id}': {source}")]
    SessionState {
        session_id: String,
        #[source]
        source: serde_json::Error,
    },
}
