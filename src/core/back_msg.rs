//! Client-to-server requests.

use serde::{Deserialize, Serialize};

use crate::core::client_state::ClientState;

/// A file uploaded through a file-uploader widget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl UploadedFile {
    #[must_use]
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackMsg {
    /// Rerun against the given state; `None` reuses the session's last known state.
    RerunScript { client_state: Option<ClientState> },
    StopScript,
    ClearCache,
    SetRunOnSave { enabled: bool },
    UploadFile { widget_id: String, file: UploadedFile },
}
