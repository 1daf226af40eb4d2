use std::path::{Path, PathBuf};

use crate::error::SessionStoreError;

pub const SESSION_DIR: [&str; 2] = [".scriptflow", "sessions"];

#[must_use]
pub fn session_root(base: &Path) -> PathBuf {
    base.join(SESSION_DIR[0]).join(SESSION_DIR[1])
}

/// Session ids become file names, so only ASCII alphanumerics, `-` and `_` are accepted.
pub fn validate_session_id(session_id: &str) -> Result<(), SessionStoreError> {
    let valid = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SessionStoreError::InvalidSessionId {
            session_id: session_id.to_string(),
        })
    }
}

#[must_use]
pub fn session_file_name(session_id: &str) -> String {
    format!("{session_id}.json")
}

pub(crate) fn session_id_from_file_name(file_name: &str) -> Option<&str> {
    let session_id = file_name.strip_suffix(".json")?;
    validate_session_id(session_id).ok()?;
    Some(session_id)
}
