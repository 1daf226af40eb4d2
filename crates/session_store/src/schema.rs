use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::SessionStoreError;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to restore a disconnected session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSnapshot {
    pub version: u32,
    pub session_id: String,
    pub saved_at: String,
    pub script_run_count: u64,
    /// Session-defined payload, opaque to storage.
    pub state: Value,
}

impl SessionSnapshot {
    #[must_use]
    pub fn v1(
        session_id: impl Into<String>,
        saved_at: impl Into<String>,
        script_run_count: u64,
        state: Value,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            session_id: session_id.into(),
            saved_at: saved_at.into(),
            script_run_count,
            state,
        }
    }

    /// A v1 snapshot stamped with the current time.
    pub fn now(
        session_id: impl Into<String>,
        script_run_count: u64,
        state: Value,
    ) -> Result<Self, SessionStoreError> {
        Ok(Self::v1(session_id, now_rfc3339()?, script_run_count, state))
    }
}

pub fn now_rfc3339() -> Result<String, SessionStoreError> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(SessionStoreError::ClockFormat)
}
