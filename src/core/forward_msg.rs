//! Server-to-client messages and their content hashes.
//!
//! A message's hash covers only its payload. Metadata (delivery hints such as the delta
//! path or the cacheable flag) and the hash field itself never feed the digest, so two
//! independently produced messages with the same content converge on the same hash.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::client_state::WidgetValue;
use crate::core::delta::{Delta, ExceptionInfo};

/// Position of a delta in the element tree, e.g. `[0, 3]` for the fourth element of the
/// main container.
pub type DeltaPath = Vec<u32>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardMsgMetadata {
    pub cacheable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delta_path: DeltaPath,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub server_version: String,
}

impl Default for EnvironmentInfo {
    fn default() -> Self {
        Self {
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Configuration the browser needs to interpret subsequent messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub max_cached_message_age: u64,
    pub allow_run_on_save: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub run_on_save: bool,
    pub script_is_running: bool,
}

/// Sent at the start of every script run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSession {
    pub script_run_id: String,
    pub session_id: String,
    pub script_name: String,
    pub environment: EnvironmentInfo,
    pub user_info: UserInfo,
    pub config: ClientConfig,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptFinishedStatus {
    FinishedSuccessfully,
    FinishedWithCompileError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    ScriptChangedOnDisk,
    ScriptCompilationException(ExceptionInfo),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ForwardMsgPayload {
    NewSession(NewSession),
    SessionStatusChanged(SessionStatus),
    ScriptFinished { status: ScriptFinishedStatus },
    SessionEvent { event: SessionEvent },
    Delta { delta: Delta },
    RefHash { hash: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardMsg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default)]
    pub metadata: ForwardMsgMetadata,
    pub payload: ForwardMsgPayload,
}

impl ForwardMsg {
    #[must_use]
    pub fn new(payload: ForwardMsgPayload) -> Self {
        Self {
            hash: None,
            metadata: ForwardMsgMetadata::default(),
            payload,
        }
    }

    #[must_use]
    pub fn delta(delta: Delta, delta_path: DeltaPath) -> Self {
        Self {
            hash: None,
            metadata: ForwardMsgMetadata {
                cacheable: false,
                delta_path,
            },
            payload: ForwardMsgPayload::Delta { delta },
        }
    }

    #[must_use]
    pub fn script_finished(status: ScriptFinishedStatus) -> Self {
        Self::new(ForwardMsgPayload::ScriptFinished { status })
    }

    #[must_use]
    pub fn session_status_changed(status: SessionStatus) -> Self {
        Self::new(ForwardMsgPayload::SessionStatusChanged(status))
    }

    #[must_use]
    pub fn session_event(event: SessionEvent) -> Self {
        Self::new(ForwardMsgPayload::SessionEvent { event })
    }

    #[must_use]
    pub fn as_delta(&self) -> Option<&Delta> {
        match &self.payload {
            ForwardMsgPayload::Delta { delta } => Some(delta),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_delta(&self) -> bool {
        self.as_delta().is_some()
    }

    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(self.payload, ForwardMsgPayload::RefHash { .. })
    }

    #[must_use]
    pub fn is_script_finished_successfully(&self) -> bool {
        matches!(
            self.payload,
            ForwardMsgPayload::ScriptFinished {
                status: ScriptFinishedStatus::FinishedSuccessfully
            }
        )
    }

    /// Serialized payload bytes: the input to the content hash and to the size threshold
    /// of the cacheability check.
    #[must_use]
    pub fn payload_bytes(&self) -> Vec<u8> {
        // Payload types only contain string-keyed maps, which always serialize.
        serde_json::to_vec(&self.payload).unwrap_or_default()
    }

    /// Content hash of the payload, computed without touching `self.hash`.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        hash_bytes(&self.payload_bytes())
    }

    /// Returns the cached hash, computing and storing it first when absent.
    pub fn populate_hash(&mut self) -> &str {
        if self.hash.is_none() {
            self.hash = Some(self.compute_hash());
        }
        self.hash.as_deref().unwrap_or_default()
    }

    /// The stored hash if present, otherwise a freshly computed one.
    #[must_use]
    pub fn hash_or_compute(&self) -> String {
        match &self.hash {
            Some(hash) => hash.clone(),
            None => self.compute_hash(),
        }
    }

    /// Whether the message type may be deduplicated by content. Control and status
    /// messages are never cacheable; neither are references themselves.
    #[must_use]
    pub fn is_cacheable_type(&self) -> bool {
        self.is_delta()
    }
}

/// SHA-256 of `bytes` as lowercase hex.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{:x}", digest)
}

/// Delta rendering widget `id` with its current value.
#[must_use]
pub fn widget_delta(id: &str, kind: &str, value: Option<WidgetValue>) -> Delta {
    Delta::new_element(crate::core::delta::Element::Widget {
        id: id.to_string(),
        kind: kind.to_string(),
        value,
    })
}
