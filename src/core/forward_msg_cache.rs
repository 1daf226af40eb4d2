//! Content-addressed cache of messages already delivered to sessions.
//!
//! Each entry records, per session, the script-run count at which the session last
//! received the full payload. A later identical message can then be replaced with a
//! reference for as long as that record is younger than `max_age` completed runs.
//!
//! Not internally synchronized; the runtime loop thread is the only writer.

use std::collections::HashMap;

use tracing::{debug, error};

use crate::core::forward_msg::{ForwardMsg, ForwardMsgMetadata, ForwardMsgPayload};

#[derive(Debug, Clone)]
struct CacheEntry {
    msg: ForwardMsg,
    session_run_counts: HashMap<String, u64>,
}

#[derive(Debug, Clone)]
pub struct ForwardMsgCache {
    entries: HashMap<String, CacheEntry>,
    max_age: u64,
}

impl ForwardMsgCache {
    #[must_use]
    pub fn new(max_age: u64) -> Self {
        Self {
            entries: HashMap::new(),
            max_age,
        }
    }

    #[must_use]
    pub fn max_age(&self) -> u64 {
        self.max_age
    }

    /// Records that `session_id` received `msg` during script run `run_count`.
    pub fn add_message(&mut self, msg: &mut ForwardMsg, session_id: &str, run_count: u64) {
        let hash = msg.populate_hash().to_string();
        let entry = self
            .entries
            .entry(hash.clone())
            .or_insert_with(|| CacheEntry {
                msg: msg.clone(),
                session_run_counts: HashMap::new(),
            });

        if let Some(previous) = entry.session_run_counts.get(session_id) {
            if *previous > run_count {
                error!(
                    session_id,
                    hash = %hash,
                    previous,
                    run_count,
                    "cache reference recorded with a decreasing script run count"
                );
            }
        }
        entry
            .session_run_counts
            .insert(session_id.to_string(), run_count);
    }

    /// True when `session_id` holds a reference to `msg` that has not aged out at
    /// `run_count`.
    #[must_use]
    pub fn has_message_reference(&self, msg: &ForwardMsg, session_id: &str, run_count: u64) -> bool {
        let hash = msg.hash_or_compute();
        let Some(entry) = self.entries.get(&hash) else {
            return false;
        };
        match entry.session_run_counts.get(session_id) {
            Some(recorded) => run_count.saturating_sub(*recorded) <= self.max_age,
            None => false,
        }
    }

    /// Full message for `hash`, used to answer a client cache miss.
    #[must_use]
    pub fn get_message(&self, hash: &str) -> Option<ForwardMsg> {
        self.entries.get(hash).map(|entry| entry.msg.clone())
    }

    /// Builds the small message that stands in for `msg` on the wire.
    #[must_use]
    pub fn create_reference_msg(msg: &ForwardMsg) -> ForwardMsg {
        ForwardMsg {
            hash: None,
            metadata: ForwardMsgMetadata {
                cacheable: false,
                delta_path: msg.metadata.delta_path.clone(),
            },
            payload: ForwardMsgPayload::RefHash {
                hash: msg.hash_or_compute(),
            },
        }
    }

    /// Drops references of `session_id` older than `max_age` runs at `run_count`, then
    /// any entries left without references.
    pub fn remove_expired_session_entries(&mut self, session_id: &str, run_count: u64) {
        let max_age = self.max_age;
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            if let Some(recorded) = entry.session_run_counts.get(session_id) {
                if run_count.saturating_sub(*recorded) > max_age {
                    entry.session_run_counts.remove(session_id);
                }
            }
            !entry.session_run_counts.is_empty()
        });

        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(session_id, run_count, removed, "expired cache entries removed");
        }
    }

    /// Drops every reference held by `session_id`.
    pub fn remove_refs_for_session(&mut self, session_id: &str) {
        self.entries.retain(|_, entry| {
            entry.session_run_counts.remove(session_id);
            !entry.session_run_counts.is_empty()
        });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ForwardMsgCache {
    fn default() -> Self {
        Self::new(2)
    }
}
