use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::SessionStoreError;
use crate::paths::validate_session_id;
use crate::schema::SessionSnapshot;
use crate::storage::SessionStorage;

struct StoredEntry {
    saved_at: Instant,
    snapshot: SessionSnapshot,
}

/// In-process storage with a time-to-live and a capacity bound.
///
/// When full, saving a new session displaces the oldest one. Displaced ids are reported by
/// the next [`SessionStorage::evict_expired`] call.
pub struct MemorySessionStorage {
    ttl: Duration,
    max_entries: usize,
    entries: HashMap<String, StoredEntry>,
    displaced: Vec<String>,
}

impl MemorySessionStorage {
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: HashMap::new(),
            displaced: Vec::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(&self, entry: &StoredEntry) -> bool {
        entry.saved_at.elapsed() >= self.ttl
    }

    fn displace_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.saved_at)
            .map(|(session_id, _)| session_id.clone());
        if let Some(session_id) = oldest {
            debug!(session_id = %session_id, "displacing oldest stored session");
            self.entries.remove(&session_id);
            self.displaced.push(session_id);
        }
    }
}

impl SessionStorage for MemorySessionStorage {
    fn save(&mut self, snapshot: SessionSnapshot) -> Result<(), SessionStoreError> {
        validate_session_id(&snapshot.session_id)?;
        self.displaced.retain(|session_id| *session_id != snapshot.session_id);
        if !self.entries.contains_key(&snapshot.session_id) {
            while self.entries.len() >= self.max_entries {
                self.displace_oldest();
            }
        }
        self.entries.insert(
            snapshot.session_id.clone(),
            StoredEntry {
                saved_at: Instant::now(),
                snapshot,
            },
        );
        Ok(())
    }

    fn load(&mut self, session_id: &str) -> Result<Option<SessionSnapshot>, SessionStoreError> {
        let Some(entry) = self.entries.get(session_id) else {
            return Ok(None);
        };
        if self.is_expired(entry) {
            return Ok(None);
        }
        Ok(Some(entry.snapshot.clone()))
    }

    fn delete(&mut self, session_id: &str) -> Result<(), SessionStoreError> {
        self.entries.remove(session_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, SessionStoreError> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn evict_expired(&mut self) -> Result<Vec<String>, SessionStoreError> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry))
            .map(|(session_id, _)| session_id.clone())
            .collect();
        for session_id in &expired {
            self.entries.remove(session_id);
        }

        let mut evicted = std::mem::take(&mut self.displaced);
        evicted.extend(expired);
        evicted.sort();
        evicted.dedup();
        Ok(evicted)
    }
}
