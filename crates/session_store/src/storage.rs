use crate::error::SessionStoreError;
use crate::schema::SessionSnapshot;

/// Keeps disconnected sessions around for a bounded reconnection window.
pub trait SessionStorage: Send {
    /// Stores `snapshot`, replacing any earlier snapshot of the same session.
    fn save(&mut self, snapshot: SessionSnapshot) -> Result<(), SessionStoreError>;

    /// The stored snapshot, or `None` if it is missing or expired.
    fn load(&mut self, session_id: &str) -> Result<Option<SessionSnapshot>, SessionStoreError>;

    /// Removes a snapshot. Missing ids are not an error.
    fn delete(&mut self, session_id: &str) -> Result<(), SessionStoreError>;

    /// Ids of every stored snapshot, sorted.
    fn list(&self) -> Result<Vec<String>, SessionStoreError>;

    /// Drops snapshots that expired or were displaced, returning their ids.
    fn evict_expired(&mut self) -> Result<Vec<String>, SessionStoreError>;
}
