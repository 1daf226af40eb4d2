use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

use crate::error::SessionStoreError;
use crate::paths::{session_file_name, session_id_from_file_name, validate_session_id};
use crate::schema::{SessionSnapshot, SNAPSHOT_VERSION};
use crate::storage::SessionStorage;

/// One JSON file per session under a root directory.
///
/// Files are written to a temporary sibling and renamed into place, so a reader never
/// observes a partial snapshot. Expiry is computed from the snapshot's `saved_at`.
pub struct FileSessionStorage {
    root: PathBuf,
    ttl: Duration,
}

impl FileSessionStorage {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Result<Self, SessionStoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|source| SessionStoreError::io("creating session directory", &root, source))?;
        Ok(Self { root, ttl })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, session_id: &str) -> Result<PathBuf, SessionStoreError> {
        validate_session_id(session_id)?;
        Ok(self.root.join(session_file_name(session_id)))
    }

    fn read_snapshot(&self, path: &Path) -> Result<Option<SessionSnapshot>, SessionStoreError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SessionStoreError::io("reading session snapshot", path, source))
            }
        };

        let snapshot: SessionSnapshot = serde_json::from_str(&contents)
            .map_err(|source| SessionStoreError::json_parse(path, source))?;
        validate_snapshot(path, &snapshot)?;
        Ok(Some(snapshot))
    }

    fn is_expired(&self, path: &Path, snapshot: &SessionSnapshot) -> Result<bool, SessionStoreError> {
        let saved_at = parse_rfc3339(path, "saved_at", &snapshot.saved_at)?;
        let elapsed = OffsetDateTime::now_utc() - saved_at;
        Ok(elapsed.whole_milliseconds() >= self.ttl.as_millis() as i128)
    }

    fn remove_file(&self, path: &Path) -> Result<(), SessionStoreError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SessionStoreError::io("removing session snapshot", path, source)),
        }
    }
}

impl SessionStorage for FileSessionStorage {
    fn save(&mut self, snapshot: SessionSnapshot) -> Result<(), SessionStoreError> {
        let path = self.path_for(&snapshot.session_id)?;
        let json = serde_json::to_vec_pretty(&snapshot)
            .map_err(|source| SessionStoreError::json_serialize(&snapshot.session_id, source))?;

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .map_err(|source| SessionStoreError::io("writing session snapshot", &tmp_path, source))?;
        fs::rename(&tmp_path, &path)
            .map_err(|source| SessionStoreError::io("renaming session snapshot", &path, source))
    }

    fn load(&mut self, session_id: &str) -> Result<Option<SessionSnapshot>, SessionStoreError> {
        let path = self.path_for(session_id)?;
        let Some(snapshot) = self.read_snapshot(&path)? else {
            return Ok(None);
        };
        if self.is_expired(&path, &snapshot)? {
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    fn delete(&mut self, session_id: &str) -> Result<(), SessionStoreError> {
        let path = self.path_for(session_id)?;
        self.remove_file(&path)
    }

    fn list(&self) -> Result<Vec<String>, SessionStoreError> {
        let entries = fs::read_dir(&self.root)
            .map_err(|source| SessionStoreError::io("listing session directory", &self.root, source))?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| {
                SessionStoreError::io("listing session directory", &self.root, source)
            })?;
            let file_name = entry.file_name();
            if let Some(session_id) = file_name.to_str().and_then(session_id_from_file_name) {
                ids.push(session_id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn evict_expired(&mut self) -> Result<Vec<String>, SessionStoreError> {
        let mut evicted = Vec::new();
        for session_id in self.list()? {
            let path = self.path_for(&session_id)?;
            let expired = match self.read_snapshot(&path) {
                Ok(Some(snapshot)) => self.is_expired(&path, &snapshot)?,
                Ok(None) => false,
                Err(error) => {
                    warn!(session_id = %session_id, error = %error, "removing unreadable session snapshot");
                    true
                }
            };
            if expired {
                self.remove_file(&path)?;
                evicted.push(session_id);
            }
        }
        Ok(evicted)
    }
}

fn validate_snapshot(path: &Path, snapshot: &SessionSnapshot) -> Result<(), SessionStoreError> {
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(SessionStoreError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: snapshot.version,
        });
    }
    parse_rfc3339(path, "saved_at", &snapshot.saved_at)?;
    Ok(())
}

fn parse_rfc3339(
    path: &Path,
    field: &'static str,
    value: &str,
) -> Result<OffsetDateTime, SessionStoreError> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(|_| SessionStoreError::InvalidTimestamp {
        path: path.to_path_buf(),
        field,
        value: value.to_string(),
    })
}
