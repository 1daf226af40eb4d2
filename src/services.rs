//! Process-wide collaborators shared by every session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

use crate::core::back_msg::UploadedFile;
use crate::sync::lock_unpoisoned;

pub const DEFAULT_MAX_UPLOAD_SIZE: usize = 200 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("file {name} is {size} bytes, over the {max_size} byte upload limit")]
    TooLarge {
        name: String,
        size: usize,
        max_size: usize,
    },
}

/// Uploaded files, grouped by session and then by widget.
#[derive(Debug)]
pub struct UploadedFileManager {
    files: Mutex<HashMap<String, HashMap<String, Vec<UploadedFile>>>>,
    max_upload_size: usize,
}

impl Default for UploadedFileManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UPLOAD_SIZE)
    }
}

impl UploadedFileManager {
    #[must_use]
    pub fn new(max_upload_size: usize) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            max_upload_size,
        }
    }

    pub fn add_file(
        &self,
        session_id: &str,
        widget_id: &str,
        file: UploadedFile,
    ) -> Result<(), UploadError> {
        if file.size() > self.max_upload_size {
            return Err(UploadError::TooLarge {
                name: file.name,
                size: file.data.len(),
                max_size: self.max_upload_size,
            });
        }

        lock_unpoisoned(&self.files)
            .entry(session_id.to_string())
            .or_default()
            .entry(widget_id.to_string())
            .or_default()
            .push(file);
        Ok(())
    }

    #[must_use]
    pub fn get_files(&self, session_id: &str, widget_id: &str) -> Vec<UploadedFile> {
        lock_unpoisoned(&self.files)
            .get(session_id)
            .and_then(|widgets| widgets.get(widget_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn remove_session_files(&self, session_id: &str) {
        if lock_unpoisoned(&self.files).remove(session_id).is_some() {
            debug!(session_id, "removed uploaded files");
        }
    }

    #[must_use]
    pub fn file_count(&self, session_id: &str) -> usize {
        lock_unpoisoned(&self.files)
            .get(session_id)
            .map(|widgets| widgets.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

pub type SubscriptionId = u64;

type SecretsCallback = Arc<dyn Fn() + Send + Sync>;

/// Callbacks run when the secrets file changes.
#[derive(Default)]
pub struct SecretsListeners {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<SubscriptionId, SecretsCallback>>,
}

impl SecretsListeners {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock_unpoisoned(&self.listeners).insert(id, Arc::new(callback));
        id
    }

    /// Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock_unpoisoned(&self.listeners).remove(&id).is_some()
    }

    pub fn notify_changed(&self) {
        // Callbacks may subscribe or unsubscribe, so run them outside the lock.
        let callbacks: Vec<SecretsCallback> =
            lock_unpoisoned(&self.listeners).values().cloned().collect();
        for callback in callbacks {
            callback();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.listeners).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock_unpoisoned(&self.listeners).is_empty()
    }
}

impl std::fmt::Debug for SecretsListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsListeners")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Hook into the process-wide computed-value caches.
pub trait ClearCaches: Send + Sync {
    fn clear_all(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCaches;

impl ClearCaches for NoopCaches {
    fn clear_all(&self) {}
}
