//! Per-client sessions and the collaborators they are built from.

pub mod app_session;
pub mod watcher;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::client_state::ClientState;
use crate::script::runner::{ScriptRunnerFactory, ThreadScriptRunnerFactory};
use crate::services::{ClearCaches, NoopCaches, SecretsListeners, UploadedFileManager};

pub use app_session::{AppSession, AppSessionState};
pub use watcher::{
    NoopSourcesWatcher, NoopWatcherFactory, PollingSourcesWatcher, PollingWatcherFactory,
    SourcesWatcher, SourcesWatcherFactory,
};

/// Shared services handed to every session.
#[derive(Clone)]
pub struct SessionServices {
    pub uploaded_files: Arc<UploadedFileManager>,
    pub secrets: Arc<SecretsListeners>,
    pub caches: Arc<dyn ClearCaches>,
    pub runner_factory: Arc<dyn ScriptRunnerFactory>,
    pub watcher_factory: Arc<dyn SourcesWatcherFactory>,
}

impl Default for SessionServices {
    fn default() -> Self {
        Self {
            uploaded_files: Arc::new(UploadedFileManager::default()),
            secrets: Arc::new(SecretsListeners::new()),
            caches: Arc::new(NoopCaches),
            runner_factory: Arc::new(ThreadScriptRunnerFactory),
            watcher_factory: Arc::new(PollingWatcherFactory),
        }
    }
}

impl SessionServices {
    #[must_use]
    pub fn with_runner_factory(mut self, factory: Arc<dyn ScriptRunnerFactory>) -> Self {
        self.runner_factory = factory;
        self
    }

    #[must_use]
    pub fn with_watcher_factory(mut self, factory: Arc<dyn SourcesWatcherFactory>) -> Self {
        self.watcher_factory = factory;
        self
    }

    #[must_use]
    pub fn with_caches(mut self, caches: Arc<dyn ClearCaches>) -> Self {
        self.caches = caches;
        self
    }

    #[must_use]
    pub fn with_uploaded_files(mut self, uploaded_files: Arc<UploadedFileManager>) -> Self {
        self.uploaded_files = uploaded_files;
        self
    }

    #[must_use]
    pub fn with_secrets(mut self, secrets: Arc<SecretsListeners>) -> Self {
        self.secrets = secrets;
        self
    }
}

/// The part of a session that outlives a disconnect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoredSessionState {
    pub client_state: ClientState,
    pub run_on_save: bool,
}
