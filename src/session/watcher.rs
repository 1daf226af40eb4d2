//! Source file change detection for run-on-save.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

/// Watches the files a script depends on. Driven from the runtime loop thread.
pub trait SourcesWatcher: Send {
    /// Replaces the watched set. Files already watched keep their baseline.
    fn update_watched_modules(&mut self, paths: &[PathBuf]);

    /// Whether any watched file changed since the previous poll.
    fn poll_changes(&mut self) -> bool;

    fn close(&mut self);

    fn watched_paths(&self) -> Vec<PathBuf>;
}

pub trait SourcesWatcherFactory: Send + Sync {
    fn create(&self, paths: &[PathBuf]) -> Box<dyn SourcesWatcher>;
}

/// Detects changes by comparing modification times.
#[derive(Debug, Default)]
pub struct PollingSourcesWatcher {
    mtimes: HashMap<PathBuf, Option<SystemTime>>,
    closed: bool,
}

impl PollingSourcesWatcher {
    #[must_use]
    pub fn new(paths: &[PathBuf]) -> Self {
        let mut watcher = Self::default();
        watcher.update_watched_modules(paths);
        watcher
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

impl SourcesWatcher for PollingSourcesWatcher {
    fn update_watched_modules(&mut self, paths: &[PathBuf]) {
        if self.closed {
            return;
        }
        let mut next = HashMap::with_capacity(paths.len());
        for path in paths {
            let baseline = match self.mtimes.remove(path) {
                Some(baseline) => baseline,
                None => modified_time(path),
            };
            next.insert(path.clone(), baseline);
        }
        self.mtimes = next;
    }

    fn poll_changes(&mut self) -> bool {
        if self.closed {
            return false;
        }
        let mut changed = false;
        for (path, baseline) in &mut self.mtimes {
            let current = modified_time(path);
            if current != *baseline {
                debug!(path = %path.display(), "watched source changed");
                *baseline = current;
                changed = true;
            }
        }
        changed
    }

    fn close(&mut self) {
        self.closed = true;
        self.mtimes.clear();
    }

    fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.mtimes.keys().cloned().collect();
        paths.sort();
        paths
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSourcesWatcher;

impl SourcesWatcher for NoopSourcesWatcher {
    fn update_watched_modules(&mut self, _paths: &[PathBuf]) {}

    fn poll_changes(&mut self) -> bool {
        false
    }

    fn close(&mut self) {}

    fn watched_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PollingWatcherFactory;

impl SourcesWatcherFactory for PollingWatcherFactory {
    fn create(&self, paths: &[PathBuf]) -> Box<dyn SourcesWatcher> {
        Box::new(PollingSourcesWatcher::new(paths))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWatcherFactory;

impl SourcesWatcherFactory for NoopWatcherFactory {
    fn create(&self, _paths: &[PathBuf]) -> Box<dyn SourcesWatcher> {
        Box::new(NoopSourcesWatcher)
    }
}
