//! Filesystem watchers that turn raw change storms into clean domain events.
//!
//! A [`PathWatcher`] binds a platform watcher from `notify` to a [`Debouncer`]. The
//! notify callback runs on its own thread and only forwards [`RawEvent`]s over a
//! channel; filtering, coalescing and cool-down all happen inside the debounce task.

pub mod artifact;
pub mod debounce;
pub mod task_file;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::task::JoinHandle;

use crate::error::{RelayError, Result};

pub use artifact::{start_artifact_watcher, ArtifactHandler, DEFAULT_ARTIFACT_EXTENSIONS};
pub use debounce::{DebounceConfig, Debouncer, SettleHandler, SettleOutcome};
pub use task_file::{start_task_watcher, TaskFileHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Created,
    Modified,
}

/// One undebounced notification from the platform watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub path: PathBuf,
    pub kind: RawEventKind,
}

impl RawEvent {
    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: RawEventKind::Created,
        }
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: RawEventKind::Modified,
        }
    }

    /// Split a notify event into per-path raw events. Removals and accesses are dropped.
    pub fn from_notify(event: notify::Event) -> Vec<RawEvent> {
        let kind = match event.kind {
            EventKind::Create(_) => RawEventKind::Created,
            EventKind::Modify(_) => RawEventKind::Modified,
            _ => return Vec::new(),
        };
        event
            .paths
            .into_iter()
            .map(|path| RawEvent { path, kind })
            .collect()
    }
}

/// Settled, deduplicated events emitted by the watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The task file settled with non-blank content.
    TaskUpdated { path: PathBuf, content: String },
    /// A new artifact file finished writing.
    ArtifactReady { path: PathBuf },
}

/// A running watcher: the platform watch handle plus its debounce task.
pub struct PathWatcher {
    root: PathBuf,
    watcher: Option<RecommendedWatcher>,
    debounce_loop: Option<JoinHandle<()>>,
    stop_timeout: Duration,
}

impl PathWatcher {
    /// Watch `root` and feed its events through a debouncer driving `handler`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<H: SettleHandler>(
        root: &Path,
        recursive: bool,
        config: DebounceConfig,
        handler: Arc<H>,
        stop_timeout: Duration,
    ) -> Result<Self> {
        let (raw_tx, debounce_loop) = Debouncer::spawn(config, handler);

        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for raw in RawEvent::from_notify(event) {
                        // The receiver only closes during shutdown.
                        let _ = raw_tx.send(raw);
                    }
                }
                Err(e) => {
                    tracing::warn!("watch error: {}", e);
                }
            })
            .map_err(|e| RelayError::Watch {
                path: root.to_path_buf(),
                reason: format!("failed to create watcher: {e}"),
            })?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(root, mode).map_err(|e| RelayError::Watch {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;

        tracing::info!(root = %root.display(), recursive, "watcher started");
        Ok(Self {
            root: root.to_path_buf(),
            watcher: Some(watcher),
            debounce_loop: Some(debounce_loop),
            stop_timeout,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_running(&self) -> bool {
        self.debounce_loop
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop watching and join the debounce task, aborting it if the join exceeds
    /// the stop timeout.
    pub async fn stop(mut self) {
        // Dropping the platform watcher drops the raw-event sender, which ends the loop.
        drop(self.watcher.take());

        if let Some(mut handle) = self.debounce_loop.take() {
            if tokio::time::timeout(self.stop_timeout, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!(root = %self.root.display(), "debounce task did not stop in time");
                handle.abort();
            }
        }
        tracing::info!(root = %self.root.display(), "watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind, RemoveKind};

    #[test]
    fn from_notify_keeps_create_and_modify() {
        let created = notify::Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/tmp/a.png"));
        assert_eq!(
            RawEvent::from_notify(created),
            vec![RawEvent::created("/tmp/a.png")]
        );

        let modified = notify::Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/tmp/a.png"))
            .add_path(PathBuf::from("/tmp/b.png"));
        assert_eq!(RawEvent::from_notify(modified).len(), 2);
    }

    #[test]
    fn from_notify_drops_other_kinds() {
        let removed = notify::Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(PathBuf::from("/tmp/a.png"));
        assert!(RawEvent::from_notify(removed).is_empty());

        let accessed = notify::Event::new(EventKind::Access(AccessKind::Any))
            .add_path(PathBuf::from("/tmp/a.png"));
        assert!(RawEvent::from_notify(accessed).is_empty());
    }
}
