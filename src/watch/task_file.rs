use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{RelayError, Result};

use super::{DebounceConfig, PathWatcher, RawEvent, SettleHandler, SettleOutcome, WatchEvent};

/// Emits [`WatchEvent::TaskUpdated`] when one fixed file settles with non-blank text.
pub struct TaskFileHandler {
    file_name: OsString,
    events: mpsc::UnboundedSender<WatchEvent>,
}

impl TaskFileHandler {
    pub fn new(file_name: impl Into<OsString>, events: mpsc::UnboundedSender<WatchEvent>) -> Self {
        Self {
            file_name: file_name.into(),
            events,
        }
    }
}

#[async_trait]
impl SettleHandler for TaskFileHandler {
    fn accepts(&self, event: &RawEvent) -> bool {
        event.path.file_name() == Some(self.file_name.as_os_str())
    }

    async fn settle(&self, path: &Path) -> Result<SettleOutcome> {
        let text = tokio::fs::read_to_string(path).await?;
        let content = text.trim();
        if content.is_empty() {
            return Ok(SettleOutcome::Skipped);
        }

        tracing::info!(path = %path.display(), len = content.len(), "task file updated");
        self.events
            .send(WatchEvent::TaskUpdated {
                path: path.to_path_buf(),
                content: content.to_string(),
            })
            .map_err(|_| RelayError::Delivery {
                reason: "task event receiver closed".into(),
            })?;
        Ok(SettleOutcome::Emitted)
    }
}

/// Watch `dir/file_name`, creating both if missing.
pub fn start_task_watcher(
    dir: &Path,
    file_name: &str,
    config: DebounceConfig,
    events: mpsc::UnboundedSender<WatchEvent>,
    stop_timeout: Duration,
) -> Result<PathWatcher> {
    std::fs::create_dir_all(dir)?;
    let task_path = dir.join(file_name);
    if !task_path.exists() {
        std::fs::File::create(&task_path)?;
        tracing::info!(path = %task_path.display(), "created task file");
    }

    let handler = Arc::new(TaskFileHandler::new(file_name, events));
    PathWatcher::start(dir, false, config, handler, stop_timeout)
}
