use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{RelayError, Result};

use super::{DebounceConfig, PathWatcher, RawEvent, SettleHandler, SettleOutcome, WatchEvent};

/// Image and video types pushed to the chat as artifacts.
pub const DEFAULT_ARTIFACT_EXTENSIONS: &[&str] =
    &["png", "jpg", "jpeg", "webp", "gif", "mp4", "webm", "mov"];

/// Emits [`WatchEvent::ArtifactReady`] for allow-listed files that finished writing.
pub struct ArtifactHandler {
    extensions: Vec<String>,
    events: mpsc::UnboundedSender<WatchEvent>,
}

impl ArtifactHandler {
    pub fn new(extensions: &[String], events: mpsc::UnboundedSender<WatchEvent>) -> Self {
        Self {
            extensions: extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
            events,
        }
    }

    pub fn is_artifact(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                let ext = ext.to_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            })
    }
}

#[async_trait]
impl SettleHandler for ArtifactHandler {
    fn accepts(&self, event: &RawEvent) -> bool {
        self.is_artifact(&event.path)
    }

    async fn settle(&self, path: &Path) -> Result<SettleOutcome> {
        tracing::info!(path = %path.display(), "new artifact ready");
        self.events
            .send(WatchEvent::ArtifactReady {
                path: path.to_path_buf(),
            })
            .map_err(|_| RelayError::Delivery {
                reason: "artifact event receiver closed".into(),
            })?;
        Ok(SettleOutcome::Emitted)
    }
}

/// Watch `dir` recursively for new artifacts, creating it if missing.
pub fn start_artifact_watcher(
    dir: &Path,
    extensions: &[String],
    config: DebounceConfig,
    events: mpsc::UnboundedSender<WatchEvent>,
    stop_timeout: Duration,
) -> Result<PathWatcher> {
    std::fs::create_dir_all(dir)?;
    let handler = Arc::new(ArtifactHandler::new(extensions, events));
    PathWatcher::start(dir, true, config, handler, stop_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(exts: &[&str]) -> ArtifactHandler {
        let (tx, _rx) = mpsc::unbounded_channel();
        let exts: Vec<String> = exts.iter().map(|e| e.to_string()).collect();
        ArtifactHandler::new(&exts, tx)
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        let h = handler(DEFAULT_ARTIFACT_EXTENSIONS);
        assert!(h.is_artifact(Path::new("/a/shot.png")));
        assert!(h.is_artifact(Path::new("/a/shot.PNG")));
        assert!(h.is_artifact(Path::new("/a/nested/clip.Mp4")));
        assert!(!h.is_artifact(Path::new("/a/notes.txt")));
        assert!(!h.is_artifact(Path::new("/a/png")));
    }

    #[test]
    fn leading_dots_in_allow_list_are_ignored() {
        let h = handler(&[".gif"]);
        assert!(h.is_artifact(Path::new("loop.gif")));
        assert!(!h.is_artifact(Path::new("still.png")));
    }
}
