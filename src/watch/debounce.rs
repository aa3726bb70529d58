use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::error::Result;

use super::RawEvent;

#[derive(Debug, Clone, Copy)]
pub struct DebounceConfig {
    /// Quiet interval between the first raw event and the re-check.
    pub window: Duration,
    /// After a settle callback fires, raw events for that path are ignored this long.
    pub cooldown: Duration,
    /// Skip zero-byte files at re-check time.
    pub require_content: bool,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(500),
            cooldown: Duration::from_millis(1000),
            require_content: true,
        }
    }
}

/// What a settle callback did with a verified path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// A domain event was emitted; the path enters its cool-down.
    Emitted,
    /// Nothing worth reporting (e.g. blank content).
    Skipped,
}

/// Domain side of a watcher: which raw events matter, and what to do once a path settles.
#[async_trait]
pub trait SettleHandler: Send + Sync + 'static {
    fn accepts(&self, event: &RawEvent) -> bool;

    async fn settle(&self, path: &Path) -> Result<SettleOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleResult {
    Emitted,
    Skipped,
    Failed,
}

/// Per-path bookkeeping. `pending` guarantees at most one settle cycle in flight.
#[derive(Debug, Default)]
struct PathState {
    pending: bool,
    last_processed: Option<Instant>,
}

/// Collapses bursts of raw notifications into one verified settle callback per path.
///
/// Raw events arrive over an unbounded channel, so the platform notification thread
/// only ever sends; all bookkeeping lives inside the debounce task.
pub struct Debouncer<H: SettleHandler> {
    config: DebounceConfig,
    handler: Arc<H>,
    paths: HashMap<PathBuf, PathState>,
    cycles: JoinSet<(PathBuf, CycleResult)>,
}

impl<H: SettleHandler> Debouncer<H> {
    /// Start the debounce task. It runs until every sender is dropped, then lets
    /// in-flight settle cycles finish before returning.
    pub fn spawn(
        config: DebounceConfig,
        handler: Arc<H>,
    ) -> (mpsc::UnboundedSender<RawEvent>, JoinHandle<()>) {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let debouncer = Self {
            config,
            handler,
            paths: HashMap::new(),
            cycles: JoinSet::new(),
        };
        let handle = tokio::spawn(debouncer.run(raw_rx));
        (raw_tx, handle)
    }

    async fn run(mut self, mut raw: mpsc::UnboundedReceiver<RawEvent>) {
        loop {
            tokio::select! {
                event = raw.recv() => match event {
                    Some(event) => self.on_raw_event(event),
                    None => break,
                },
                Some(joined) = self.cycles.join_next(), if !self.cycles.is_empty() => {
                    self.on_cycle_done(joined);
                }
            }
        }

        while let Some(joined) = self.cycles.join_next().await {
            self.on_cycle_done(joined);
        }
    }

    fn on_raw_event(&mut self, event: RawEvent) {
        if !self.handler.accepts(&event) {
            return;
        }

        let state = self.paths.entry(event.path.clone()).or_default();
        if state.pending {
            tracing::debug!(path = %event.path.display(), "coalesced raw event");
            return;
        }
        if let Some(last) = state.last_processed {
            if last.elapsed() < self.config.cooldown {
                tracing::debug!(path = %event.path.display(), "raw event inside cool-down");
                return;
            }
        }
        state.pending = true;

        let handler = self.handler.clone();
        let config = self.config;
        let path = event.path;
        self.cycles.spawn(async move {
            let result = settle_cycle(handler, config, path.clone()).await;
            (path, result)
        });
    }

    fn on_cycle_done(&mut self, joined: std::result::Result<(PathBuf, CycleResult), JoinError>) {
        match joined {
            Ok((path, result)) => {
                let state = self.paths.entry(path).or_default();
                state.pending = false;
                if result == CycleResult::Emitted {
                    state.last_processed = Some(Instant::now());
                }
            }
            Err(e) => {
                tracing::error!("settle cycle aborted: {}", e);
            }
        }
    }
}

/// Wait out the quiet window, re-check the path, then run the handler in its own task
/// so a panic is reported as a failed cycle instead of tearing down the debouncer.
async fn settle_cycle<H: SettleHandler>(
    handler: Arc<H>,
    config: DebounceConfig,
    path: PathBuf,
) -> CycleResult {
    tokio::time::sleep(config.window).await;

    if !still_present(&path, config.require_content).await {
        tracing::debug!(path = %path.display(), "path gone or empty after quiet window");
        return CycleResult::Skipped;
    }

    let settle_path = path.clone();
    let callback = tokio::spawn(async move { handler.settle(&settle_path).await });
    match callback.await {
        Ok(Ok(SettleOutcome::Emitted)) => CycleResult::Emitted,
        Ok(Ok(SettleOutcome::Skipped)) => CycleResult::Skipped,
        Ok(Err(e)) => {
            tracing::error!(path = %path.display(), "settle callback failed: {}", e);
            CycleResult::Failed
        }
        Err(e) => {
            tracing::error!(path = %path.display(), "settle callback panicked: {}", e);
            CycleResult::Failed
        }
    }
}

async fn still_present(path: &Path, require_content: bool) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => !require_content || meta.len() > 0,
        _ => false,
    }
}
