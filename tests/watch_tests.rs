//! Debouncer and filesystem watcher tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_relay::error::{RelayError, Result};
use agent_relay::watch::{
    start_artifact_watcher, start_task_watcher, DebounceConfig, Debouncer, RawEvent,
    SettleHandler, SettleOutcome, WatchEvent, DEFAULT_ARTIFACT_EXTENSIONS,
};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn config(window_ms: u64, cooldown_ms: u64) -> DebounceConfig {
    DebounceConfig {
        window: Duration::from_millis(window_ms),
        cooldown: Duration::from_millis(cooldown_ms),
        require_content: true,
    }
}

/// Records every settled path with the content it had at callback time.
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(PathBuf, String)>>,
    /// Number of leading calls that return an error.
    failures: AtomicUsize,
    /// Number of leading calls (after failures) that panic.
    panics: AtomicUsize,
}

impl Recorder {
    fn calls(&self) -> Vec<(PathBuf, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SettleHandler for Recorder {
    fn accepts(&self, event: &RawEvent) -> bool {
        event.path.extension().is_some_and(|ext| ext == "txt")
    }

    async fn settle(&self, path: &Path) -> Result<SettleOutcome> {
        if Self::take_one(&self.failures) {
            return Err(RelayError::Delivery {
                reason: "downstream unavailable".into(),
            });
        }
        if Self::take_one(&self.panics) {
            panic!("settle handler panicked");
        }
        let content = tokio::fs::read_to_string(path).await?;
        self.calls
            .lock()
            .unwrap()
            .push((path.to_path_buf(), content));
        Ok(SettleOutcome::Emitted)
    }
}

// ---------------------------------------------------------------------------
// Debouncer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn burst_of_events_settles_once_with_final_content() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("task.txt");
    let recorder = Arc::new(Recorder::default());
    let (raw, _loop) = Debouncer::spawn(config(200, 500), recorder.clone());

    for i in 1..=5 {
        std::fs::write(&path, format!("version {i}")).unwrap();
        raw.send(RawEvent::modified(&path)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Still inside the quiet window.
    assert!(recorder.calls().is_empty());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(recorder.calls(), vec![(path.clone(), "version 5".to_string())]);
}

#[tokio::test]
async fn cooldown_suppresses_immediate_retrigger() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("shot.txt");
    std::fs::write(&path, "pixels").unwrap();
    let recorder = Arc::new(Recorder::default());
    let (raw, _loop) = Debouncer::spawn(config(50, 600), recorder.clone());

    raw.send(RawEvent::created(&path)).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(recorder.calls().len(), 1);

    // Same path again inside the cool-down: ignored.
    raw.send(RawEvent::modified(&path)).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(recorder.calls().len(), 1);

    // After the cool-down the path is eligible again.
    tokio::time::sleep(Duration::from_millis(500)).await;
    raw.send(RawEvent::modified(&path)).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(recorder.calls().len(), 2);
}

#[tokio::test]
async fn paths_are_debounced_independently() {
    let tmp = TempDir::new().unwrap();
    let a = tmp.path().join("a.txt");
    let b = tmp.path().join("b.txt");
    std::fs::write(&a, "a").unwrap();
    std::fs::write(&b, "b").unwrap();
    let recorder = Arc::new(Recorder::default());
    let (raw, _loop) = Debouncer::spawn(config(50, 500), recorder.clone());

    raw.send(RawEvent::modified(&a)).unwrap();
    raw.send(RawEvent::modified(&b)).unwrap();
    raw.send(RawEvent::modified(&a)).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut calls = recorder.calls();
    calls.sort();
    assert_eq!(
        calls,
        vec![(a, "a".to_string()), (b, "b".to_string())]
    );
}

#[tokio::test]
async fn rejected_and_missing_paths_never_settle() {
    let tmp = TempDir::new().unwrap();
    let ignored = tmp.path().join("image.png");
    let empty = tmp.path().join("empty.txt");
    std::fs::write(&ignored, "data").unwrap();
    std::fs::write(&empty, "").unwrap();
    let recorder = Arc::new(Recorder::default());
    let (raw, _loop) = Debouncer::spawn(config(30, 100), recorder.clone());

    raw.send(RawEvent::created(&ignored)).unwrap();
    raw.send(RawEvent::created(&empty)).unwrap();
    raw.send(RawEvent::created(tmp.path().join("gone.txt"))).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(recorder.calls().is_empty());
}

#[tokio::test]
async fn failing_callback_clears_pending_flag() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("task.txt");
    std::fs::write(&path, "retry me").unwrap();
    let recorder = Arc::new(Recorder {
        failures: AtomicUsize::new(1),
        ..Default::default()
    });
    let (raw, _loop) = Debouncer::spawn(config(30, 1000), recorder.clone());

    raw.send(RawEvent::modified(&path)).unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(recorder.calls().is_empty());

    // The failure neither left the path pending nor started a cool-down.
    raw.send(RawEvent::modified(&path)).unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(recorder.calls(), vec![(path, "retry me".to_string())]);
}

#[tokio::test]
async fn panicking_callback_does_not_stop_the_debouncer() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("task.txt");
    std::fs::write(&path, "still alive").unwrap();
    let recorder = Arc::new(Recorder {
        panics: AtomicUsize::new(1),
        ..Default::default()
    });
    let (raw, debounce_loop) = Debouncer::spawn(config(30, 1000), recorder.clone());

    raw.send(RawEvent::modified(&path)).unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(!debounce_loop.is_finished());

    raw.send(RawEvent::modified(&path)).unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(recorder.calls().len(), 1);
}

#[tokio::test]
async fn loop_drains_in_flight_cycles_when_senders_drop() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("late.txt");
    std::fs::write(&path, "finish me").unwrap();
    let recorder = Arc::new(Recorder::default());
    let (raw, debounce_loop) = Debouncer::spawn(config(50, 100), recorder.clone());

    raw.send(RawEvent::modified(&path)).unwrap();
    drop(raw);

    tokio::time::timeout(Duration::from_secs(2), debounce_loop)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recorder.calls().len(), 1);
}

// ---------------------------------------------------------------------------
// Watchers over the real filesystem
// ---------------------------------------------------------------------------

async fn next_event(events: &mut mpsc::UnboundedReceiver<WatchEvent>, secs: u64) -> Option<WatchEvent> {
    tokio::time::timeout(Duration::from_secs(secs), events.recv())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn task_watcher_creates_file_and_reports_settled_content() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("workspace");
    let (tx, mut events) = mpsc::unbounded_channel();

    let watcher = start_task_watcher(
        &dir,
        "relay_tasks.md",
        config(300, 1000),
        tx,
        Duration::from_secs(2),
    )
    .unwrap();
    let task_path = dir.join("relay_tasks.md");
    assert!(task_path.exists());
    assert!(watcher.is_running());

    // Zero bytes first, real content shortly after: one event with the final text.
    std::fs::write(&task_path, "").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::write(&task_path, "  hello  \n").unwrap();

    match next_event(&mut events, 5).await {
        Some(WatchEvent::TaskUpdated { path, content }) => {
            assert_eq!(path, task_path);
            assert_eq!(content, "hello");
        }
        other => panic!("expected a task update, got {other:?}"),
    }
    assert!(next_event(&mut events, 1).await.is_none());

    watcher.stop().await;
}

#[tokio::test]
async fn task_watcher_ignores_other_files_and_blank_content() {
    let tmp = TempDir::new().unwrap();
    let (tx, mut events) = mpsc::unbounded_channel();
    let watcher = start_task_watcher(
        tmp.path(),
        "relay_tasks.md",
        config(100, 200),
        tx,
        Duration::from_secs(2),
    )
    .unwrap();

    std::fs::write(tmp.path().join("other.md"), "not the task").unwrap();
    std::fs::write(tmp.path().join("relay_tasks.md"), "   \n\t").unwrap();
    assert!(next_event(&mut events, 1).await.is_none());

    watcher.stop().await;
}

#[tokio::test]
async fn artifact_watcher_filters_by_extension_recursively() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("artifacts");
    let nested = root.join("run-1");
    std::fs::create_dir_all(&nested).unwrap();
    let extensions: Vec<String> = DEFAULT_ARTIFACT_EXTENSIONS
        .iter()
        .map(|ext| ext.to_string())
        .collect();
    let (tx, mut events) = mpsc::unbounded_channel();

    let watcher = start_artifact_watcher(
        &root,
        &extensions,
        config(150, 1000),
        tx,
        Duration::from_secs(2),
    )
    .unwrap();

    std::fs::write(nested.join("notes.txt"), "ignored").unwrap();
    let shot = nested.join("screen.PNG");
    std::fs::write(&shot, b"\x89PNG fake").unwrap();

    match next_event(&mut events, 5).await {
        Some(WatchEvent::ArtifactReady { path }) => assert_eq!(path, shot),
        other => panic!("expected an artifact, got {other:?}"),
    }
    assert!(next_event(&mut events, 1).await.is_none());

    watcher.stop().await;
}

#[tokio::test]
async fn stop_is_bounded_and_closes_the_event_stream() {
    let tmp = TempDir::new().unwrap();
    let (tx, mut events) = mpsc::unbounded_channel();
    let watcher = start_artifact_watcher(
        tmp.path(),
        &["png".to_string()],
        config(50, 100),
        tx,
        Duration::from_secs(1),
    )
    .unwrap();
    assert_eq!(watcher.root(), tmp.path());

    tokio::time::timeout(Duration::from_secs(3), watcher.stop())
        .await
        .unwrap();
    // Every sender lived inside the watcher, so the stream ends.
    assert!(events.recv().await.is_none());
}
