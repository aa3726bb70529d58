//! Composition root: owns the queue, the approval state and the watchers, and turns
//! watcher events into chat messages and persisted instructions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::approval::{ApprovalOutcome, ApprovalStateManager, RequestType};
use crate::classify::{self, TerminalEvent, TerminalEventKind};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::message::{MessageKind, Priority, QueueMessage};
use crate::queue::MessageQueue;
use crate::storage::{append_blocking, InstructionOrigin, InstructionStore, PendingInstruction};
use crate::watch::{start_artifact_watcher, start_task_watcher, PathWatcher, WatchEvent};

/// Wrap task-file text into the instruction handed to the agent.
pub fn task_prompt(content: &str) -> String {
    format!(
        "Task from file update:\n\n{content}\n\nWhen you complete this task, reply with \
         'Ready for next task' so the user knows to update the file again."
    )
}

pub struct Coordinator {
    config: RelayConfig,
    queue: Arc<MessageQueue>,
    approvals: Arc<ApprovalStateManager>,
    store: Arc<dyn InstructionStore>,
    watchers: Mutex<Vec<PathWatcher>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    last_progress: Mutex<Option<u8>>,
    shut_down: AtomicBool,
}

impl Coordinator {
    pub fn new(config: RelayConfig, store: Arc<dyn InstructionStore>) -> Self {
        Self {
            config,
            queue: Arc::new(MessageQueue::new()),
            approvals: Arc::new(ApprovalStateManager::new()),
            store,
            watchers: Mutex::new(Vec::new()),
            pump: Mutex::new(None),
            last_progress: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    pub fn approvals(&self) -> &Arc<ApprovalStateManager> {
        &self.approvals
    }

    pub fn store(&self) -> &Arc<dyn InstructionStore> {
        &self.store
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Chat of the live status message, else the first authorized chat.
    pub fn default_chat_id(&self) -> Option<i64> {
        resolve_chat(&self.queue, self.config.default_chat_id())
    }

    fn chat_message(&self, kind: MessageKind, content: impl Into<String>) -> QueueMessage {
        let message = QueueMessage::new(kind, content);
        match self.default_chat_id() {
            Some(chat_id) => message.with_attribute("chat_id", chat_id),
            None => message,
        }
    }

    // ----- watchers -----

    /// Start the task-file and artifact watchers plus the pump that consumes their events.
    ///
    /// Calling it again while watchers are running is a no-op.
    pub fn start_watchers(&self) -> Result<()> {
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        if !watchers.is_empty() {
            return Ok(());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let debounce = self.config.debounce();
        let stop_timeout = self.config.stop_timeout();

        let task_watcher = start_task_watcher(
            &self.config.workspace_path,
            &self.config.task_file,
            debounce,
            events_tx.clone(),
            stop_timeout,
        )?;
        let artifact_watcher = match start_artifact_watcher(
            &self.config.artifacts_path,
            &self.config.artifact_extensions,
            debounce,
            events_tx,
            stop_timeout,
        ) {
            Ok(watcher) => watcher,
            Err(e) => {
                // Nothing awaits the task watcher yet; dropping it ends its loop.
                drop(task_watcher);
                return Err(e);
            }
        };

        let pump = EventPump {
            queue: self.queue.clone(),
            store: self.store.clone(),
            fallback_chat: self.config.default_chat_id(),
            project_path: self.config.workspace_path.clone(),
        };
        let handle = tokio::spawn(pump.run(events_rx));

        watchers.push(task_watcher);
        watchers.push(artifact_watcher);
        *self.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    pub fn watchers_running(&self) -> bool {
        let watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        !watchers.is_empty() && watchers.iter().all(PathWatcher::is_running)
    }

    // ----- tool-invocation side -----

    /// Ask the human to approve a plan. Blocks until answered or the approval timeout.
    pub async fn request_plan_approval(
        &self,
        plan_summary: &str,
        files_affected: &[String],
        task_name: Option<&str>,
    ) -> ApprovalOutcome {
        let mut attributes = BTreeMap::new();
        attributes.insert("files_affected".to_string(), json!(files_affected));
        if let Some(task_name) = task_name {
            attributes.insert("task_name".to_string(), json!(task_name));
            self.approvals.set_current_task(task_name);
        }
        self.request_approval(
            RequestType::Plan,
            MessageKind::PlanApprovalRequest,
            plan_summary,
            attributes,
        )
        .await
    }

    pub async fn request_change_approval(
        &self,
        change_summary: &str,
        diff_preview: Option<&str>,
    ) -> ApprovalOutcome {
        let mut attributes = BTreeMap::new();
        if let Some(diff) = diff_preview {
            attributes.insert("diff_preview".to_string(), json!(diff));
        }
        self.request_approval(
            RequestType::Change,
            MessageKind::ChangeApprovalRequest,
            change_summary,
            attributes,
        )
        .await
    }

    async fn request_approval(
        &self,
        request_type: RequestType,
        kind: MessageKind,
        content: &str,
        attributes: BTreeMap<String, Value>,
    ) -> ApprovalOutcome {
        let request = self
            .approvals
            .create(request_type, content, attributes.clone());

        let message = self
            .chat_message(kind, content)
            .with_priority(Priority::High)
            .with_attributes(attributes)
            .with_attribute("approval_id", request.id.clone())
            .awaiting_response(request.id.clone());
        self.queue.send_to_chat(message).await;

        self.approvals
            .wait_for(&request.id, self.config.approval_timeout())
            .await
    }

    pub async fn send_info(&self, text: &str) {
        let message = self
            .chat_message(MessageKind::Info, text)
            .with_attribute("priority", "info");
        self.queue.send_to_chat(message).await;
    }

    pub async fn send_error(&self, error: &str, stack_trace: Option<&str>, command: Option<&str>) {
        let mut message = self
            .chat_message(MessageKind::Error, error)
            .with_priority(Priority::Critical);
        if let Some(trace) = stack_trace {
            message = message.with_attribute("stack_trace", trace);
        }
        if let Some(command) = command {
            message = message.with_attribute("command", command);
        }
        self.queue.send_to_chat(message).await;
    }

    /// Record the task status and push a status update to the chat.
    pub async fn publish_status(&self, text: &str, progress_percent: Option<u8>) {
        self.approvals.set_task_status(text);
        let mut message = self
            .chat_message(MessageKind::StatusUpdate, text)
            .with_priority(Priority::Low);
        if let Some(percent) = progress_percent {
            message = message.with_attribute("progress_percent", percent);
        }
        self.queue.send_to_chat(message).await;
    }

    /// Send a file to the chat. Fails if the file does not exist.
    pub async fn send_artifact(&self, path: &Path, caption: Option<&str>) -> Result<()> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(RelayError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("artifact not found: {}", path.display()),
            )));
        }
        let message = artifact_message(path, caption.map(str::to_string), self.default_chat_id());
        self.queue.send_to_chat(message).await;
        Ok(())
    }

    pub async fn send_completion(
        &self,
        summary: &str,
        files_changed: &[String],
        duration: Option<Duration>,
    ) {
        let mut message = self
            .chat_message(MessageKind::Completion, summary)
            .with_attribute("files_changed", json!(files_changed));
        if let Some(duration) = duration {
            message = message.with_attribute("duration_secs", duration.as_secs());
        }
        self.approvals.set_task_status("completed");
        self.queue.send_to_chat(message).await;
    }

    /// Classify a chunk of terminal output and forward what the human should see:
    /// errors, warnings, and progress changes.
    pub async fn report_terminal_output(&self, chunk: &str) -> Vec<TerminalEvent> {
        let events = classify::classify(chunk);
        for event in &events {
            match event.kind {
                TerminalEventKind::Error => {
                    self.send_error(&event.message, event.details.as_deref(), None)
                        .await;
                }
                TerminalEventKind::Warning => {
                    let message = self
                        .chat_message(MessageKind::Info, format!("Warning: {}", event.message))
                        .with_attribute("priority", "warning");
                    self.queue.send_to_chat(message).await;
                }
                TerminalEventKind::Progress => {
                    let changed = {
                        let mut last = self.last_progress.lock().unwrap_or_else(|e| e.into_inner());
                        let changed = *last != event.percent;
                        *last = event.percent;
                        changed
                    };
                    if changed {
                        self.publish_status(&event.message, event.percent).await;
                    }
                }
                TerminalEventKind::Success => {}
            }
        }
        events
    }

    /// Prompt the human and wait for their next message to the agent.
    pub async fn await_user_reply(&self, prompt: &str, timeout: Duration) -> Option<QueueMessage> {
        let message = self
            .chat_message(MessageKind::Info, prompt)
            .with_priority(Priority::High)
            .with_attribute("awaiting_response", true);
        self.queue.send_to_chat(message).await;
        self.queue.receive_from_chat(Some(timeout)).await
    }

    // ----- chat side -----

    /// Enqueue a user message for the agent and persist it for out-of-process agents.
    pub async fn submit_user_message(&self, text: &str, chat_id: Option<i64>) -> Result<()> {
        let mut message = QueueMessage::new(MessageKind::UserMessage, text);
        let mut instruction = PendingInstruction::new(text, InstructionOrigin::Chat)
            .with_project(self.config.workspace_path.display().to_string());
        if let Some(chat_id) = chat_id {
            message = message.with_attribute("chat_id", chat_id);
            instruction = instruction.with_chat(chat_id);
        }
        self.queue.send_to_agent(message).await;
        append_blocking(self.store.clone(), instruction).await
    }

    /// Deliver a button press. Resolves the id in both the queue's correlation map and
    /// the approval state; true if either knew it.
    pub fn resolve_approval(&self, id: &str, approved: bool, note: Option<String>) -> bool {
        let via_queue = self.queue.respond_to_approval(id, approved, note.clone());
        let via_state = self.approvals.resolve(id, approved, note);
        via_queue || via_state
    }

    /// Cancel outstanding approvals, then stop the watchers. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("shutting down");

        let cancelled = self.approvals.cancel_all_pending() + self.queue.cancel_pending_approvals();
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelled pending approvals");
        }

        let watchers = std::mem::take(&mut *self.watchers.lock().unwrap_or_else(|e| e.into_inner()));
        for watcher in watchers {
            watcher.stop().await;
        }

        let pump = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut handle) = pump {
            if tokio::time::timeout(self.config.stop_timeout(), &mut handle)
                .await
                .is_err()
            {
                tracing::warn!("event pump did not stop in time");
                handle.abort();
            }
        }
        tracing::info!("shutdown complete");
    }
}

fn resolve_chat(queue: &MessageQueue, fallback: Option<i64>) -> Option<i64> {
    queue
        .get_status_ticker()
        .map(|ticker| ticker.chat_id)
        .or(fallback)
}

fn artifact_message(path: &Path, caption: Option<String>, chat_id: Option<i64>) -> QueueMessage {
    let path_str = path.display().to_string();
    let mut message = QueueMessage::new(MessageKind::Artifact, path_str.clone())
        .with_attribute("artifact_path", path_str);
    if let Some(caption) = caption {
        message = message.with_attribute("caption", caption);
    }
    if let Some(chat_id) = chat_id {
        message = message.with_attribute("chat_id", chat_id);
    }
    message
}

/// Consumes watcher events until every watcher has stopped.
struct EventPump {
    queue: Arc<MessageQueue>,
    store: Arc<dyn InstructionStore>,
    fallback_chat: Option<i64>,
    project_path: PathBuf,
}

impl EventPump {
    async fn run(self, mut events: mpsc::UnboundedReceiver<WatchEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                WatchEvent::TaskUpdated { path, content } => {
                    self.on_task_updated(&path, &content).await;
                }
                WatchEvent::ArtifactReady { path } => {
                    let caption = path
                        .file_name()
                        .map(|name| format!("📸 {}", name.to_string_lossy()));
                    let chat = resolve_chat(&self.queue, self.fallback_chat);
                    self.queue
                        .send_to_chat(artifact_message(&path, caption, chat))
                        .await;
                }
            }
        }
        tracing::debug!("event pump finished");
    }

    async fn on_task_updated(&self, path: &Path, content: &str) {
        let instruction = PendingInstruction::new(task_prompt(content), InstructionOrigin::TaskFile)
            .with_project(self.project_path.display().to_string());
        if let Err(e) = append_blocking(self.store.clone(), instruction).await {
            tracing::error!(path = %path.display(), "failed to persist task instruction: {}", e);
            return;
        }

        let mut message = QueueMessage::new(
            MessageKind::Info,
            format!("📝 Task file updated ({} chars), queued for the agent", content.len()),
        )
        .with_attribute("task_file", path.display().to_string());
        if let Some(chat_id) = resolve_chat(&self.queue, self.fallback_chat) {
            message = message.with_attribute("chat_id", chat_id);
        }
        self.queue.send_to_chat(message).await;
    }
}
