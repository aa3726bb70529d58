pub mod task;

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::error::RelayError;

pub use task::TaskState;

pub const NOT_FOUND_NOTE: &str = "Request not found";
pub const TIMED_OUT_NOTE: &str = "Request timed out";
pub const CANCELLED_NOTE: &str = "Cancelled";

/// Lifecycle of an approval request. Everything except `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
    Cancelled,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalStatus::Pending => write!(f, "pending"),
            ApprovalStatus::Approved => write!(f, "approved"),
            ApprovalStatus::Rejected => write!(f, "rejected"),
            ApprovalStatus::TimedOut => write!(f, "timed_out"),
            ApprovalStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What the agent is asking permission for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Plan,
    Change,
    Commit,
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestType::Plan => write!(f, "plan"),
            RequestType::Change => write!(f, "change"),
            RequestType::Commit => write!(f, "commit"),
        }
    }
}

impl std::str::FromStr for RequestType {
    type Err = RelayError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plan" => Ok(RequestType::Plan),
            "change" => Ok(RequestType::Change),
            "commit" => Ok(RequestType::Commit),
            _ => Err(RelayError::UnknownRequestType {
                value: s.to_string(),
            }),
        }
    }
}

/// The answer handed back to whoever waited on an approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalOutcome {
    pub approved: bool,
    pub note: Option<String>,
}

impl ApprovalOutcome {
    pub fn approved(note: Option<String>) -> Self {
        Self {
            approved: true,
            note,
        }
    }

    pub fn rejected(note: impl Into<String>) -> Self {
        Self {
            approved: false,
            note: Some(note.into()),
        }
    }

    pub fn from_response(approved: bool, note: Option<String>) -> Self {
        Self { approved, note }
    }
}

/// Snapshot of one approval request. The completion handle stays inside the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub request_type: RequestType,
    pub content: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub responder_note: Option<String>,
}

impl ApprovalRequest {
    /// The outcome a waiter observes once this request is terminal.
    fn outcome(&self) -> Option<ApprovalOutcome> {
        match self.status {
            ApprovalStatus::Pending => None,
            ApprovalStatus::Approved => Some(ApprovalOutcome::approved(self.responder_note.clone())),
            ApprovalStatus::Rejected => Some(ApprovalOutcome::from_response(
                false,
                self.responder_note.clone(),
            )),
            ApprovalStatus::TimedOut => Some(ApprovalOutcome::rejected(TIMED_OUT_NOTE)),
            ApprovalStatus::Cancelled => Some(ApprovalOutcome::rejected(CANCELLED_NOTE)),
        }
    }
}

struct Entry {
    request: ApprovalRequest,
    // Holds `None` until the request leaves `Pending`; written exactly once.
    completion: watch::Sender<Option<ApprovalOutcome>>,
}

impl Entry {
    /// Move a pending request to `status`. Returns false if it was already terminal.
    fn finish(&mut self, status: ApprovalStatus, note: Option<String>) -> bool {
        if self.request.status.is_terminal() {
            return false;
        }
        self.request.status = status;
        self.request.resolved_at = Some(Utc::now());
        self.request.responder_note = note;
        self.completion.send_replace(self.request.outcome());
        true
    }
}

/// Owns every approval request and its single-resolution completion handle.
///
/// All transitions happen under one mutex, so a `resolve` racing a `wait_for`
/// timeout completes the handle once: the first writer wins.
pub struct ApprovalStateManager {
    requests: Mutex<HashMap<String, Entry>>,
    task: Mutex<TaskState>,
}

impl Default for ApprovalStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalStateManager {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
            task: Mutex::new(TaskState::default()),
        }
    }

    /// Register a new pending request with a fresh id.
    pub fn create(
        &self,
        request_type: RequestType,
        content: impl Into<String>,
        attributes: BTreeMap<String, Value>,
    ) -> ApprovalRequest {
        let request = ApprovalRequest {
            id: uuid::Uuid::new_v4().to_string(),
            request_type,
            content: content.into(),
            attributes,
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
            responder_note: None,
        };
        let (completion, _) = watch::channel(None);

        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        requests.insert(
            request.id.clone(),
            Entry {
                request: request.clone(),
                completion,
            },
        );
        tracing::debug!(id = %request.id, kind = %request_type, "approval request created");
        request
    }

    /// Suspend until the request is resolved or `timeout` elapses.
    ///
    /// A timeout moves the request to `TimedOut`. Unknown ids return
    /// `(false, "Request not found")` and change nothing.
    pub async fn wait_for(&self, id: &str, timeout: Duration) -> ApprovalOutcome {
        let mut rx = {
            let requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = requests.get(id) else {
                return ApprovalOutcome::rejected(NOT_FOUND_NOTE);
            };
            if let Some(outcome) = entry.request.outcome() {
                return outcome;
            }
            entry.completion.subscribe()
        };

        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|resolved| resolved.clone())
        })
        .await;

        match waited {
            Ok(Some(outcome)) => outcome,
            // The entry was pruned while we waited.
            Ok(None) => ApprovalOutcome::rejected(NOT_FOUND_NOTE),
            Err(_) => {
                let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
                match requests.get_mut(id) {
                    Some(entry) => {
                        if entry.finish(ApprovalStatus::TimedOut, None) {
                            tracing::info!(id, "approval request timed out");
                        }
                        // Whoever finished first decides what every waiter sees.
                        entry
                            .request
                            .outcome()
                            .unwrap_or_else(|| ApprovalOutcome::rejected(TIMED_OUT_NOTE))
                    }
                    None => ApprovalOutcome::rejected(NOT_FOUND_NOTE),
                }
            }
        }
    }

    /// Approve or reject a pending request. Returns false for unknown or terminal ids.
    pub fn resolve(&self, id: &str, approved: bool, note: Option<String>) -> bool {
        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        let resolved = requests
            .get_mut(id)
            .is_some_and(|entry| entry.finish(status, note));
        if resolved {
            tracing::info!(id, %status, "approval request resolved");
        }
        resolved
    }

    /// Cancel a single pending request. No-op for unknown or terminal ids.
    pub fn cancel(&self, id: &str) -> bool {
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        requests
            .get_mut(id)
            .is_some_and(|entry| entry.finish(ApprovalStatus::Cancelled, None))
    }

    /// Cancel every pending request in one critical section. Returns how many were cancelled.
    pub fn cancel_all_pending(&self) -> usize {
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        let mut cancelled = 0;
        for entry in requests.values_mut() {
            if entry.finish(ApprovalStatus::Cancelled, None) {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelled pending approval requests");
        }
        cancelled
    }

    /// Pending requests, oldest first.
    pub fn list_pending(&self) -> Vec<ApprovalRequest> {
        let requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        let mut pending: Vec<ApprovalRequest> = requests
            .values()
            .filter(|entry| entry.request.status == ApprovalStatus::Pending)
            .map(|entry| entry.request.clone())
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    pub fn get(&self, id: &str) -> Option<ApprovalRequest> {
        let requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        requests.get(id).map(|entry| entry.request.clone())
    }

    /// Drop terminal requests resolved more than `max_age` ago.
    pub fn prune_resolved(&self, max_age: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        let before = requests.len();
        requests.retain(|_, entry| {
            entry
                .request
                .resolved_at
                .map_or(true, |resolved| resolved > cutoff)
        });
        before - requests.len()
    }

    // ----- task state -----

    pub fn set_current_task(&self, name: impl Into<String>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        task.current_task = Some(name.into());
        task.last_update = Utc::now();
    }

    pub fn set_task_status(&self, status: impl Into<String>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        task.status = status.into();
        task.last_update = Utc::now();
    }

    pub fn clear_task(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        *task = TaskState::default();
    }

    /// Current task snapshot, including the live pending-approval count.
    pub fn task_state(&self) -> TaskState {
        let pending = self.list_pending().len();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        TaskState {
            pending_approvals: pending,
            ..task.clone()
        }
    }
}
