use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the agent is currently working on, as reported through status updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub current_task: Option<String>,
    pub status: String,
    pub last_update: DateTime<Utc>,
    pub pending_approvals: usize,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            current_task: None,
            status: "idle".into(),
            last_update: Utc::now(),
            pending_approvals: 0,
        }
    }
}
