pub mod json_file;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

pub use json_file::JsonFileStore;

/// Where a pending instruction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstructionOrigin {
    Chat,
    TaskFile,
    Cli,
}

impl std::fmt::Display for InstructionOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstructionOrigin::Chat => write!(f, "chat"),
            InstructionOrigin::TaskFile => write!(f, "task-file"),
            InstructionOrigin::Cli => write!(f, "cli"),
        }
    }
}

/// An instruction handed to the agent across a process boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInstruction {
    pub content: String,
    pub origin: InstructionOrigin,
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default)]
    pub chat_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

impl PendingInstruction {
    pub fn new(content: impl Into<String>, origin: InstructionOrigin) -> Self {
        Self {
            content: content.into(),
            origin,
            project_path: None,
            chat_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_project(mut self, project_path: impl Into<String>) -> Self {
        self.project_path = Some(project_path.into());
        self
    }

    pub fn with_chat(mut self, chat_id: i64) -> Self {
        self.chat_id = Some(chat_id);
        self
    }
}

/// Append/read/clear over an insertion-ordered list of pending instructions.
pub trait InstructionStore: Send + Sync {
    fn append(&self, instruction: PendingInstruction) -> Result<()>;

    fn read_all(&self) -> Result<Vec<PendingInstruction>>;

    /// Truncate to empty.
    fn clear(&self) -> Result<()>;

    /// Read everything and clear in one step.
    fn take_all(&self) -> Result<Vec<PendingInstruction>>;
}

/// Run `store.append` on the blocking pool. File-backed stores take a lock and fsync.
pub async fn append_blocking(
    store: Arc<dyn InstructionStore>,
    instruction: PendingInstruction,
) -> Result<()> {
    tokio::task::spawn_blocking(move || store.append(instruction))
        .await
        .map_err(|e| RelayError::Storage {
            reason: format!("append task failed: {e}"),
        })?
}
