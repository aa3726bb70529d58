use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a queued message means to the side that receives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    // chat -> agent
    Prompt,
    Approval,
    Rejection,
    UserMessage,

    // agent -> chat
    PlanApprovalRequest,
    ChangeApprovalRequest,
    StatusUpdate,
    Artifact,
    Error,
    Info,
    Completion,
}

impl MessageKind {
    /// True for the kinds that ask the human to approve or reject something.
    pub fn is_approval_request(&self) -> bool {
        matches!(
            self,
            MessageKind::PlanApprovalRequest | MessageKind::ChangeApprovalRequest
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::Prompt => "prompt",
            MessageKind::Approval => "approval",
            MessageKind::Rejection => "rejection",
            MessageKind::UserMessage => "user_message",
            MessageKind::PlanApprovalRequest => "plan_approval_request",
            MessageKind::ChangeApprovalRequest => "change_approval_request",
            MessageKind::StatusUpdate => "status_update",
            MessageKind::Artifact => "artifact",
            MessageKind::Error => "error",
            MessageKind::Info => "info",
            MessageKind::Completion => "completion",
        };
        f.write_str(name)
    }
}

/// Display priority. The queue never reorders on it; delivery is FIFO per direction.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A message travelling through the queue in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub kind: MessageKind,
    pub priority: Priority,
    pub content: String,

    /// Kind-specific data: destination chat, file paths, captions, diff previews.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,

    pub created_at: DateTime<Utc>,

    /// Set on approval requests; links the message to its eventual response.
    pub correlation_id: Option<String>,

    #[serde(default)]
    pub requires_response: bool,
}

impl QueueMessage {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            priority: Priority::Normal,
            content: content.into(),
            attributes: BTreeMap::new(),
            created_at: Utc::now(),
            correlation_id: None,
            requires_response: false,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, Value>) -> Self {
        self.attributes.extend(attributes);
        self
    }

    /// Mark this message as an approval request awaiting `correlation_id`'s response.
    pub fn awaiting_response(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self.requires_response = true;
        self
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    pub fn attribute_i64(&self, key: &str) -> Option<i64> {
        self.attributes.get(key).and_then(Value::as_i64)
    }

    /// Destination chat, if the producer set one.
    pub fn chat_id(&self) -> Option<i64> {
        self.attribute_i64("chat_id")
    }
}
