pub mod ticker;

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};

use crate::approval::{ApprovalOutcome, CANCELLED_NOTE};
use crate::error::Result;
use crate::message::{MessageKind, Priority, QueueMessage};

pub use ticker::{StatusTicker, TickerRef};

pub const APPROVAL_TIMED_OUT_NOTE: &str = "Approval timed out";

/// Future returned by a listener for one delivered message.
pub type ListenerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Push-style delivery sink. Invoked once per message sent in its direction.
pub type Listener = Arc<dyn Fn(QueueMessage) -> ListenerFuture + Send + Sync>;

/// Wrap an async closure as a [`Listener`].
pub fn listener<F, Fut>(f: F) -> Listener
where
    F: Fn(QueueMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |message| -> ListenerFuture { Box::pin(f(message)) })
}

/// Which way a message travels across the chat/agent boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ToAgent,
    ToChat,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ToAgent => write!(f, "to-agent"),
            Direction::ToChat => write!(f, "to-chat"),
        }
    }
}

/// One direction: a FIFO backlog plus the listeners fanned out to on every send.
struct Channel {
    backlog: Mutex<VecDeque<QueueMessage>>,
    arrived: Notify,
    listeners: RwLock<Vec<Listener>>,
}

impl Channel {
    fn new() -> Self {
        Self {
            backlog: Mutex::new(VecDeque::new()),
            arrived: Notify::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    fn push(&self, message: QueueMessage) {
        let mut backlog = self.backlog.lock().unwrap_or_else(|e| e.into_inner());
        backlog.push_back(message);
        drop(backlog);
        self.arrived.notify_one();
    }

    fn pop(&self) -> Option<QueueMessage> {
        let mut backlog = self.backlog.lock().unwrap_or_else(|e| e.into_inner());
        backlog.pop_front()
    }

    fn len(&self) -> usize {
        self.backlog.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Wait for the head of the backlog. Cancel-safe: a message is only removed
    /// in the same poll that returns it.
    async fn next(&self) -> QueueMessage {
        loop {
            let arrived = self.arrived.notified();
            if let Some(message) = self.pop() {
                return message;
            }
            arrived.await;
        }
    }

    fn listeners(&self) -> Vec<Listener> {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Removes a correlation id when its `request_approval` call ends, however it ends.
struct AwaitingGuard<'a> {
    awaiting: &'a DashMap<String, oneshot::Sender<ApprovalOutcome>>,
    correlation_id: &'a str,
}

impl Drop for AwaitingGuard<'_> {
    fn drop(&mut self) {
        self.awaiting.remove(self.correlation_id);
    }
}

/// Bidirectional queue between the chat side and the agent side.
///
/// Delivery is FIFO per direction. `priority` is carried for display only and is
/// never used to reorder: concurrent producers always observe enqueue order.
pub struct MessageQueue {
    to_agent: Channel,
    to_chat: Channel,
    awaiting: DashMap<String, oneshot::Sender<ApprovalOutcome>>,
    ticker: StatusTicker,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            to_agent: Channel::new(),
            to_chat: Channel::new(),
            awaiting: DashMap::new(),
            ticker: StatusTicker::default(),
        }
    }

    fn channel(&self, direction: Direction) -> &Channel {
        match direction {
            Direction::ToAgent => &self.to_agent,
            Direction::ToChat => &self.to_chat,
        }
    }

    /// Register a listener for one direction. Listeners run in registration order.
    pub fn add_listener(&self, direction: Direction, listener: Listener) {
        let channel = self.channel(direction);
        let mut listeners = channel.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.push(listener);
    }

    pub fn on_message_to_chat(&self, listener: Listener) {
        self.add_listener(Direction::ToChat, listener);
    }

    pub fn on_message_to_agent(&self, listener: Listener) {
        self.add_listener(Direction::ToAgent, listener);
    }

    /// Enqueue, then await every listener for that direction.
    ///
    /// The message is in the backlog before any listener runs. Listener errors
    /// and panics are logged and never reach the producer.
    pub async fn send(&self, direction: Direction, message: QueueMessage) {
        let channel = self.channel(direction);
        channel.push(message.clone());

        for (index, listener) in channel.listeners().into_iter().enumerate() {
            let delivery = listener(message.clone());
            match tokio::spawn(delivery).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        %direction,
                        listener = index,
                        message_id = %message.id,
                        "listener failed: {}",
                        e
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        %direction,
                        listener = index,
                        message_id = %message.id,
                        "listener aborted: {}",
                        e
                    );
                }
            }
        }
    }

    pub async fn send_to_agent(&self, message: QueueMessage) {
        self.send(Direction::ToAgent, message).await;
    }

    pub async fn send_to_chat(&self, message: QueueMessage) {
        self.send(Direction::ToChat, message).await;
    }

    /// Pop the head of a direction's backlog.
    ///
    /// `None` timeout waits indefinitely, `Some(Duration::ZERO)` only polls, and
    /// any other timeout returns `None` once it elapses without a message.
    pub async fn receive(
        &self,
        direction: Direction,
        timeout: Option<Duration>,
    ) -> Option<QueueMessage> {
        let channel = self.channel(direction);
        match timeout {
            None => Some(channel.next().await),
            Some(limit) if limit.is_zero() => channel.pop(),
            Some(limit) => tokio::time::timeout(limit, channel.next()).await.ok(),
        }
    }

    /// Messages the agent sent towards the chat.
    pub async fn receive_from_agent(&self, timeout: Option<Duration>) -> Option<QueueMessage> {
        self.receive(Direction::ToChat, timeout).await
    }

    /// Messages the chat sent towards the agent.
    pub async fn receive_from_chat(&self, timeout: Option<Duration>) -> Option<QueueMessage> {
        self.receive(Direction::ToAgent, timeout).await
    }

    /// Number of undelivered messages in a direction.
    pub fn backlog(&self, direction: Direction) -> usize {
        self.channel(direction).len()
    }

    /// Send an approval request to the chat and wait for its response.
    ///
    /// Returns `(false, "Approval timed out")` if nobody responds within `timeout`.
    /// The correlation id is forgotten once this returns or the future is dropped.
    pub async fn request_approval(
        &self,
        kind: MessageKind,
        content: impl Into<String>,
        attributes: BTreeMap<String, Value>,
        timeout: Duration,
    ) -> ApprovalOutcome {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let (respond, response) = oneshot::channel();

        // Registered before sending so a listener can answer synchronously.
        self.awaiting.insert(correlation_id.clone(), respond);
        let _registration = AwaitingGuard {
            awaiting: &self.awaiting,
            correlation_id: &correlation_id,
        };

        let message = QueueMessage::new(kind, content)
            .with_priority(Priority::High)
            .with_attributes(attributes)
            .with_attribute("approval_id", correlation_id.clone())
            .awaiting_response(correlation_id.clone());
        self.send_to_chat(message).await;

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ApprovalOutcome::rejected(CANCELLED_NOTE),
            Err(_) => {
                tracing::info!(%correlation_id, "approval request timed out");
                ApprovalOutcome::rejected(APPROVAL_TIMED_OUT_NOTE)
            }
        }
    }

    /// Deliver the human's answer for `correlation_id`.
    ///
    /// Returns false for unknown ids and for ids that were already answered.
    pub fn respond_to_approval(
        &self,
        correlation_id: &str,
        approved: bool,
        note: Option<String>,
    ) -> bool {
        match self.awaiting.remove(correlation_id) {
            Some((_, respond)) => respond
                .send(ApprovalOutcome::from_response(approved, note))
                .is_ok(),
            None => false,
        }
    }

    /// Correlation ids still waiting for a response.
    pub fn pending_approvals(&self) -> Vec<String> {
        self.awaiting.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Resolve every outstanding `request_approval` waiter with `(false, "Cancelled")`.
    pub fn cancel_pending_approvals(&self) -> usize {
        let mut cancelled = 0;
        for correlation_id in self.pending_approvals() {
            if let Some((_, respond)) = self.awaiting.remove(&correlation_id) {
                if respond.send(ApprovalOutcome::rejected(CANCELLED_NOTE)).is_ok() {
                    cancelled += 1;
                }
            }
        }
        cancelled
    }

    // ----- status ticker -----

    pub fn ticker(&self) -> &StatusTicker {
        &self.ticker
    }

    pub fn set_status_ticker(&self, chat_id: i64, message_id: i64) {
        self.ticker.set(TickerRef {
            chat_id,
            message_id,
        });
    }

    pub fn get_status_ticker(&self) -> Option<TickerRef> {
        self.ticker.get()
    }

    pub fn clear_status_ticker(&self) {
        self.ticker.clear();
    }
}
