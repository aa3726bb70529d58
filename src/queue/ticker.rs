use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Location of the live status message in the chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerRef {
    pub chat_id: i64,
    pub message_id: i64,
}

/// At most one live status message, edited in place instead of resent.
/// Last writer wins.
#[derive(Debug, Default)]
pub struct StatusTicker {
    current: Mutex<Option<TickerRef>>,
}

impl StatusTicker {
    pub fn set(&self, ticker: TickerRef) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(ticker);
    }

    pub fn get(&self) -> Option<TickerRef> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn clear(&self) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
