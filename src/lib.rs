//! Coordination core between a chat front-end and a coding agent: a bidirectional
//! message queue, an approval state machine, and debounced filesystem watchers.

pub mod approval;
pub mod classify;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod message;
pub mod queue;
pub mod storage;
pub mod watch;

pub use coordinator::Coordinator;
pub use error::{RelayError, Result};
