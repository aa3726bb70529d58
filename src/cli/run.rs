use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::config::RelayConfig;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::message::QueueMessage;
use crate::storage::{InstructionStore, JsonFileStore};

/// One line typed on the chat side of the console relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatInput {
    Approve { id: String, note: Option<String> },
    Reject { id: String, note: Option<String> },
    Message(String),
    Empty,
}

pub fn parse_chat_line(line: &str) -> ChatInput {
    let line = line.trim();
    if line.is_empty() {
        return ChatInput::Empty;
    }

    let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let (id, note) = match rest.trim().split_once(char::is_whitespace) {
        Some((id, note)) => (id.to_string(), Some(note.trim().to_string())),
        None => (rest.trim().to_string(), None),
    };
    if id.is_empty() {
        return ChatInput::Message(line.to_string());
    }

    match command {
        "/approve" => ChatInput::Approve { id, note },
        "/reject" => ChatInput::Reject { id, note },
        _ => ChatInput::Message(line.to_string()),
    }
}

/// Run the relay with a console chat side: chat-bound messages are printed as JSON
/// lines on stdout, stdin lines are user messages or approval commands.
pub async fn run_relay(config: RelayConfig) -> Result<()> {
    let store: Arc<dyn InstructionStore> =
        Arc::new(JsonFileStore::new(config.instructions_file.clone()));
    let coordinator = Coordinator::new(config, store);

    coordinator.start_watchers()?;
    eprintln!(
        "agent-relay: watching {} and {}",
        coordinator.config().task_file_path().display(),
        coordinator.config().artifacts_path.display(),
    );

    let input = BufReader::new(tokio::io::stdin());
    let result = relay_loop(&coordinator, input, &mut std::io::stdout()).await;

    coordinator.shutdown().await;
    result
}

/// Pump both directions until ctrl-c or end of input.
///
/// Chat-bound messages are written to `out`. Agent-bound messages are dropped here:
/// the agent picks them up from the instruction store.
pub async fn relay_loop<R, W>(coordinator: &Coordinator, input: R, out: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let queue = coordinator.queue();
    let mut lines = input.lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let result = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                eprintln!("agent-relay: interrupted");
                break Ok(());
            }
            Some(message) = queue.receive_from_agent(None) => {
                if let Err(e) = render(out, &message) {
                    break Err(e);
                }
            }
            Some(message) = queue.receive_from_chat(None) => {
                tracing::debug!(message_id = %message.id, "agent-bound message left to the store");
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Err(e) = handle_line(coordinator, &line).await {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e.into()),
            },
        }
    };

    // Whatever arrived alongside the last input line still gets shown.
    while let Some(message) = queue.receive_from_agent(Some(Duration::ZERO)).await {
        render(out, &message)?;
    }
    while queue.receive_from_chat(Some(Duration::ZERO)).await.is_some() {}
    result
}

fn render<W: Write>(out: &mut W, message: &QueueMessage) -> Result<()> {
    let line = serde_json::to_string(message)?;
    writeln!(out, "{}", line)?;
    out.flush()?;
    Ok(())
}

async fn handle_line(coordinator: &Coordinator, line: &str) -> Result<()> {
    match parse_chat_line(line) {
        ChatInput::Approve { id, note } => {
            if coordinator.resolve_approval(&id, true, note) {
                eprintln!("agent-relay: approved {}", id);
            } else {
                eprintln!("agent-relay: no pending approval {}", id);
            }
        }
        ChatInput::Reject { id, note } => {
            if coordinator.resolve_approval(&id, false, note) {
                eprintln!("agent-relay: rejected {}", id);
            } else {
                eprintln!("agent-relay: no pending approval {}", id);
            }
        }
        ChatInput::Message(text) => {
            let chat_id = coordinator.default_chat_id();
            coordinator.submit_user_message(&text, chat_id).await?;
            eprintln!("agent-relay: message queued for the agent");
        }
        ChatInput::Empty => {}
    }
    Ok(())
}
