use std::path::{Path, PathBuf};

use crate::config::RelayConfig;
use crate::error::Result;
use crate::storage::{InstructionOrigin, InstructionStore, JsonFileStore, PendingInstruction};

fn open_store(file: Option<&Path>) -> Result<JsonFileStore> {
    let path = match file {
        Some(path) => path.to_path_buf(),
        None => {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            RelayConfig::load(None, &cwd)?.instructions_file
        }
    };
    Ok(JsonFileStore::new(path))
}

/// List instructions waiting for the agent.
pub async fn run_pending_list(file: Option<&Path>) -> Result<()> {
    let store = open_store(file)?;
    let pending = store.read_all()?;

    if pending.is_empty() {
        println!("No pending instructions.");
        return Ok(());
    }

    for instruction in &pending {
        println!(
            "[{}] {} ({})\n  {}\n",
            instruction.timestamp.format("%Y-%m-%d %H:%M:%S"),
            instruction.origin,
            instruction.project_path.as_deref().unwrap_or("-"),
            truncate(&instruction.content, 120),
        );
    }

    println!("{} pending instruction(s)", pending.len());
    Ok(())
}

pub async fn run_pending_add(text: &str, file: Option<&Path>) -> Result<()> {
    let store = open_store(file)?;
    let mut instruction = PendingInstruction::new(text, InstructionOrigin::Cli);
    if let Ok(cwd) = std::env::current_dir() {
        instruction = instruction.with_project(cwd.display().to_string());
    }
    store.append(instruction)?;
    eprintln!("agent-relay: instruction queued in {}", store.path().display());
    Ok(())
}

pub async fn run_pending_clear(file: Option<&Path>) -> Result<()> {
    let store = open_store(file)?;
    let cleared = store.take_all()?.len();
    eprintln!("agent-relay: cleared {} instruction(s)", cleared);
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}
