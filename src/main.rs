use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use agent_relay::cli;
use agent_relay::config::RelayConfig;

#[derive(Parser)]
#[command(name = "agent-relay", version, about = "Relay between a chat and a coding agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator and watchers with a console chat side
    Run {
        /// Config file (defaults to .agent-relay/config.yml, then ~/.config/agent-relay/config.yml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Write a default .agent-relay/config.yml in the current directory
    Init,
    /// Inspect or edit the pending-instruction file
    Pending {
        #[command(subcommand)]
        action: PendingAction,
    },
    /// Classify terminal output from stdin
    Classify,
}

#[derive(Subcommand)]
enum PendingAction {
    /// List pending instructions
    List {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Queue an instruction for the agent
    Add {
        text: String,
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Remove all pending instructions
    Clear {
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

fn init_tracing(level: tracing::Level) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false)
        .init();
}

fn env_level() -> tracing::Level {
    std::env::var("RELAY_LOG_LEVEL")
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(tracing::Level::WARN)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    match cli.command {
        Commands::Run { config } => {
            let config = RelayConfig::load(config.as_deref(), &cwd)
                .context("failed to load configuration")?;
            init_tracing(config.tracing_level()?);
            cli::run::run_relay(config).await?;
            // A blocked stdin read would otherwise hold the runtime open after Ctrl-C.
            std::process::exit(0);
        }
        Commands::Init => {
            init_tracing(env_level());
            cli::init::run_init(&cwd).await?;
        }
        Commands::Pending { action } => {
            init_tracing(env_level());
            match action {
                PendingAction::List { file } => {
                    cli::pending::run_pending_list(file.as_deref()).await?
                }
                PendingAction::Add { text, file } => {
                    cli::pending::run_pending_add(&text, file.as_deref()).await?
                }
                PendingAction::Clear { file } => {
                    cli::pending::run_pending_clear(file.as_deref()).await?
                }
            }
        }
        Commands::Classify => {
            init_tracing(env_level());
            cli::classify::run_classify().await?;
        }
    }

    Ok(())
}
