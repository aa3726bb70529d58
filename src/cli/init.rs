use std::path::Path;

use crate::config::PROJECT_DIR;
use crate::error::Result;

const CONFIG_TEMPLATE: &str = r#"
# agent-relay configuration. Environment variables override these values.
workspace_path: "~"
artifacts_path: ~/.agent-relay/artifacts
task_file: relay_tasks.md
instructions_file: ~/.agent-relay/pending_instructions.json
authorized_chat_ids: []
debounce_ms: 500
cooldown_ms: 1000
approval_timeout_secs: 300
stop_timeout_secs: 5
artifact_extensions: [png, jpg, jpeg, webp, gif, mp4, webm, mov]
log_level: info
"#;

/// Write a default `.agent-relay/config.yml` under `root`.
pub async fn run_init(root: &Path) -> Result<()> {
    let dir = root.join(PROJECT_DIR);
    let config_path = dir.join("config.yml");
    if config_path.exists() {
        eprintln!("agent-relay: {}/config.yml already exists", PROJECT_DIR);
        return Ok(());
    }

    std::fs::create_dir_all(&dir)?;
    std::fs::write(&config_path, CONFIG_TEMPLATE)?;
    eprintln!("agent-relay: initialized {}/", PROJECT_DIR);
    Ok(())
}
