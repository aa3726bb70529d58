use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::watch::{DebounceConfig, DEFAULT_ARTIFACT_EXTENSIONS};

use super::{dirs_global, expand_tilde, home_dir, PROJECT_DIR};

/// Runtime configuration for the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Directory holding the task file.
    pub workspace_path: PathBuf,

    /// Directory watched recursively for screenshots and recordings.
    pub artifacts_path: PathBuf,

    /// Task file name inside `workspace_path`.
    pub task_file: String,

    /// JSON file used to hand pending instructions to the agent process.
    pub instructions_file: PathBuf,

    /// Chats allowed to drive the agent. The first one is the fallback destination.
    pub authorized_chat_ids: Vec<i64>,

    /// Quiet window before a watched path is re-checked. Valid range 10..=5000.
    pub debounce_ms: u64,

    /// Suppression period after a settle callback fires.
    pub cooldown_ms: u64,

    /// How long an approval request waits for the human.
    pub approval_timeout_secs: u64,

    /// Upper bound for joining a watcher's background task at shutdown.
    pub stop_timeout_secs: u64,

    /// Artifact extension allow-list, without dots.
    pub artifact_extensions: Vec<String>,

    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let home = home_dir();
        Self {
            workspace_path: home.clone(),
            artifacts_path: home.join(PROJECT_DIR).join("artifacts"),
            task_file: "relay_tasks.md".into(),
            instructions_file: home.join(PROJECT_DIR).join("pending_instructions.json"),
            authorized_chat_ids: Vec::new(),
            debounce_ms: 500,
            cooldown_ms: 1000,
            approval_timeout_secs: 300,
            stop_timeout_secs: 5,
            artifact_extensions: DEFAULT_ARTIFACT_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            log_level: "info".into(),
        }
    }
}

impl RelayConfig {
    /// Load from a YAML file. Returns defaults if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents).map_err(|e| RelayError::ConfigParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Project config path: `<root>/.agent-relay/config.yml`.
    pub fn project_path(project_root: &Path) -> PathBuf {
        project_root.join(PROJECT_DIR).join("config.yml")
    }

    /// Global config path: `~/.config/agent-relay/config.yml`.
    pub fn global_path() -> PathBuf {
        dirs_global().join("config.yml")
    }

    /// Resolve the config for a process: explicit path, then project, then global,
    /// then defaults. Environment overrides are applied last.
    pub fn load(explicit: Option<&Path>, cwd: &Path) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(RelayError::InvalidConfig {
                        reason: format!("config file not found: {}", path.display()),
                    });
                }
                Self::load_from(path)?
            }
            None => {
                let project = Self::project_path(cwd);
                if project.exists() {
                    Self::load_from(&project)?
                } else {
                    Self::load_from(&Self::global_path())?
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.expand_paths(&home_dir());
        config.validate()?;
        Ok(config)
    }

    /// Apply environment-style overrides through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("WORKSPACE_PATH") {
            self.workspace_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("ARTIFACTS_PATH") {
            self.artifacts_path = PathBuf::from(path);
        }
        if let Some(name) = lookup("RELAY_TASK_FILE") {
            self.task_file = name;
        }
        if let Some(path) = lookup("RELAY_INSTRUCTIONS_FILE") {
            self.instructions_file = PathBuf::from(path);
        }
        if let Some(ids) = lookup("AUTHORIZED_CHAT_IDS") {
            self.authorized_chat_ids = ids
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .filter_map(|id| match id.parse() {
                    Ok(id) => Some(id),
                    Err(_) => {
                        tracing::warn!("ignoring malformed chat id in AUTHORIZED_CHAT_IDS: {}", id);
                        None
                    }
                })
                .collect();
        }
        if let Some(level) = lookup("RELAY_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    pub fn expand_paths(&mut self, home: &Path) {
        self.workspace_path = expand_tilde(&self.workspace_path, home);
        self.artifacts_path = expand_tilde(&self.artifacts_path, home);
        self.instructions_file = expand_tilde(&self.instructions_file, home);
    }

    pub fn validate(&self) -> Result<()> {
        if !(10..=5000).contains(&self.debounce_ms) {
            return Err(RelayError::InvalidConfig {
                reason: format!(
                    "debounce_ms must be between 10 and 5000, got {}",
                    self.debounce_ms
                ),
            });
        }
        if self.artifact_extensions.is_empty() {
            return Err(RelayError::InvalidConfig {
                reason: "artifact_extensions must not be empty".into(),
            });
        }
        if self.task_file.trim().is_empty() || self.task_file.contains('/') {
            return Err(RelayError::InvalidConfig {
                reason: format!("task_file must be a plain file name, got {:?}", self.task_file),
            });
        }
        self.tracing_level()?;
        Ok(())
    }

    pub fn tracing_level(&self) -> Result<tracing::Level> {
        self.log_level
            .parse::<tracing::Level>()
            .map_err(|_| RelayError::InvalidConfig {
                reason: format!("unknown log level: {}", self.log_level),
            })
    }

    pub fn debounce(&self) -> DebounceConfig {
        DebounceConfig {
            window: Duration::from_millis(self.debounce_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
            require_content: true,
        }
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn task_file_path(&self) -> PathBuf {
        self.workspace_path.join(&self.task_file)
    }

    /// Fallback chat for messages whose producer named none.
    pub fn default_chat_id(&self) -> Option<i64> {
        self.authorized_chat_ids.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = RelayConfig::load_from(&tmp.path().join("nope.yml")).unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.debounce_ms, 500);
        assert_eq!(config.approval_timeout(), Duration::from_secs(300));
        assert!(config.artifact_extensions.contains(&"png".to_string()));
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yml");
        std::fs::write(
            &path,
            "debounce_ms: 250\nauthorized_chat_ids: [7, 9]\ntask_file: tasks.md\n",
        )
        .unwrap();

        let config = RelayConfig::load_from(&path).unwrap();
        assert_eq!(config.debounce_ms, 250);
        assert_eq!(config.authorized_chat_ids, vec![7, 9]);
        assert_eq!(config.default_chat_id(), Some(7));
        assert_eq!(config.task_file, "tasks.md");
        assert_eq!(config.cooldown_ms, 1000);
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yml");
        std::fs::write(&path, "debounce_ms: [not a number").unwrap();
        assert!(matches!(
            RelayConfig::load_from(&path),
            Err(RelayError::ConfigParse { .. })
        ));
    }

    #[test]
    fn overrides_replace_file_values() {
        let env: HashMap<&str, &str> = [
            ("ARTIFACTS_PATH", "~/shots"),
            ("AUTHORIZED_CHAT_IDS", "11, 22,,oops"),
            ("RELAY_TASK_FILE", "todo.md"),
            ("RELAY_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = RelayConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        config.expand_paths(Path::new("/home/dev"));

        assert_eq!(config.artifacts_path, PathBuf::from("/home/dev/shots"));
        assert_eq!(config.authorized_chat_ids, vec![11, 22]);
        assert_eq!(config.task_file, "todo.md");
        assert_eq!(config.tracing_level().unwrap(), tracing::Level::DEBUG);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = RelayConfig::default();
        assert!(config.validate().is_ok());

        config.debounce_ms = 5;
        assert!(matches!(
            config.validate(),
            Err(RelayError::InvalidConfig { .. })
        ));

        config.debounce_ms = 500;
        config.artifact_extensions.clear();
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.task_file = "nested/tasks.md".into();
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.log_level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("missing.yml");
        assert!(RelayConfig::load(Some(&missing), tmp.path()).is_err());
    }
}
