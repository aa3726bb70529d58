pub mod relay;

pub use relay::*;

use std::path::{Path, PathBuf};

/// Name of the per-project config directory.
pub const PROJECT_DIR: &str = ".agent-relay";

/// Returns the global config directory path: `~/.config/agent-relay/`
pub fn dirs_global() -> PathBuf {
    home_dir().join(".config").join("agent-relay")
}

pub fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// Expand a leading `~` against `home`.
pub fn expand_tilde(path: &Path, home: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}
