use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("config parse error in {path}: {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },

    #[error("storage error: {reason}")]
    Storage { reason: String },

    #[error("watch error on {path}: {reason}")]
    Watch { path: PathBuf, reason: String },

    #[error("delivery failed: {reason}")]
    Delivery { reason: String },

    #[error("unknown request type: {value}")]
    UnknownRequestType { value: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
