use thiserror::Error;

#[derive(Debug, Error)]
pub enum KisoError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("Invalid username: {0}")]
    InvalidUsername(String),

    #[error("Skill manifest error ({skill}): {reason}")]
    SkillManifest { skill: String, reason: String },

    #[error("Skill args rejected: {0}")]
    SkillArgs(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KisoError>;
