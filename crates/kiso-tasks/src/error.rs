use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Store(#[from] kiso_store::StoreError),

    #[error(transparent)]
    Brain(#[from] kiso_brain::BrainError),

    #[error(transparent)]
    Llm(#[from] kiso_llm::LlmError),

    #[error("Subprocess error: {0}")]
    Subprocess(String),

    #[error("Timeout after {secs}s")]
    Timeout { secs: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TaskError>;
