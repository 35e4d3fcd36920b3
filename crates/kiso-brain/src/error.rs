use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrainError {
    #[error("Planning failed: {0}")]
    Plan(String),

    #[error("Review failed: {0}")]
    Review(String),

    #[error("Role output invalid after retries: {0}")]
    Validation(String),

    #[error(transparent)]
    Llm(#[from] kiso_llm::LlmError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BrainError>;
