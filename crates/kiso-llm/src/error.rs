use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("No model configured for role '{role}' and no default entry")]
    ProviderNotFound { role: String },

    #[error("Model '{model}' is not listed by any configured provider")]
    ModelNotSupported { model: String },

    #[error("API key env var '{var}' is not set for provider '{provider}'")]
    MissingApiKey { provider: String, var: String },

    #[error("Response failed schema validation: {0}")]
    Schema(String),

    #[error("Provider API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Rate limited; retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse provider response: {0}")]
    Parse(String),

    #[error("LLM call budget exhausted ({used}/{max} calls)")]
    BudgetExceeded { used: u32, max: u32 },
}

pub type Result<T> = std::result::Result<T, LlmError>;
