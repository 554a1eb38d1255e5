use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),

    #[error("provider call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Rejected configuration. Raised before any conversation is admitted.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("concurrency ceiling must be at least 1")]
    ZeroConcurrency,

    #[error("api timeout must be non-zero")]
    ZeroTimeout,

    #[error(transparent)]
    Provider(#[from] LLMError),
}
