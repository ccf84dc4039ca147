//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Configuration source error: {0}")]
    SourceFailed(String),

    #[error("Configuration service rejected the request: {0}")]
    Rejected(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Stream error: {0}")]
    Stream(#[from] sai_stream::StreamError),

    #[error("Evaluation error: {0}")]
    Eval(#[from] sai_eval::EvalError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn source_failed(msg: impl Into<String>) -> Self {
        Self::SourceFailed(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    /// Whether a fresh token might make the request succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkerError::Rejected(_) | WorkerError::AuthFailed(_) | WorkerError::Http(_)
        )
    }
}
