//! Stream error types.

use thiserror::Error;

pub type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Stream closed")]
    Closed,

    #[error("Invalid camera configuration: {0}")]
    InvalidConfig(String),

    #[error("Duplicate rule id: {0}")]
    DuplicateRule(String),

    #[error("Preferences error: {0}")]
    Preferences(String),

    #[error("Model error: {0}")]
    Model(#[from] sai_models::ModelError),
}

impl StreamError {
    pub fn connect_failed(msg: impl Into<String>) -> Self {
        Self::ConnectFailed(msg.into())
    }

    pub fn read_failed(msg: impl Into<String>) -> Self {
        Self::ReadFailed(msg.into())
    }

    pub fn decode_failed(msg: impl Into<String>) -> Self {
        Self::DecodeFailed(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn preferences(msg: impl Into<String>) -> Self {
        Self::Preferences(msg.into())
    }

    /// Whether the reader must be dropped and reconnected after this error.
    pub fn requires_reconnect(&self) -> bool {
        !matches!(self, StreamError::DecodeFailed(_))
    }
}
