//! Error types for model parsing and validation.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while parsing or validating model values.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Invalid rule polygon: {0}")]
    InvalidPolygon(String),

    #[error("Invalid camera URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid camera id: {0}")]
    InvalidCameraId(String),

    #[error("Unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}

impl ModelError {
    /// Create an invalid polygon error.
    pub fn invalid_polygon(message: impl Into<String>) -> Self {
        Self::InvalidPolygon(message.into())
    }

    /// Create an unknown enum variant error.
    pub fn unknown_variant(kind: &'static str, value: impl Into<String>) -> Self {
        Self::UnknownVariant {
            kind,
            value: value.into(),
        }
    }
}
