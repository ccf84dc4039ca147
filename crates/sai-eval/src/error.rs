//! Evaluation error types.

use thiserror::Error;

pub type EvalResult<T> = Result<T, EvalError>;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("Invalid evaluation preferences: {0}")]
    InvalidPreferences(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Detector error: {0}")]
    Detector(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Detector task panicked: {0}")]
    DetectorPanicked(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl EvalError {
    pub fn invalid_preferences(msg: impl Into<String>) -> Self {
        Self::InvalidPreferences(msg.into())
    }

    pub fn model_not_found(path: impl Into<String>) -> Self {
        Self::ModelNotFound(path.into())
    }

    pub fn detector(msg: impl Into<String>) -> Self {
        Self::Detector(msg.into())
    }

    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }
}
