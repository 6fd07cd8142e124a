use std::path::PathBuf;

use thiserror::Error;

/// Error type for training, calibration and inference.
#[derive(Debug, Error)]
pub enum AffectError {
    /// Missing or invalid configuration, bad paths. Raised before any computation.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed batch, label-count mismatch, empty calibration input.
    #[error("Data error: {0}")]
    Data(String),

    /// Inference requested before a model snapshot is loaded.
    #[error("Model not ready: {0}")]
    ModelNotReady(String),

    /// A prediction or snapshot load failed after it started (e.g. the worker panicked).
    #[error("Inference error: {0}")]
    Inference(String),

    /// Non-finite loss, gradient or fitted parameter.
    #[error("Numerical error: {0}")]
    Numerical(String),

    /// A persisted artifact is missing, partial or inconsistent with the label manifest.
    #[error("Artifact error at '{}': {}", .path.display(), .message)]
    Artifact { path: PathBuf, message: String },

    /// Tokenizer load or encode failure.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// JSON/YAML (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Tensor backend failure.
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AffectError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AffectError::ModelNotReady(_))
    }

    pub(crate) fn artifact(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        AffectError::Artifact {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for AffectError {
    fn from(err: serde_json::Error) -> Self {
        AffectError::Serialization(format!("JSON: {}", err))
    }
}

impl From<serde_yaml_ng::Error> for AffectError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        AffectError::Configuration(format!("YAML: {}", err))
    }
}

impl From<tokenizers::Error> for AffectError {
    fn from(err: tokenizers::Error) -> Self {
        AffectError::Tokenizer(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AffectError>;
