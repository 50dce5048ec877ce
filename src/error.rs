use thiserror::Error;

/// Errors raised while converting models, vocabularies and corpora.
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Invalid vocabulary size: {0}")]
    InvalidVocabSize(String),

    #[error("Missing tensor in checkpoint: {0}")]
    MissingTensor(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Unsupported storage format: {0} (expected fp32 or fp16)")]
    UnsupportedFormat(String),

    #[error("Invalid tensor {name}: {reason}")]
    InvalidTensor { name: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConvertError>;
