use thiserror::Error;

pub type TranslationResult<T> = Result<T, TranslationError>;

#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("invalid job input: {0}")]
    InvalidInput(String),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("translation engine failed: {0}")]
    Engine(String),

    #[error("artifact storage failed: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
