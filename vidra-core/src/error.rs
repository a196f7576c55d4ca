use thiserror::Error;
use vidra_model::WorkId;

/// Error taxonomy of the pipeline.
///
/// `Io` covers scan failures and transient provider failures (retried after a
/// cooldown); `Provider` covers permanent identification failures (logged, no
/// retry); `NotCached` is the cached-only query miss signal, deliberately
/// distinct from I/O errors.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Model error: {0}")]
    Model(#[from] vidra_model::ModelError),

    #[error("Provider failure: {0}")]
    Provider(String),

    #[error("No cached response for work {0}")]
    NotCached(WorkId),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Transient failures are retried after a cooldown; everything else is
    /// dropped for the current attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
