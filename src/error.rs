//! Error types for the query-understanding pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {

    // =============================
    // Internal API Errors
    // =============================

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Slot filling error: {0}")]
    SlotFillingError(String),

    // =============================
    // External Collaborator Errors
    // =============================

    #[error("Embedding error: {0}")]
    EmbeddingError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Handler error: {0}")]
    HandlerError(String),

    #[error("Handler not found: {0}")]
    HandlerNotFound(String),

    #[error("Analytics error: {0}")]
    AnalyticsError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PipelineError {
    /// Failures of a collaborator outside the process (model, store, handler).
    /// Each call site owns a fallback for these; they never reach the end user.
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            PipelineError::EmbeddingError(_)
                | PipelineError::LlmError(_)
                | PipelineError::DatabaseError(_)
                | PipelineError::HandlerError(_)
                | PipelineError::HandlerNotFound(_)
                | PipelineError::HttpError(_)
                | PipelineError::IoError(_)
        )
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::DatabaseError(e.to_string())
    }
}
