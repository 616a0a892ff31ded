//! Domain error types for the pipeline orchestrator.
//!
//! Uses thiserror for ergonomic error handling with automatic Display implementations.

/// Application-level errors.
///
/// Stage workers never let these reach the scheduler; they are materialized
/// into persistent state (`Job.error`, `Export.error`, `last_error` columns).
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// Resource not found
    #[error("{0} not found")]
    NotFound(String),

    /// Invalid input data
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Remote compute service call failed
    #[error("Remote task error: {0}")]
    RemoteTask(String),

    /// Object storage operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Git working copy or git host operation failed
    #[error("Git error: {0}")]
    Git(String),

    /// Report rendering or delivery failed
    #[error("Report error: {0}")]
    Report(String),
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

// Conversion implementations for common error types

impl From<sea_orm::DbErr> for AppError {
    fn from(err: sea_orm::DbErr) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("JSON parsing error: {}", err))
    }
}

impl From<git2::Error> for AppError {
    fn from(err: git2::Error) -> Self {
        AppError::Git(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::RemoteTask(err.to_string())
    }
}

impl From<tera::Error> for AppError {
    fn from(err: tera::Error) -> Self {
        AppError::Report(format!("template error: {}", err))
    }
}
