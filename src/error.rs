//! Error types for the orchestrator

use thiserror::Error;

/// Errors surfaced by a [`TaskRepository`](crate::store::TaskRepository) backend.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// The backing store could not be reached or refused the operation.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A persisted record could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("row not found".to_string()),
            // A duplicate key is a caller error, not an outage
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                RepositoryError::InvalidTransition(db.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                RepositoryError::Corrupt(err.to_string())
            }
            other => RepositoryError::Unavailable(other.to_string()),
        }
    }
}

/// Specialty lookup failures. Unknown ids are a hard violation, never a fallback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecialtyError {
    #[error("Specialty not found: {0}")]
    NotFound(String),
}

/// Failure reported by the delegated tool executor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Tool {tool} failed: {message}")]
pub struct ToolError {
    pub tool: String,
    pub message: String,
}

impl ToolError {
    pub fn new(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

/// Event publication failure. Always swallowed by the worker.
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Event publish failed: {0}")]
    Publish(String),
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl OrchestratorError {
    /// True when the failure came from the store being unreachable.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Repository(RepositoryError::Unavailable(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
