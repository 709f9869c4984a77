//! Error types for the whiteboard core.
//!
//! Storage, remote and gate failures all funnel into [`BoardError`]. Remote
//! outcomes are decoded once into [`ApiError`](crate::api::ApiError) and
//! carried here unchanged.

use thiserror::Error;

use crate::api::ApiError;

/// Result type alias for whiteboard operations
pub type BoardResult<T> = Result<T, BoardError>;

/// Main error type for whiteboard operations
#[derive(Error, Debug)]
pub enum BoardError {
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database operation failed: {0}")]
    DatabaseOperation(String),

    #[error("Note not found: {0}")]
    NotFound(i64),

    #[error("Password is not correct")]
    WrongPassword,

    #[error("Authentication expired, please log in again")]
    AuthRequired,

    #[error("Whiteboard is locked")]
    Locked,

    #[error("Remote API error: {0}")]
    Api(ApiError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BoardError {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        BoardError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// True when the caller should re-prompt for the whiteboard password
    /// rather than offer a retry.
    pub fn is_wrong_password(&self) -> bool {
        matches!(
            self,
            BoardError::WrongPassword | BoardError::Api(ApiError::WrongPassword)
        )
    }

    /// True when the user has to log in again before anything can sync.
    pub fn is_auth_required(&self) -> bool {
        matches!(
            self,
            BoardError::AuthRequired | BoardError::Api(ApiError::AuthRequired)
        )
    }
}

impl From<ApiError> for BoardError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::WrongPassword => BoardError::WrongPassword,
            ApiError::AuthRequired => BoardError::AuthRequired,
            ApiError::Network(msg) => BoardError::Network(msg),
            other => BoardError::Api(other),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for BoardError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        BoardError::DatabaseOperation(format!("store lock poisoned: {}", err))
    }
}
