//! Error types for Tenantry

use thiserror::Error;

/// Errors raised by the directory and access-control layers
#[derive(Debug, Error)]
pub enum TenantryError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Validation error on {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TenantryError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for TenantryError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => TenantryError::NotFound("Resource not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
                TenantryError::Conflict(format!("Unique constraint violated: {}", db_err.message()))
            }
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23503") => {
                TenantryError::Conflict(format!("Still referenced: {}", db_err.message()))
            }
            _ => TenantryError::Database(err.to_string()),
        }
    }
}

impl From<LifecycleError> for TenantryError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::InvalidTransition { .. } => TenantryError::Conflict(err.to_string()),
            LifecycleError::Invalid { field, message } => TenantryError::Validation { field, message },
        }
    }
}

pub type TenantryResult<T> = Result<T, TenantryError>;

/// Error from an in-memory state-machine transition on a model.
///
/// Persisting services map `InvalidTransition` to a conflict and `Invalid`
/// to a validation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("cannot {action} from status '{from}'")]
    InvalidTransition { action: &'static str, from: String },

    #[error("invalid {field}: {message}")]
    Invalid { field: String, message: String },
}

impl LifecycleError {
    pub fn transition(action: &'static str, from: impl std::fmt::Display) -> Self {
        Self::InvalidTransition {
            action,
            from: from.to_string(),
        }
    }

    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}
