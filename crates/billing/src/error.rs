//! Billing error types

use tenantry_shared::LifecycleError;
use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Payment gateway failure or timeout. Safe to retry.
    #[error("Payment gateway error: {0}")]
    Upstream(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether the caller may retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => BillingError::NotFound("Resource not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
                BillingError::Conflict(format!("Unique constraint violated: {}", db_err.message()))
            }
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23503") => {
                BillingError::Conflict(format!("Still referenced: {}", db_err.message()))
            }
            _ => BillingError::Database(err.to_string()),
        }
    }
}

impl From<LifecycleError> for BillingError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::InvalidTransition { .. } => BillingError::Conflict(err.to_string()),
            LifecycleError::Invalid { field, message } => BillingError::Validation { field, message },
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
