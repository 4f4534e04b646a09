//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use tenantry_billing::BillingError;
use tenantry_shared::TenantryError;

/// Error surfaced at the HTTP edge
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    PermissionDenied(String),
    #[error("{message}")]
    Validation { field: String, message: String },
    #[error("{0}")]
    Conflict(String),
    /// A collaborator (payment gateway) failed; the request may be retried
    #[error("{0}")]
    Upstream(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ApiError::Validation { .. } => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::PermissionDenied(_) => "PERMISSION_DENIED",
            ApiError::Validation { .. } => "VALIDATION_ERROR",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::Upstream(_) => "UPSTREAM_ERROR",
            ApiError::Database(_) => "DATABASE_ERROR",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        // Never leak store or internal details to clients
        let body = match &self {
            ApiError::Validation { field, message } => json!({
                "error": { "code": code, "message": message, "field": field }
            }),
            ApiError::Database(detail) | ApiError::Internal(detail) => {
                tracing::error!(code, detail = %detail, "Request failed");
                json!({ "error": { "code": code, "message": "Internal server error" } })
            }
            other => json!({ "error": { "code": code, "message": other.to_string() } }),
        };

        (status, Json(body)).into_response()
    }
}

impl From<TenantryError> for ApiError {
    fn from(err: TenantryError) -> Self {
        match err {
            TenantryError::NotFound(msg) => ApiError::NotFound(msg),
            TenantryError::PermissionDenied(msg) => ApiError::PermissionDenied(msg),
            TenantryError::Validation { field, message } => ApiError::Validation { field, message },
            TenantryError::Conflict(msg) => ApiError::Conflict(msg),
            TenantryError::Database(msg) => ApiError::Database(msg),
            TenantryError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::Validation { field, message } => ApiError::Validation { field, message },
            BillingError::Conflict(msg) => ApiError::Conflict(msg),
            BillingError::Upstream(msg) => ApiError::Upstream(msg),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        TenantryError::from(err).into()
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_validation_carries_field() {
        let (status, body) =
            body_json(TenantryError::validation("plan_id", "plan is not active").into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"]["field"], "plan_id");
        assert_eq!(body["error"]["message"], "plan is not active");
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let cases: Vec<(ApiError, StatusCode)> = vec![
            (TenantryError::NotFound("Tenant".into()).into(), StatusCode::NOT_FOUND),
            (
                TenantryError::PermissionDenied("write".into()).into(),
                StatusCode::FORBIDDEN,
            ),
            (BillingError::Conflict("paid".into()).into(), StatusCode::CONFLICT),
            (BillingError::Upstream("timeout".into()).into(), StatusCode::BAD_GATEWAY),
        ];
        for (err, expected) in cases {
            let (status, body) = body_json(err).await;
            assert_eq!(status, expected);
            assert!(body["error"].get("field").is_none());
        }
    }

    #[tokio::test]
    async fn test_database_detail_is_hidden() {
        let (status, body) =
            body_json(ApiError::Database("relation \"tenants\" does not exist".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["message"], "Internal server error");
    }
}
