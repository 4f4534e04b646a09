//! Tenant context middleware

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::Response,
};

use super::TenantResolver;
use crate::context::TenantContext;
use crate::error::ApiError;

pub const TENANT_ID_HEADER: &str = "X-Tenant-ID";
pub const TENANT_NAME_HEADER: &str = "X-Tenant-Name";

/// Resolve the tenant, expose it to handlers as a `TenantContext` extension
/// and echo it in the response headers.
pub async fn tenant_context(
    State(resolver): State<TenantResolver>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.to_string()));
    let tenant_header = req
        .headers()
        .get(resolver.tenant_header())
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let path = req.uri().path().to_string();

    let resolved = resolver
        .resolve(host.as_deref(), tenant_header.as_deref(), &path)
        .await?;

    if let Some(tenant) = &resolved {
        tracing::debug!(
            tenant_id = %tenant.tenant_id,
            resolution = ?tenant.resolution,
            path = %path,
            "Tenant resolved"
        );
    }

    let context = TenantContext::new(resolved);
    req.extensions_mut().insert(context.clone());

    let mut response = next.run(req).await;

    if let Some(tenant) = context.tenant() {
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&tenant.tenant_id.to_string()) {
            headers.insert(TENANT_ID_HEADER, value);
        }
        // Names that are not valid header values are left out
        if let Ok(value) = HeaderValue::from_str(&tenant.name) {
            headers.insert(TENANT_NAME_HEADER, value);
        }
    }

    Ok(response)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::routing::{ResolverConfig, TenantLookup};
    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        routing::get,
        Extension, Router,
    };
    use std::sync::Arc;
    use tenantry_shared::{Tenant, TenantId, TenantryError, TenantryResult};
    use tower::ServiceExt;

    struct OneTenant {
        tenant: Tenant,
        fail: bool,
    }

    #[async_trait]
    impl TenantLookup for OneTenant {
        async fn active_tenant_by_domain(&self, host: &str) -> TenantryResult<Option<Tenant>> {
            if self.fail {
                return Err(TenantryError::Database("down".into()));
            }
            Ok((host == "acme.example.com").then(|| self.tenant.clone()))
        }

        async fn active_tenant_by_slug(&self, slug: &str) -> TenantryResult<Option<Tenant>> {
            Ok((slug == self.tenant.slug).then(|| self.tenant.clone()))
        }

        async fn active_tenant_by_id(&self, id: TenantId) -> TenantryResult<Option<Tenant>> {
            Ok((id == self.tenant.id).then(|| self.tenant.clone()))
        }
    }

    fn acme() -> Tenant {
        let now = time::OffsetDateTime::now_utc();
        Tenant {
            id: TenantId::new(),
            name: "Acme".into(),
            slug: "acme".into(),
            description: None,
            is_active: true,
            contact_email: None,
            contact_phone: None,
            address: None,
            city: None,
            state: None,
            country: None,
            postal_code: None,
            settings: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    async fn echo(Extension(ctx): Extension<TenantContext>) -> String {
        ctx.tenant_id().map(|id| id.to_string()).unwrap_or_default()
    }

    fn app(tenant: Tenant, fail: bool) -> Router {
        let resolver = TenantResolver::new(
            Arc::new(OneTenant { tenant, fail }),
            ResolverConfig::default(),
        );
        Router::new()
            .route("/", get(echo))
            .route("/health/", get(echo))
            .layer(axum::middleware::from_fn_with_state(resolver, tenant_context))
    }

    #[tokio::test]
    async fn test_resolved_tenant_headers() {
        let tenant = acme();
        let id = tenant.id.to_string();

        let response = app(tenant, false)
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("Host", "acme.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(TENANT_ID_HEADER).unwrap(), id.as_str());
        assert_eq!(response.headers().get(TENANT_NAME_HEADER).unwrap(), "Acme");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, id.as_bytes());
    }

    #[tokio::test]
    async fn test_header_resolution() {
        let tenant = acme();
        let id = tenant.id.to_string();

        let response = app(tenant, false)
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("Host", "localhost")
                    .header("X-Tenant", &id)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers().get(TENANT_ID_HEADER).unwrap(), id.as_str());
    }

    #[tokio::test]
    async fn test_no_tenant_no_headers() {
        let response = app(acme(), false)
            .oneshot(
                Request::builder()
                    .uri("/health/")
                    .header("Host", "acme.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(TENANT_ID_HEADER).is_none());
        assert!(response.headers().get(TENANT_NAME_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_store_failure_is_server_error() {
        let response = app(acme(), true)
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("Host", "acme.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
