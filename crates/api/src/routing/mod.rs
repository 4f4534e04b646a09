//! Tenant routing
//!
//! Resolves incoming requests to tenants by custom domain, subdomain slug or
//! tenant id header, and attaches the result to the request.

mod cache;
mod middleware;
mod resolver;

pub use cache::{TenantCache, DEFAULT_CACHE_TTL};
pub use middleware::{tenant_context, TENANT_ID_HEADER, TENANT_NAME_HEADER};
pub use resolver::{
    normalize_host, Resolution, ResolvedTenant, ResolverConfig, TenantLookup, TenantResolver,
};
