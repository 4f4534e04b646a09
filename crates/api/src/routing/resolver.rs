//! Request-to-tenant resolution
//!
//! Rules, in order:
//! - exempt path prefixes resolve to no tenant
//! - exact match on an active domain: acme.example.com -> Acme
//! - first host label as tenant slug: acme.tenantry.dev -> tenant "acme"
//! - tenant id header: `X-Tenant: <uuid>`

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use tenantry_shared::{Tenant, TenantId, TenantryResult};

use super::TenantCache;
use crate::config::{Config, DEFAULT_EXEMPT_PATHS, DEFAULT_RESERVED_SUBDOMAINS, DEFAULT_TENANT_HEADER};

/// Which rule matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Domain,
    Subdomain,
    Header,
}

/// Result of resolving a request to a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedTenant {
    pub tenant_id: TenantId,
    pub name: String,
    pub slug: String,
    pub resolution: Resolution,
}

impl ResolvedTenant {
    fn from_tenant(tenant: Tenant, resolution: Resolution) -> Self {
        Self {
            tenant_id: tenant.id,
            name: tenant.name,
            slug: tenant.slug,
            resolution,
        }
    }
}

/// Store lookups the resolver needs. Every method only returns active
/// tenants; domain lookups also require an active domain.
#[async_trait]
pub trait TenantLookup: Send + Sync {
    async fn active_tenant_by_domain(&self, host: &str) -> TenantryResult<Option<Tenant>>;
    async fn active_tenant_by_slug(&self, slug: &str) -> TenantryResult<Option<Tenant>>;
    async fn active_tenant_by_id(&self, id: TenantId) -> TenantryResult<Option<Tenant>>;
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub tenant_header: String,
    pub reserved_subdomains: Vec<String>,
    pub exempt_paths: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            tenant_header: DEFAULT_TENANT_HEADER.to_string(),
            reserved_subdomains: DEFAULT_RESERVED_SUBDOMAINS.iter().map(|s| s.to_string()).collect(),
            exempt_paths: DEFAULT_EXEMPT_PATHS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl From<&Config> for ResolverConfig {
    fn from(config: &Config) -> Self {
        Self {
            tenant_header: config.tenant_header.clone(),
            reserved_subdomains: config.reserved_subdomains.clone(),
            exempt_paths: config.exempt_paths.clone(),
        }
    }
}

/// Tenant resolver with host caching
#[derive(Clone)]
pub struct TenantResolver {
    lookup: Arc<dyn TenantLookup>,
    cache: Arc<TenantCache>,
    config: ResolverConfig,
}

impl TenantResolver {
    pub fn new(lookup: Arc<dyn TenantLookup>, config: ResolverConfig) -> Self {
        Self::with_cache(lookup, config, Arc::new(TenantCache::new()))
    }

    pub fn with_cache(
        lookup: Arc<dyn TenantLookup>,
        config: ResolverConfig,
        cache: Arc<TenantCache>,
    ) -> Self {
        Self {
            lookup,
            cache,
            config,
        }
    }

    /// Name of the header carrying a tenant id
    pub fn tenant_header(&self) -> &str {
        &self.config.tenant_header
    }

    /// Resolve a request to a tenant.
    ///
    /// Unknown hosts, reserved subdomains and malformed or unknown header
    /// values all yield `Ok(None)`. Only store failures are errors.
    pub async fn resolve(
        &self,
        host: Option<&str>,
        header_value: Option<&str>,
        path: &str,
    ) -> TenantryResult<Option<ResolvedTenant>> {
        if self.is_exempt(path) {
            return Ok(None);
        }

        if let Some(host) = host.map(normalize_host).filter(|h| !h.is_empty()) {
            if let Some(resolved) = self.resolve_host(&host).await? {
                return Ok(Some(resolved));
            }
        }

        self.resolve_header(header_value).await
    }

    fn is_exempt(&self, path: &str) -> bool {
        self.config
            .exempt_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Domain rule, then subdomain rule; cached per host
    async fn resolve_host(&self, host: &str) -> TenantryResult<Option<ResolvedTenant>> {
        if let Some(cached) = self.cache.get(host) {
            return Ok(cached);
        }

        let resolved = match self.lookup.active_tenant_by_domain(host).await? {
            Some(tenant) => Some(ResolvedTenant::from_tenant(tenant, Resolution::Domain)),
            None => match self.subdomain_label(host) {
                Some(label) => self
                    .lookup
                    .active_tenant_by_slug(label)
                    .await?
                    .map(|tenant| ResolvedTenant::from_tenant(tenant, Resolution::Subdomain)),
                None => None,
            },
        };

        self.cache.set(host, resolved.clone());
        Ok(resolved)
    }

    /// First label of a dotted host, unless reserved
    fn subdomain_label<'a>(&self, host: &'a str) -> Option<&'a str> {
        let (label, _) = host.split_once('.')?;
        if label.is_empty() || self.config.reserved_subdomains.iter().any(|r| r == label) {
            return None;
        }
        Some(label)
    }

    async fn resolve_header(&self, value: Option<&str>) -> TenantryResult<Option<ResolvedTenant>> {
        let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        let Ok(id) = Uuid::parse_str(raw) else {
            tracing::debug!(header = %self.config.tenant_header, "Ignoring malformed tenant header");
            return Ok(None);
        };

        Ok(self
            .lookup
            .active_tenant_by_id(TenantId(id))
            .await?
            .map(|tenant| ResolvedTenant::from_tenant(tenant, Resolution::Header)))
    }

    pub fn invalidate_host(&self, host: &str) {
        self.cache.invalidate_host(&normalize_host(host));
    }

    pub fn invalidate_tenant(&self, tenant_id: TenantId) {
        self.cache.invalidate_tenant(tenant_id);
    }

    pub fn cache(&self) -> &TenantCache {
        &self.cache
    }
}

/// Strip the port and lower-case
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host.split(':').next().unwrap_or(host);
    host.trim_end_matches('.').to_lowercase()
}
