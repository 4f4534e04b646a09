//! In-memory host cache with TTL
//!
//! Caches host-to-tenant lookups (domain and subdomain rules) so routing does
//! not hit the store on every request. Negative results are cached too, so
//! the map is bounded: a full cache drops expired entries, then negative
//! ones, and otherwise skips the insert.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tenantry_shared::TenantId;

use super::ResolvedTenant;

/// Default cache TTL (5 minutes)
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Default upper bound on cached hosts
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Clone)]
struct CacheEntry {
    tenant: Option<ResolvedTenant>,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(tenant: Option<ResolvedTenant>, ttl: Duration) -> Self {
        Self {
            tenant,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }

    fn tenant_id(&self) -> Option<TenantId> {
        self.tenant.as_ref().map(|t| t.tenant_id)
    }
}

/// Thread-safe host cache
pub struct TenantCache {
    /// Normalized host -> resolution (None means the host names no tenant)
    cache: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for TenantCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TenantCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self::with_limits(ttl, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_limits(ttl: Duration, max_entries: usize) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Returns `Some(Some(_))` for a cached hit, `Some(None)` for a cached
    /// miss and `None` when the host is unknown or expired.
    pub fn get(&self, host: &str) -> Option<Option<ResolvedTenant>> {
        let cache = self.cache.read().ok()?;
        let entry = cache.get(host)?;

        if entry.is_expired() {
            None
        } else {
            Some(entry.tenant.clone())
        }
    }

    pub fn set(&self, host: &str, tenant: Option<ResolvedTenant>) {
        let Ok(mut cache) = self.cache.write() else {
            return;
        };

        if !cache.contains_key(host) && cache.len() >= self.max_entries {
            cache.retain(|_, entry| !entry.is_expired());
            if cache.len() >= self.max_entries {
                cache.retain(|_, entry| entry.tenant.is_some());
            }
            if cache.len() >= self.max_entries {
                tracing::debug!(host = %host, entries = cache.len(), "Host cache full; not caching");
                return;
            }
        }

        cache.insert(host.to_string(), CacheEntry::new(tenant, self.ttl));
    }

    pub fn invalidate_host(&self, host: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(host);
        }
    }

    /// Drop every positive entry for a tenant and all negative entries, which
    /// may now resolve after a directory write
    pub fn invalidate_tenant(&self, tenant_id: TenantId) {
        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|_, entry| matches!(entry.tenant_id(), Some(id) if id != tenant_id));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::routing::Resolution;
    use std::thread::sleep;

    fn resolved(slug: &str) -> ResolvedTenant {
        ResolvedTenant {
            tenant_id: TenantId::new(),
            name: slug.to_uppercase(),
            slug: slug.to_string(),
            resolution: Resolution::Subdomain,
        }
    }

    #[test]
    fn test_cache_get_set() {
        let cache = TenantCache::new();
        let acme = resolved("acme");

        assert!(cache.get("acme.example.com").is_none());

        cache.set("acme.example.com", Some(acme.clone()));
        assert_eq!(cache.get("acme.example.com"), Some(Some(acme)));
    }

    #[test]
    fn test_cache_negative() {
        let cache = TenantCache::new();
        cache.set("unknown.example.com", None);
        assert_eq!(cache.get("unknown.example.com"), Some(None));
    }

    #[test]
    fn test_cache_expiration() {
        let cache = TenantCache::with_ttl(Duration::from_millis(50));
        cache.set("acme.example.com", Some(resolved("acme")));
        assert!(cache.get("acme.example.com").is_some());

        sleep(Duration::from_millis(60));
        assert!(cache.get("acme.example.com").is_none());
    }

    #[test]
    fn test_invalidate_tenant() {
        let cache = TenantCache::new();
        let acme = resolved("acme");
        let globex = resolved("globex");

        cache.set("acme.example.com", Some(acme.clone()));
        cache.set("acme.io", Some(acme.clone()));
        cache.set("globex.example.com", Some(globex.clone()));
        cache.set("nobody.example.com", None);

        cache.invalidate_tenant(acme.tenant_id);

        assert!(cache.get("acme.example.com").is_none());
        assert!(cache.get("acme.io").is_none());
        assert!(cache.get("nobody.example.com").is_none());
        assert_eq!(cache.get("globex.example.com"), Some(Some(globex)));
    }

    #[test]
    fn test_full_cache_drops_expired_entries_on_insert() {
        let cache = TenantCache::with_limits(Duration::from_millis(1), 100);
        for i in 0..100 {
            cache.set(&format!("junk-{}.example.com", i), None);
        }
        assert_eq!(cache.len(), 100);

        sleep(Duration::from_millis(5));
        cache.set("acme.example.com", Some(resolved("acme")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_full_cache_never_grows_past_its_limit() {
        let cache = TenantCache::with_limits(DEFAULT_CACHE_TTL, 3);
        let acme = resolved("acme");
        cache.set("acme.example.com", Some(acme.clone()));
        cache.set("junk-1.example.com", None);
        cache.set("junk-2.example.com", None);

        // Negative entries make room for a new host
        cache.set("junk-3.example.com", None);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("acme.example.com"), Some(Some(acme)));

        let globex = resolved("globex");
        let initech = resolved("initech");
        cache.set("globex.example.com", Some(globex));
        cache.set("initech.example.com", Some(initech));
        cache.set("junk-4.example.com", None);
        assert!(cache.len() <= 3);

        // Re-setting a cached host is always allowed
        cache.set("acme.example.com", None);
        assert_eq!(cache.get("acme.example.com"), Some(None));
    }

    #[test]
    fn test_invalidate_host() {
        let cache = TenantCache::new();
        cache.set("acme.example.com", Some(resolved("acme")));
        cache.invalidate_host("acme.example.com");
        assert!(cache.get("acme.example.com").is_none());
    }
}
