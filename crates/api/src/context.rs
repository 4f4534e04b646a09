//! Per-request context passed explicitly to operations

use tenantry_shared::{Principal, TenantId};

use crate::routing::ResolvedTenant;

/// Tenant resolved for the current request, if any
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantContext {
    tenant: Option<ResolvedTenant>,
}

impl TenantContext {
    pub fn new(tenant: Option<ResolvedTenant>) -> Self {
        Self { tenant }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn tenant(&self) -> Option<&ResolvedTenant> {
        self.tenant.as_ref()
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant.as_ref().map(|t| t.tenant_id)
    }
}

/// Who is calling, and for which tenant
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub principal: Principal,
    pub tenant: TenantContext,
}

impl RequestContext {
    pub fn new(principal: Principal, tenant: TenantContext) -> Self {
        Self { principal, tenant }
    }

    /// Tenant new rows are created under: the principal's own tenant, or for
    /// system admins the resolved request tenant
    pub fn acting_tenant(&self) -> Option<TenantId> {
        if self.principal.is_system_admin() {
            self.tenant.tenant_id().or(self.principal.tenant_id)
        } else {
            self.principal.tenant_id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Resolution;
    use tenantry_shared::{Role, UserId};

    fn resolved(id: TenantId) -> TenantContext {
        TenantContext::new(Some(ResolvedTenant {
            tenant_id: id,
            name: "Acme".into(),
            slug: "acme".into(),
            resolution: Resolution::Header,
        }))
    }

    #[test]
    fn test_member_acts_for_own_tenant() {
        let own = TenantId::new();
        let other = TenantId::new();
        let ctx = RequestContext::new(
            Principal::authenticated(UserId::new(), Role::TenantAdmin, Some(own)),
            resolved(other),
        );
        assert_eq!(ctx.acting_tenant(), Some(own));
    }

    #[test]
    fn test_admin_acts_for_resolved_tenant() {
        let resolved_id = TenantId::new();
        let ctx = RequestContext::new(Principal::system_admin(UserId::new()), resolved(resolved_id));
        assert_eq!(ctx.acting_tenant(), Some(resolved_id));

        let ctx = RequestContext::new(Principal::system_admin(UserId::new()), TenantContext::none());
        assert_eq!(ctx.acting_tenant(), None);
    }
}
