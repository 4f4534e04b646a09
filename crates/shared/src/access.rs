//! Tenant-aware access control.
//!
//! `authorize` answers whether a principal may perform an operation on one
//! resource. `scope_query` answers which rows a principal may list. The two
//! are deliberately separate: reads are allowed at the permission layer and
//! narrowed at query time.

use serde::{Deserialize, Serialize};

use crate::error::{TenantryError, TenantryResult};
use crate::models::{
    BillingSettings, Domain, Invitation, Invoice, Payment, Subscription, Tenant, User,
};
use crate::types::{Role, TenantId, UserId};

/// Authenticated (or anonymous) caller, as supplied by the auth collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: Option<UserId>,
    pub role: Role,
    pub tenant_id: Option<TenantId>,
    pub is_authenticated: bool,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            role: Role::User,
            tenant_id: None,
            is_authenticated: false,
        }
    }

    pub fn authenticated(user_id: UserId, role: Role, tenant_id: Option<TenantId>) -> Self {
        Self {
            user_id: Some(user_id),
            role,
            tenant_id,
            is_authenticated: true,
        }
    }

    pub fn system_admin(user_id: UserId) -> Self {
        Self::authenticated(user_id, Role::Admin, None)
    }

    pub fn is_system_admin(&self) -> bool {
        self.is_authenticated && self.role.is_system_admin()
    }
}

impl From<&User> for Principal {
    fn from(user: &User) -> Self {
        Self {
            user_id: Some(user.id),
            role: user.role,
            tenant_id: user.tenant_id,
            is_authenticated: user.is_active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Self::Allow
    }
}

impl From<bool> for Decision {
    fn from(allowed: bool) -> Self {
        if allowed {
            Self::Allow
        } else {
            Self::Deny
        }
    }
}

/// Owning user of a resource, together with that user's tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerRef {
    pub user_id: UserId,
    pub tenant_id: Option<TenantId>,
}

/// Capability implemented by every resource subject to tenant isolation.
///
/// A resource exposes a direct tenant, an owning user, or both. Resources
/// exposing neither (the plan catalog) are writable by system admins only.
pub trait TenantScoped {
    fn tenant_id(&self) -> Option<TenantId>;

    fn owner(&self) -> Option<OwnerRef> {
        None
    }

    fn resource_kind(&self) -> &'static str {
        "resource"
    }

    /// Direct tenant, else the owning user's tenant
    fn effective_tenant(&self) -> Option<TenantId> {
        self.tenant_id()
            .or_else(|| self.owner().and_then(|owner| owner.tenant_id))
    }
}

/// Evaluate the access rules in order; the first match wins.
pub fn authorize<R>(principal: &Principal, resource: &R, operation: Operation) -> Decision
where
    R: TenantScoped + ?Sized,
{
    if !principal.is_authenticated {
        return Decision::Deny;
    }
    if operation == Operation::Read {
        return Decision::Allow;
    }
    if principal.role.is_system_admin() {
        return Decision::Allow;
    }

    if let Some(tenant_id) = resource.effective_tenant() {
        return Decision::from(principal.tenant_id == Some(tenant_id));
    }

    // Ownership fallback for resources that only carry a user reference
    match (resource.owner(), principal.user_id) {
        (Some(owner), Some(user_id)) => Decision::from(owner.user_id == user_id),
        _ => Decision::Deny,
    }
}

/// `authorize`, surfacing a deny as `PermissionDenied`
pub fn ensure_authorized<R>(
    principal: &Principal,
    resource: &R,
    operation: Operation,
) -> TenantryResult<()>
where
    R: TenantScoped + ?Sized,
{
    match authorize(principal, resource, operation) {
        Decision::Allow => Ok(()),
        Decision::Deny => {
            tracing::warn!(
                user_id = ?principal.user_id,
                role = %principal.role,
                principal_tenant = ?principal.tenant_id,
                resource = resource.resource_kind(),
                resource_tenant = ?resource.effective_tenant(),
                operation = %operation,
                "Access denied"
            );
            Err(TenantryError::PermissionDenied(format!(
                "{} access to {} denied",
                operation,
                resource.resource_kind()
            )))
        }
    }
}

// =============================================================================
// Query scoping
// =============================================================================

/// Row visibility for listing operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryScope {
    /// Every row (system admin)
    All,
    /// Rows of one tenant
    Tenant(TenantId),
    /// No rows at all
    Nothing,
}

/// Visibility for a principal's listing queries
pub fn scope_query(principal: &Principal) -> QueryScope {
    if !principal.is_authenticated {
        return QueryScope::Nothing;
    }
    if principal.role.is_system_admin() {
        return QueryScope::All;
    }
    match principal.tenant_id {
        Some(tenant_id) => QueryScope::Tenant(tenant_id),
        None => QueryScope::Nothing,
    }
}

impl QueryScope {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Nothing)
    }

    /// Parameter for a `($1::uuid IS NULL OR tenant_id = $1)` predicate.
    ///
    /// Returns `None` for `Nothing`: the caller must return an empty result
    /// without querying, never bind a NULL (which would mean "all tenants").
    pub fn sql_tenant_param(&self) -> Option<Option<TenantId>> {
        match self {
            Self::All => Some(None),
            Self::Tenant(tenant_id) => Some(Some(*tenant_id)),
            Self::Nothing => None,
        }
    }

    pub fn permits<R>(&self, resource: &R) -> bool
    where
        R: TenantScoped + ?Sized,
    {
        match self {
            Self::All => true,
            Self::Tenant(tenant_id) => resource.effective_tenant() == Some(*tenant_id),
            Self::Nothing => false,
        }
    }

    /// Filter an in-memory row set
    pub fn apply<R: TenantScoped>(&self, rows: Vec<R>) -> Vec<R> {
        match self {
            Self::All => rows,
            Self::Nothing => Vec::new(),
            Self::Tenant(_) => rows.into_iter().filter(|row| self.permits(row)).collect(),
        }
    }
}

// =============================================================================
// Resource impls
// =============================================================================

impl TenantScoped for Tenant {
    fn tenant_id(&self) -> Option<TenantId> {
        Some(self.id)
    }

    fn resource_kind(&self) -> &'static str {
        "tenant"
    }
}

impl TenantScoped for User {
    fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    fn owner(&self) -> Option<OwnerRef> {
        Some(OwnerRef {
            user_id: self.id,
            tenant_id: self.tenant_id,
        })
    }

    fn resource_kind(&self) -> &'static str {
        "user"
    }
}

macro_rules! tenant_owned {
    ($ty:ty, $kind:literal) => {
        impl TenantScoped for $ty {
            fn tenant_id(&self) -> Option<TenantId> {
                Some(self.tenant_id)
            }

            fn resource_kind(&self) -> &'static str {
                $kind
            }
        }
    };
}

tenant_owned!(Domain, "domain");
tenant_owned!(Invitation, "invitation");
tenant_owned!(Subscription, "subscription");
tenant_owned!(Invoice, "invoice");
tenant_owned!(Payment, "payment");
tenant_owned!(BillingSettings, "billing settings");

impl TenantScoped for crate::models::Plan {
    fn tenant_id(&self) -> Option<TenantId> {
        None
    }

    fn resource_kind(&self) -> &'static str {
        "plan"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Doc {
        tenant: Option<TenantId>,
        owner: Option<OwnerRef>,
    }

    impl TenantScoped for Doc {
        fn tenant_id(&self) -> Option<TenantId> {
            self.tenant
        }

        fn owner(&self) -> Option<OwnerRef> {
            self.owner
        }
    }

    fn tenant_doc(tenant: TenantId) -> Doc {
        Doc {
            tenant: Some(tenant),
            owner: None,
        }
    }

    #[test]
    fn test_unauthenticated_denied_everything() {
        let doc = tenant_doc(TenantId::new());
        let anon = Principal::anonymous();
        assert_eq!(authorize(&anon, &doc, Operation::Read), Decision::Deny);
        assert_eq!(authorize(&anon, &doc, Operation::Write), Decision::Deny);
        assert_eq!(scope_query(&anon), QueryScope::Nothing);
    }

    #[test]
    fn test_reads_allowed_for_any_authenticated_principal() {
        let doc = tenant_doc(TenantId::new());
        let outsider = Principal::authenticated(UserId::new(), Role::User, Some(TenantId::new()));
        assert_eq!(authorize(&outsider, &doc, Operation::Read), Decision::Allow);

        let tenantless = Principal::authenticated(UserId::new(), Role::User, None);
        assert_eq!(authorize(&tenantless, &doc, Operation::Read), Decision::Allow);
    }

    #[test]
    fn test_admin_writes_anything() {
        let admin = Principal::system_admin(UserId::new());
        let orphan = Doc {
            tenant: None,
            owner: None,
        };
        assert!(authorize(&admin, &orphan, Operation::Write).is_allowed());
        assert!(authorize(&admin, &tenant_doc(TenantId::new()), Operation::Write).is_allowed());
    }

    #[test]
    fn test_writes_limited_to_own_tenant() {
        let acme = TenantId::new();
        let globex = TenantId::new();

        for role in [Role::TenantAdmin, Role::User] {
            let p = Principal::authenticated(UserId::new(), role, Some(acme));
            assert!(authorize(&p, &tenant_doc(acme), Operation::Write).is_allowed());
            assert!(!authorize(&p, &tenant_doc(globex), Operation::Write).is_allowed());
        }

        let tenantless = Principal::authenticated(UserId::new(), Role::TenantAdmin, None);
        assert!(!authorize(&tenantless, &tenant_doc(acme), Operation::Write).is_allowed());
    }

    #[test]
    fn test_owner_tenant_used_when_resource_has_none() {
        let acme = TenantId::new();
        let doc = Doc {
            tenant: None,
            owner: Some(OwnerRef {
                user_id: UserId::new(),
                tenant_id: Some(acme),
            }),
        };
        let colleague = Principal::authenticated(UserId::new(), Role::User, Some(acme));
        assert!(authorize(&colleague, &doc, Operation::Write).is_allowed());

        let outsider = Principal::authenticated(UserId::new(), Role::User, Some(TenantId::new()));
        assert!(!authorize(&outsider, &doc, Operation::Write).is_allowed());
    }

    #[test]
    fn test_ownership_fallback() {
        let me = UserId::new();
        let doc = Doc {
            tenant: None,
            owner: Some(OwnerRef {
                user_id: me,
                tenant_id: None,
            }),
        };
        let owner = Principal::authenticated(me, Role::User, None);
        assert!(authorize(&owner, &doc, Operation::Write).is_allowed());

        let other = Principal::authenticated(UserId::new(), Role::User, None);
        assert!(!authorize(&other, &doc, Operation::Write).is_allowed());
    }

    #[test]
    fn test_unscoped_resource_writable_only_by_admin() {
        let doc = Doc {
            tenant: None,
            owner: None,
        };
        let p = Principal::authenticated(UserId::new(), Role::TenantAdmin, Some(TenantId::new()));
        assert!(!authorize(&p, &doc, Operation::Write).is_allowed());
    }

    #[test]
    fn test_ensure_authorized_surfaces_permission_denied() {
        let p = Principal::authenticated(UserId::new(), Role::User, Some(TenantId::new()));
        let err = ensure_authorized(&p, &tenant_doc(TenantId::new()), Operation::Write).unwrap_err();
        assert!(matches!(err, TenantryError::PermissionDenied(_)));
    }

    #[test]
    fn test_scope_query_by_role() {
        let acme = TenantId::new();
        assert_eq!(
            scope_query(&Principal::system_admin(UserId::new())),
            QueryScope::All
        );
        assert_eq!(
            scope_query(&Principal::authenticated(UserId::new(), Role::User, Some(acme))),
            QueryScope::Tenant(acme)
        );
        assert_eq!(
            scope_query(&Principal::authenticated(UserId::new(), Role::TenantAdmin, None)),
            QueryScope::Nothing
        );
    }

    #[test]
    fn test_scope_never_leaks_other_tenants() {
        let tenants: Vec<TenantId> = (0..4).map(|_| TenantId::new()).collect();
        let rows: Vec<Doc> = tenants
            .iter()
            .cycle()
            .take(20)
            .map(|t| tenant_doc(*t))
            .chain(std::iter::once(Doc {
                tenant: None,
                owner: None,
            }))
            .collect();

        for tenant in &tenants {
            let p = Principal::authenticated(UserId::new(), Role::User, Some(*tenant));
            let visible = scope_query(&p).apply(rows.clone());
            assert_eq!(visible.len(), 5);
            assert!(visible.iter().all(|d| d.tenant == Some(*tenant)));
        }

        let tenantless = Principal::authenticated(UserId::new(), Role::User, None);
        assert!(scope_query(&tenantless).apply(rows.clone()).is_empty());

        let admin = Principal::system_admin(UserId::new());
        assert_eq!(scope_query(&admin).apply(rows.clone()).len(), rows.len());
    }

    #[test]
    fn test_sql_tenant_param() {
        let acme = TenantId::new();
        assert_eq!(QueryScope::All.sql_tenant_param(), Some(None));
        assert_eq!(QueryScope::Tenant(acme).sql_tenant_param(), Some(Some(acme)));
        assert_eq!(QueryScope::Nothing.sql_tenant_param(), None);
    }
}
