//! Common types used across Tenantry

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
        )]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(
    /// Tenant ID wrapper
    TenantId
);
id_type!(
    /// User ID wrapper
    UserId
);
id_type!(
    /// Domain ID wrapper
    DomainId
);
id_type!(
    /// Invitation ID wrapper
    InvitationId
);
id_type!(
    /// Plan ID wrapper
    PlanId
);
id_type!(
    /// Subscription ID wrapper
    SubscriptionId
);
id_type!(
    /// Plan change audit record ID wrapper
    PlanChangeId
);
id_type!(
    /// Invoice ID wrapper
    InvoiceId
);
id_type!(
    /// Invoice line item ID wrapper
    InvoiceItemId
);
id_type!(
    /// Payment attempt ID wrapper
    PaymentId
);

// =============================================================================
// Enums
// =============================================================================

/// Role of a principal. `Admin` is the system administrator and is not tied
/// to any tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    TenantAdmin,
    User,
}

impl Default for Role {
    fn default() -> Self {
        Self::User
    }
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::TenantAdmin => "tenant_admin",
            Self::User => "user",
        }
    }

    /// Check if this is the system administrator role
    pub fn is_system_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }

    /// Roles that can be handed out through a tenant invitation
    pub fn is_invitable(&self) -> bool {
        matches!(self, Self::TenantAdmin | Self::User)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "tenant_admin" => Ok(Self::TenantAdmin),
            "user" => Ok(Self::User),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// Invitation status. Every transition starts from `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
    Expired,
}

impl Default for InvitationStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl InvitationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for InvitationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plan billing cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Quarterly,
    Yearly,
}

impl Default for BillingCycle {
    fn default() -> Self {
        Self::Monthly
    }
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Yearly => "yearly",
        }
    }

    /// Length of one billing period.
    /// Monthly (30 days) → Quarterly (90 days) → Yearly (365 days)
    pub fn period_length(&self) -> Duration {
        match self {
            Self::Monthly => Duration::days(30),
            Self::Quarterly => Duration::days(90),
            Self::Yearly => Duration::days(365),
        }
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BillingCycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            "yearly" => Ok(Self::Yearly),
            _ => Err(format!("Invalid billing cycle: {}", s)),
        }
    }
}

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Unpaid,
    Cancelled,
    Inactive,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Inactive
    }
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Unpaid => "unpaid",
            Self::Cancelled => "cancelled",
            Self::Inactive => "inactive",
        }
    }

    /// Statuses in which service is being delivered and a period is running
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Trial | Self::Active | Self::PastDue)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invoice status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Uncollectible,
    Void,
}

impl Default for InvoiceStatus {
    fn default() -> Self {
        Self::Draft
    }
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Open => "open",
            Self::Paid => "paid",
            Self::Uncollectible => "uncollectible",
            Self::Void => "void",
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment attempt status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
    Refunded,
}

impl Default for PaymentStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }

    /// A terminal payment is never settled again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Processing)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    BankTransfer,
    Paypal,
}

impl Default for PaymentMethod {
    fn default() -> Self {
        Self::Card
    }
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::BankTransfer => "bank_transfer",
            Self::Paypal => "paypal",
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Derive a URL-friendly slug from a display name: lower-cased, spaces
/// replaced by hyphens.
pub fn slugify(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "-")
}

/// Use the provided slug when it is non-blank, otherwise derive one from the name
pub fn slug_or_derive(slug: Option<&str>, name: &str) -> String {
    match slug.map(str::trim) {
        Some(s) if !s.is_empty() => s.to_lowercase(),
        _ => slugify(name),
    }
}

/// Round a monetary amount to 2 decimal places (fixed-point storage)
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp(2)
}

/// Current UTC time at the microsecond precision Postgres stores
pub fn utc_now() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now - Duration::nanoseconds(i64::from(now.nanosecond() % 1_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Acme"), "acme");
        assert_eq!(slugify("Acme Corp"), "acme-corp");
        assert_eq!(slugify("  Big Data Co  "), "big-data-co");
    }

    #[test]
    fn test_slug_or_derive() {
        assert_eq!(slug_or_derive(Some("custom"), "Acme Corp"), "custom");
        assert_eq!(slug_or_derive(Some("   "), "Acme Corp"), "acme-corp");
        assert_eq!(slug_or_derive(None, "Acme Corp"), "acme-corp");
        assert_eq!(slug_or_derive(Some("MiXeD"), "x"), "mixed");
    }

    #[test]
    fn test_billing_cycle_period_length() {
        assert_eq!(BillingCycle::Monthly.period_length(), Duration::days(30));
        assert_eq!(BillingCycle::Quarterly.period_length(), Duration::days(90));
        assert_eq!(BillingCycle::Yearly.period_length(), Duration::days(365));
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!(Role::from_str("admin").ok(), Some(Role::Admin));
        assert_eq!(Role::from_str("Tenant_Admin").ok(), Some(Role::TenantAdmin));
        assert_eq!(Role::from_str("user").ok(), Some(Role::User));
        assert!(Role::from_str("owner").is_err());
        assert!(!Role::Admin.is_invitable());
        assert!(Role::TenantAdmin.is_invitable());
    }

    #[test]
    fn test_payment_status_terminal() {
        assert!(!PaymentStatus::Pending.is_terminal());
        assert!(!PaymentStatus::Processing.is_terminal());
        assert!(PaymentStatus::Succeeded.is_terminal());
        assert!(PaymentStatus::Failed.is_terminal());
        assert!(PaymentStatus::Refunded.is_terminal());
    }

    #[test]
    fn test_status_strings_match_storage() {
        assert_eq!(SubscriptionStatus::PastDue.as_str(), "past_due");
        assert_eq!(PaymentMethod::BankTransfer.to_string(), "bank_transfer");
        assert_eq!(
            serde_json::to_string(&SubscriptionStatus::PastDue).ok(),
            Some("\"past_due\"".to_string())
        );
    }

    #[test]
    fn test_round_money() {
        assert_eq!(round_money(Decimal::new(29005, 3)), Decimal::new(2900, 2));
        assert_eq!(round_money(Decimal::new(10126, 3)), Decimal::new(1013, 2));
    }

    #[test]
    fn test_utc_now_has_microsecond_precision() {
        for _ in 0..100 {
            assert_eq!(utc_now().nanosecond() % 1_000, 0);
        }
    }
}
