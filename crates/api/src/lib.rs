//! Tenantry API Library
//!
//! Tenant directory, request routing by host or header, invitations and the
//! authorized operation layer over the billing services.

pub mod accounts;
pub mod config;
pub mod context;
pub mod directory;
pub mod error;
pub mod invitations;
pub mod operations;
pub mod routing;
pub mod state;

pub use accounts::{AccountService, NewUser};
pub use config::Config;
pub use context::{RequestContext, TenantContext};
pub use directory::{NewTenant, PgTenantDirectory};
pub use error::{ApiError, ApiResult};
pub use invitations::{generate_invitation_token, validate_invitation_token, InvitationService};
pub use routing::{tenant_context, ResolvedTenant, TenantCache, TenantResolver};
pub use state::AppState;
