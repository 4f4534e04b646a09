//! Tenantry Shared Types and Utilities
//!
//! Domain model, ids, error kinds, access rules and database helpers shared
//! by the directory, billing and worker crates.

pub mod access;
pub mod db;
pub mod error;
pub mod models;
pub mod notify;
pub mod types;

pub use access::{
    authorize, ensure_authorized, scope_query, Decision, Operation, OwnerRef, Principal,
    QueryScope, TenantScoped,
};
pub use db::*;
pub use error::*;
pub use models::*;
pub use notify::{dispatch, LogNotifier, Notification, Notifier, NotifyError};
pub use types::*;
