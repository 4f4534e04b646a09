//! Tenantry Billing
//!
//! Plan catalog, subscription lifecycle, invoicing, payments and billing
//! analytics on top of PostgreSQL.

pub mod analytics;
pub mod config;
pub mod email;
pub mod error;
pub mod gateway;
pub mod invoices;
pub mod payments;
pub mod plans;
pub mod settings;
pub mod subscriptions;

pub use analytics::{BillingAnalytics, BillingHistoryEntry, BillingReports};
pub use config::BillingConfig;
pub use email::{EmailConfig, ResendNotifier};
pub use error::{BillingError, BillingResult};
pub use gateway::{
    ChargeOutcome, ChargeRequest, GatewayError, PaymentGateway, SimulatedBehavior,
    SimulatedGateway,
};
pub use invoices::{InvoiceService, InvoiceWithItems, NewInvoice, NewInvoiceItem};
pub use payments::{PaymentReceipt, PaymentRequest, PaymentService, StalePayments};
pub use plans::{NewPlan, PlanCatalog};
pub use settings::{BillingSettingsService, BillingSettingsUpdate};
pub use subscriptions::{PlanChangeRequest, SubscriptionService};
