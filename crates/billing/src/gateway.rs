//! Payment gateway seam
//!
//! The engine only needs "charge this amount" with approved / declined /
//! failed outcomes. Provider protocols live behind `PaymentGateway`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use tenantry_shared::{InvoiceId, PaymentId, PaymentMethod, TenantId};

#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub payment_id: PaymentId,
    pub invoice_id: InvoiceId,
    pub tenant_id: TenantId,
    pub amount: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
    /// Forwarded to the provider so a retried call is not charged twice
    pub idempotency_key: String,
}

/// Definitive answer from the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Approved {
        transaction_id: Option<String>,
    },
    Declined {
        reason: String,
    },
}

/// No definitive answer: the call failed or did not complete in time
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("gateway did not respond within {0:?}")]
    Timeout(Duration),

    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, GatewayError>;
}

/// Call the gateway, giving up after `timeout`
pub async fn charge_with_timeout(
    gateway: &dyn PaymentGateway,
    request: &ChargeRequest,
    timeout: Duration,
) -> Result<ChargeOutcome, GatewayError> {
    match tokio::time::timeout(timeout, gateway.charge(request)).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(timeout)),
    }
}

/// How `SimulatedGateway` answers
#[derive(Debug, Clone)]
pub enum SimulatedBehavior {
    Approve,
    Decline(String),
    Fail(String),
    /// Never answers; exercises the timeout path
    Hang,
}

/// In-process gateway for local development and tests
#[derive(Debug)]
pub struct SimulatedGateway {
    behavior: SimulatedBehavior,
    calls: AtomicUsize,
}

impl SimulatedGateway {
    pub fn new(behavior: SimulatedBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn approving() -> Self {
        Self::new(SimulatedBehavior::Approve)
    }

    /// Number of charge attempts received
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            SimulatedBehavior::Approve => Ok(ChargeOutcome::Approved {
                transaction_id: Some(format!("sim_txn_{}", request.payment_id.0.simple())),
            }),
            SimulatedBehavior::Decline(reason) => Ok(ChargeOutcome::Declined {
                reason: reason.clone(),
            }),
            SimulatedBehavior::Fail(message) => Err(GatewayError::Unavailable(message.clone())),
            SimulatedBehavior::Hang => {
                std::future::pending::<()>().await;
                Err(GatewayError::Unavailable("unreachable".into()))
            }
        }
    }
}
