//! Payment processing
//!
//! A payment attempt runs in three steps:
//! 1. Lock the invoice and record a `pending` attempt (committed).
//! 2. Mark it `processing` and call the gateway outside any transaction,
//!    bounded by the configured timeout.
//! 3. Settle: lock invoice and payment, apply the outcome, and on success
//!    move the invoice `open → paid`.
//!
//! An attempt that breaks off after step 1 is failed on the spot, or later
//! by the `StalePayments` sweep, so it never blocks the invoice for good.
//!
//! Attempts carrying an external payment id are idempotent: a replay returns
//! the stored attempt without calling the gateway again. Settlement never
//! touches a terminal payment, so the invoice is paid at most once.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;

use tenantry_shared::{
    dispatch, is_unique_violation, utc_now, Invoice, InvoiceId, InvoiceStatus, Notification,
    Notifier, Payment, PaymentId, PaymentMethod, PaymentStatus, QueryScope,
};

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{charge_with_timeout, ChargeOutcome, ChargeRequest, GatewayError, PaymentGateway};
use crate::invoices::{lock_invoice, update_invoice_status};

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentRequest {
    pub invoice_id: InvoiceId,
    /// Defaults to the invoice total
    pub amount: Option<Decimal>,
    pub method: PaymentMethod,
    /// Provider-side id used as the idempotency key
    pub external_payment_id: Option<String>,
}

/// Result of a payment attempt
#[derive(Debug, Clone, Serialize)]
pub struct PaymentReceipt {
    pub payment: Payment,
    pub invoice: Invoice,
    /// This call moved the invoice to `paid`
    pub invoice_paid: bool,
    /// The attempt already existed and was returned unchanged
    pub replayed: bool,
}

impl PaymentReceipt {
    pub fn succeeded(&self) -> bool {
        self.payment.status == PaymentStatus::Succeeded
    }
}

/// Gateway answer applied during settlement
#[derive(Debug, Clone)]
pub enum Settlement {
    Outcome(ChargeOutcome),
    Error(String),
}

#[derive(Clone)]
pub struct PaymentService {
    pool: PgPool,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    config: BillingConfig,
}

impl PaymentService {
    pub fn new(
        pool: PgPool,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        config: BillingConfig,
    ) -> Self {
        Self {
            pool,
            gateway,
            notifier,
            config,
        }
    }

    /// Charge an open invoice.
    ///
    /// A declined charge is returned as a receipt with a `failed` payment. A
    /// gateway error or timeout also records a `failed` payment but returns
    /// `BillingError::Upstream`.
    pub async fn process_payment(&self, request: PaymentRequest) -> BillingResult<PaymentReceipt> {
        if let Some(external_id) = request.external_payment_id.as_deref() {
            if external_id.trim().is_empty() {
                return Err(BillingError::validation(
                    "external_payment_id",
                    "external payment id cannot be blank",
                ));
            }
            if let Some(receipt) = self.replay(external_id).await? {
                return ensure_same_invoice(receipt, request.invoice_id);
            }
        }

        let payment = match self.record_attempt(&request).await {
            Ok(payment) => payment,
            Err(AttemptError::DuplicateExternalId(external_id)) => {
                // Lost a race with a concurrent call carrying the same id
                let receipt = self
                    .replay(&external_id)
                    .await?
                    .ok_or_else(|| BillingError::Internal("replayed payment vanished".into()))?;
                return ensure_same_invoice(receipt, request.invoice_id);
            }
            Err(AttemptError::Billing(e)) => return Err(e),
        };

        match self.charge_and_settle(&payment).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                self.abandon(payment.id, &e).await;
                Err(e)
            }
        }
    }

    async fn charge_and_settle(&self, payment: &Payment) -> BillingResult<PaymentReceipt> {
        sqlx::query(
            "UPDATE payments SET status = 'processing', updated_at = $2 WHERE id = $1 AND status = 'pending'",
        )
        .bind(payment.id)
        .bind(utc_now())
        .execute(&self.pool)
        .await?;

        let charge = ChargeRequest {
            payment_id: payment.id,
            invoice_id: payment.invoice_id,
            tenant_id: payment.tenant_id,
            amount: payment.amount,
            currency: payment.currency.clone(),
            method: payment.payment_method,
            idempotency_key: payment
                .external_payment_id
                .clone()
                .unwrap_or_else(|| payment.id.to_string()),
        };

        let result = charge_with_timeout(self.gateway.as_ref(), &charge, self.config.gateway_timeout).await;

        match result {
            Ok(outcome) => self.settle(payment.id, Settlement::Outcome(outcome)).await,
            Err(gateway_error) => {
                tracing::error!(
                    payment_id = %payment.id,
                    invoice_id = %payment.invoice_id,
                    tenant_id = %payment.tenant_id,
                    error = %gateway_error,
                    "Payment gateway call failed"
                );
                self.settle(payment.id, Settlement::Error(gateway_error.to_string()))
                    .await?;
                Err(upstream(gateway_error))
            }
        }
    }

    /// Best-effort failure of an attempt whose processing broke off. A
    /// payment that is already terminal is left alone; one this cannot reach
    /// is picked up by `StalePayments`.
    async fn abandon(&self, payment_id: PaymentId, cause: &BillingError) {
        if let Err(e) = self
            .settle(payment_id, Settlement::Error(cause.to_string()))
            .await
        {
            tracing::error!(
                payment_id = %payment_id,
                cause = %cause,
                error = %e,
                "Could not fail abandoned payment attempt"
            );
        }
    }

    /// Apply an asynchronous gateway result (e.g. a provider callback) keyed
    /// by external payment id. Re-applying a result is a no-op.
    pub async fn apply_gateway_result(
        &self,
        external_payment_id: &str,
        outcome: ChargeOutcome,
    ) -> BillingResult<PaymentReceipt> {
        let payment = self
            .find_by_external_id(external_payment_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Payment {}", external_payment_id)))?;
        self.settle(payment.id, Settlement::Outcome(outcome)).await
    }

    pub async fn get(&self, id: PaymentId) -> BillingResult<Payment> {
        sqlx::query_as("SELECT * FROM payments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Payment {}", id)))
    }

    /// Every attempt against an invoice, oldest first
    pub async fn list_for_invoice(&self, invoice_id: InvoiceId) -> BillingResult<Vec<Payment>> {
        let payments = sqlx::query_as(
            "SELECT * FROM payments WHERE invoice_id = $1 ORDER BY created_at ASC",
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    /// Payments visible under `scope`, newest first
    pub async fn list(&self, scope: QueryScope) -> BillingResult<Vec<Payment>> {
        let Some(tenant_id) = scope.sql_tenant_param() else {
            return Ok(Vec::new());
        };

        let payments = sqlx::query_as(
            r#"
            SELECT * FROM payments
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
            ORDER BY created_at DESC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    async fn find_by_external_id(&self, external_payment_id: &str) -> BillingResult<Option<Payment>> {
        let payment = sqlx::query_as("SELECT * FROM payments WHERE external_payment_id = $1")
            .bind(external_payment_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(payment)
    }

    async fn replay(&self, external_payment_id: &str) -> BillingResult<Option<PaymentReceipt>> {
        let Some(payment) = self.find_by_external_id(external_payment_id).await? else {
            return Ok(None);
        };
        let invoice: Invoice = sqlx::query_as("SELECT * FROM invoices WHERE id = $1")
            .bind(payment.invoice_id)
            .fetch_one(&self.pool)
            .await?;

        tracing::info!(
            payment_id = %payment.id,
            external_payment_id = %external_payment_id,
            status = %payment.status,
            "Payment replayed; returning stored attempt"
        );

        Ok(Some(PaymentReceipt {
            payment,
            invoice,
            invoice_paid: false,
            replayed: true,
        }))
    }

    async fn record_attempt(&self, request: &PaymentRequest) -> Result<Payment, AttemptError> {
        let mut tx = self.pool.begin().await.map_err(BillingError::from)?;
        let invoice = lock_invoice(&mut tx, request.invoice_id).await?;

        match invoice.status {
            InvoiceStatus::Open => {}
            InvoiceStatus::Paid => {
                return Err(BillingError::Conflict(format!(
                    "Invoice {} is already paid",
                    invoice.invoice_number
                ))
                .into());
            }
            other => {
                return Err(BillingError::Conflict(format!(
                    "Invoice {} is {} and cannot be paid",
                    invoice.invoice_number, other
                ))
                .into());
            }
        }

        let in_flight: Option<(PaymentId,)> = sqlx::query_as(
            "SELECT id FROM payments WHERE invoice_id = $1 AND status IN ('pending', 'processing') LIMIT 1",
        )
        .bind(invoice.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(BillingError::from)?;
        if let Some((payment_id,)) = in_flight {
            return Err(BillingError::Conflict(format!(
                "Payment {} for invoice {} is still in flight",
                payment_id, invoice.invoice_number
            ))
            .into());
        }

        let now = utc_now();
        let payment = Payment::pending(
            &invoice,
            request.amount.unwrap_or(invoice.total_amount),
            request.method,
            request.external_payment_id.clone(),
            now,
        )
        .map_err(BillingError::from)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO payments (
                id, invoice_id, tenant_id, amount, currency, status, payment_method,
                processed_at, external_payment_id, external_transaction_id, error_message,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(payment.id)
        .bind(payment.invoice_id)
        .bind(payment.tenant_id)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.status)
        .bind(payment.payment_method)
        .bind(payment.processed_at)
        .bind(&payment.external_payment_id)
        .bind(&payment.external_transaction_id)
        .bind(&payment.error_message)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) && payment.external_payment_id.is_some() => {
                let external_id = payment.external_payment_id.clone().unwrap_or_default();
                return Err(AttemptError::DuplicateExternalId(external_id));
            }
            Err(e) => return Err(BillingError::from(e).into()),
        }

        tx.commit().await.map_err(BillingError::from)?;

        tracing::info!(
            payment_id = %payment.id,
            invoice_id = %invoice.id,
            tenant_id = %invoice.tenant_id,
            amount = %payment.amount,
            method = %payment.payment_method,
            "Recorded payment attempt"
        );

        Ok(payment)
    }

    /// Apply a gateway answer to a payment and, on success, its invoice
    async fn settle(&self, payment_id: PaymentId, settlement: Settlement) -> BillingResult<PaymentReceipt> {
        let invoice_id: (InvoiceId,) = sqlx::query_as("SELECT invoice_id FROM payments WHERE id = $1")
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Payment {}", payment_id)))?;

        let mut tx = self.pool.begin().await?;
        // Invoice before payment, the same order `record_attempt` uses
        let mut invoice = lock_invoice(&mut tx, invoice_id.0).await?;
        let mut payment = lock_payment(&mut tx, payment_id).await?;

        let now = utc_now();
        let (changed, invoice_paid) = apply_settlement(&mut payment, &mut invoice, &settlement, now);

        if !changed {
            tx.rollback().await?;
            tracing::info!(
                payment_id = %payment_id,
                status = %payment.status,
                "Payment already settled; ignoring result"
            );
            return Ok(PaymentReceipt {
                payment,
                invoice,
                invoice_paid: false,
                replayed: true,
            });
        }

        save_payment(&mut tx, &payment).await?;
        if invoice_paid {
            update_invoice_status(&mut tx, &invoice).await?;
        }
        tx.commit().await?;

        tracing::info!(
            payment_id = %payment.id,
            invoice_id = %invoice.id,
            tenant_id = %invoice.tenant_id,
            status = %payment.status,
            invoice_status = %invoice.status,
            invoice_paid,
            "Settled payment"
        );

        self.notify_result(&payment, &invoice).await;

        Ok(PaymentReceipt {
            payment,
            invoice,
            invoice_paid,
            replayed: false,
        })
    }

    async fn notify_result(&self, payment: &Payment, invoice: &Invoice) {
        let recipient: Option<String> =
            sqlx::query_scalar::<_, Option<String>>("SELECT contact_email FROM tenants WHERE id = $1")
                .bind(payment.tenant_id)
                .fetch_optional(&self.pool)
                .await
                .ok()
                .flatten()
                .flatten();

        let notification = match payment.status {
            PaymentStatus::Succeeded => Notification::PaymentSucceeded {
                tenant_id: payment.tenant_id,
                recipient,
                invoice_id: invoice.id,
                invoice_number: invoice.invoice_number.clone(),
                payment_id: payment.id,
                amount: payment.amount,
                currency: payment.currency.clone(),
            },
            PaymentStatus::Failed => Notification::PaymentFailed {
                tenant_id: payment.tenant_id,
                recipient,
                invoice_id: invoice.id,
                invoice_number: invoice.invoice_number.clone(),
                payment_id: payment.id,
                amount: payment.amount,
                currency: payment.currency.clone(),
                reason: payment.error_message.clone().unwrap_or_default(),
            },
            _ => return,
        };

        dispatch(self.notifier.clone(), notification);
    }
}

/// Sweep for attempts stuck in `pending` or `processing`.
///
/// An attempt older than the gateway timeout plus a margin has no call in
/// flight any more; it is failed so the invoice can be paid again.
#[derive(Clone)]
pub struct StalePayments {
    pool: PgPool,
    stale_after: time::Duration,
}

impl StalePayments {
    pub fn new(pool: PgPool, config: &BillingConfig) -> Self {
        Self {
            pool,
            stale_after: config.stale_payment_after(),
        }
    }

    pub async fn fail_stale(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let mut tx = self.pool.begin().await?;

        let stuck: Vec<Payment> = sqlx::query_as(
            r#"
            SELECT * FROM payments
            WHERE status IN ('pending', 'processing')
              AND created_at <= $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now - self.stale_after)
        .fetch_all(&mut *tx)
        .await?;

        let mut failed = 0u64;
        for mut payment in stuck {
            if payment.mark_failed("abandoned: no gateway result received", now) {
                save_payment(&mut tx, &payment).await?;
                failed += 1;
                tracing::warn!(
                    payment_id = %payment.id,
                    invoice_id = %payment.invoice_id,
                    tenant_id = %payment.tenant_id,
                    external_payment_id = ?payment.external_payment_id,
                    "Failed stale payment attempt"
                );
            }
        }

        tx.commit().await?;
        Ok(failed)
    }
}

/// Pure settlement step. Returns `(payment changed, invoice moved to paid)`.
pub fn apply_settlement(
    payment: &mut Payment,
    invoice: &mut Invoice,
    settlement: &Settlement,
    now: OffsetDateTime,
) -> (bool, bool) {
    match settlement {
        Settlement::Outcome(ChargeOutcome::Approved { transaction_id }) => {
            if !payment.mark_succeeded(transaction_id.clone(), now) {
                return (false, false);
            }
            (true, invoice.mark_paid(now))
        }
        Settlement::Outcome(ChargeOutcome::Declined { reason }) => {
            (payment.mark_failed(reason.clone(), now), false)
        }
        Settlement::Error(message) => (
            payment.mark_failed(format!("gateway error: {}", message), now),
            false,
        ),
    }
}

/// An external payment id is bound to the invoice it was first used for
fn ensure_same_invoice(receipt: PaymentReceipt, invoice_id: InvoiceId) -> BillingResult<PaymentReceipt> {
    if receipt.payment.invoice_id != invoice_id {
        return Err(BillingError::Conflict(format!(
            "External payment id {} belongs to another invoice",
            receipt.payment.external_payment_id.as_deref().unwrap_or_default()
        )));
    }
    Ok(receipt)
}

fn upstream(err: GatewayError) -> BillingError {
    BillingError::Upstream(err.to_string())
}

enum AttemptError {
    DuplicateExternalId(String),
    Billing(BillingError),
}

impl From<BillingError> for AttemptError {
    fn from(err: BillingError) -> Self {
        AttemptError::Billing(err)
    }
}

async fn lock_payment(conn: &mut PgConnection, id: PaymentId) -> BillingResult<Payment> {
    sqlx::query_as("SELECT * FROM payments WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Payment {}", id)))
}

async fn save_payment(conn: &mut PgConnection, payment: &Payment) -> BillingResult<()> {
    sqlx::query(
        r#"
        UPDATE payments SET
            status = $2,
            processed_at = $3,
            external_transaction_id = $4,
            error_message = $5,
            updated_at = $6
        WHERE id = $1
        "#,
    )
    .bind(payment.id)
    .bind(payment.status)
    .bind(payment.processed_at)
    .bind(&payment.external_transaction_id)
    .bind(&payment.error_message)
    .bind(payment.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}
