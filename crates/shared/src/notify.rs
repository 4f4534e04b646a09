//! Fire-and-forget notifications
//!
//! Triggering operations hand a `Notification` to `dispatch` and move on.
//! Delivery failures are logged and never reach the caller.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

use crate::types::{InvoiceId, PaymentId, Role, TenantId};

/// Events the core reports to the notification collaborator
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    InvitationCreated {
        tenant_id: TenantId,
        tenant_name: String,
        email: String,
        role: Role,
        token: String,
        #[serde(with = "time::serde::rfc3339")]
        expires_at: OffsetDateTime,
    },
    PasswordResetRequested {
        email: String,
    },
    PaymentSucceeded {
        tenant_id: TenantId,
        recipient: Option<String>,
        invoice_id: InvoiceId,
        invoice_number: String,
        payment_id: PaymentId,
        amount: Decimal,
        currency: String,
    },
    PaymentFailed {
        tenant_id: TenantId,
        recipient: Option<String>,
        invoice_id: InvoiceId,
        invoice_number: String,
        payment_id: PaymentId,
        amount: Decimal,
        currency: String,
        reason: String,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvitationCreated { .. } => "invitation_created",
            Self::PasswordResetRequested { .. } => "password_reset_requested",
            Self::PaymentSucceeded { .. } => "payment_succeeded",
            Self::PaymentFailed { .. } => "payment_failed",
        }
    }

    /// Address the notification goes to, if one is known
    pub fn recipient(&self) -> Option<&str> {
        match self {
            Self::InvitationCreated { email, .. } | Self::PasswordResetRequested { email } => {
                Some(email.as_str())
            }
            Self::PaymentSucceeded { recipient, .. } | Self::PaymentFailed { recipient, .. } => {
                recipient.as_deref()
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notification channel not configured")]
    NotConfigured,

    #[error("Delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Deliver in the background. The triggering operation never observes the outcome.
pub fn dispatch(notifier: Arc<dyn Notifier>, notification: Notification) {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&notification).await {
            tracing::warn!(
                kind = notification.kind(),
                error = %e,
                "Notification delivery failed - non-fatal"
            );
        }
    });
}

/// Notifier that only records events in the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            kind = notification.kind(),
            recipient = notification.recipient().unwrap_or("-"),
            "Notification"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingNotifier {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _: &Notification) -> Result<(), NotifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(NotifyError::Delivery("smtp down".into()))
        }
    }

    #[tokio::test]
    async fn test_dispatch_swallows_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let notifier = Arc::new(FailingNotifier {
            calls: calls.clone(),
        });

        dispatch(
            notifier,
            Notification::PasswordResetRequested {
                email: "ops@acme.test".into(),
            },
        );

        for _ in 0..50 {
            if calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recipient() {
        let n = Notification::PaymentFailed {
            tenant_id: TenantId::new(),
            recipient: None,
            invoice_id: InvoiceId::new(),
            invoice_number: "INV-1".into(),
            payment_id: PaymentId::new(),
            amount: Decimal::ONE,
            currency: "USD".into(),
            reason: "declined".into(),
        };
        assert_eq!(n.kind(), "payment_failed");
        assert_eq!(n.recipient(), None);

        let n = Notification::PasswordResetRequested {
            email: "a@b.test".into(),
        };
        assert_eq!(n.recipient(), Some("a@b.test"));
    }
}
