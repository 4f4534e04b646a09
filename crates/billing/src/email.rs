//! Email delivery for notifications
//!
//! Renders `Notification`s as transactional emails and sends them through the
//! Resend API. Delivery problems are reported to the caller of `notify`, which
//! `tenantry_shared::dispatch` only logs.

use async_trait::async_trait;

use tenantry_shared::{Notification, Notifier, NotifyError};

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key
    pub resend_api_key: String,
    /// From address for emails
    pub email_from: String,
    /// App name for branding
    pub app_name: String,
    /// Support email
    pub support_email: String,
    /// Base URL for links in emails
    pub public_url: String,
}

impl EmailConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Tenantry <noreply@tenantry.dev>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "Tenantry".to_string()),
            support_email: std::env::var("SUPPORT_EMAIL")
                .unwrap_or_else(|_| "support@tenantry.dev".to_string()),
            public_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

/// A rendered email
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Notifier that sends email through Resend
#[derive(Clone)]
pub struct ResendNotifier {
    config: EmailConfig,
    client: reqwest::Client,
}

impl ResendNotifier {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    /// Render a notification; `None` when it has no recipient
    pub fn render(&self, notification: &Notification) -> Option<Email> {
        let to = notification.recipient()?.to_string();
        let app = &self.config.app_name;

        let (subject, body) = match notification {
            Notification::InvitationCreated {
                tenant_name,
                role,
                token,
                expires_at,
                ..
            } => {
                let link = format!("{}/invitations/accept?token={}", self.config.public_url, token);
                let expires = expires_at
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default();
                let subject = format!("You're invited to join {} on {}", tenant_name, app);
                let tenant_name = escape_html(tenant_name);
                (
                    subject,
                    format!(
                        r#"<p>You have been invited to join <strong>{tenant_name}</strong> as <strong>{role}</strong>.</p>
    <p><a href="{link}" style="color: #6366f1;">Accept invitation</a></p>
    <p style="color: #666; font-size: 14px;">This invitation expires at {expires}.</p>"#
                    ),
                )
            }
            Notification::PasswordResetRequested { .. } => (
                format!("Reset your {} password", app),
                format!(
                    r#"<p>A password reset was requested for this address.</p>
    <p><a href="{}/password-reset" style="color: #6366f1;">Choose a new password</a></p>
    <p style="color: #666; font-size: 14px;">If you did not request this, you can ignore this email.</p>"#,
                    self.config.public_url
                ),
            ),
            Notification::PaymentSucceeded {
                invoice_number,
                amount,
                currency,
                ..
            } => (
                format!("Payment received - {}", invoice_number),
                format!(
                    r#"<p>We received your payment of <strong>{amount:.2} {currency}</strong> for invoice <strong>{invoice_number}</strong>.</p>
    <p>Thank you!</p>"#
                ),
            ),
            Notification::PaymentFailed {
                invoice_number,
                amount,
                currency,
                reason,
                ..
            } => (
                format!("Payment failed - {}", invoice_number),
                format!(
                    r#"<h2 style="color: #dc2626;">Payment Failed</h2>
    <p>We weren't able to process the payment of <strong>{amount:.2} {currency}</strong> for invoice <strong>{invoice_number}</strong>.</p>
    <div style="background: #fef2f2; border: 1px solid #fecaca; border-radius: 8px; padding: 16px; margin: 20px 0;">
        <p style="margin: 0; color: #dc2626;"><strong>Reason:</strong> {reason}</p>
    </div>
    <p><a href="{url}/billing" style="color: #6366f1;">Review billing</a></p>"#,
                    reason = escape_html(reason),
                    url = self.config.public_url
                ),
            ),
        };

        Some(Email {
            to,
            subject,
            html: self.layout(&body),
        })
    }

    fn layout(&self, body: &str) -> String {
        format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    {body}
    <p style="color: #666; font-size: 14px;">
        Questions? Contact us at <a href="mailto:{support}">{support}</a>
    </p>
    <hr style="border: none; border-top: 1px solid #eee; margin: 20px 0;">
    <p style="color: #999; font-size: 12px;">{app}</p>
</body>
</html>"#,
            body = body,
            support = self.config.support_email,
            app = self.config.app_name,
        )
    }

    async fn send(&self, email: &Email) -> Result<(), NotifyError> {
        #[allow(clippy::disallowed_methods)]
        // json! macro uses unwrap internally, safe for primitive types
        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [email.to],
            "subject": email.subject,
            "html": email.html
        });

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .header(
                "Authorization",
                format!("Bearer {}", self.config.resend_api_key),
            )
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(NotifyError::Delivery(format!("{}: {}", status, text)));
        }

        tracing::info!(to = %email.to, subject = %email.subject, "Email sent");
        Ok(())
    }
}

#[async_trait]
impl Notifier for ResendNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let Some(email) = self.render(notification) else {
            tracing::debug!(kind = notification.kind(), "Notification has no recipient, skipping");
            return Ok(());
        };

        if !self.config.is_enabled() {
            tracing::warn!(
                to = %email.to,
                subject = %email.subject,
                "Email not configured, skipping"
            );
            return Err(NotifyError::NotConfigured);
        }

        self.send(&email).await
    }
}

/// Escape text interpolated into an HTML body
fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use tenantry_shared::{InvoiceId, PaymentId, Role, TenantId};

    fn notifier() -> ResendNotifier {
        ResendNotifier::new(EmailConfig {
            resend_api_key: String::new(),
            email_from: "Tenantry <noreply@test>".into(),
            app_name: "Tenantry".into(),
            support_email: "support@test".into(),
            public_url: "https://app.test".into(),
        })
    }

    #[test]
    fn test_render_invitation() {
        let email = notifier()
            .render(&Notification::InvitationCreated {
                tenant_id: TenantId::new(),
                tenant_name: "Acme".into(),
                email: "dev@acme.test".into(),
                role: Role::TenantAdmin,
                token: "abc.def".into(),
                expires_at: time::OffsetDateTime::now_utc(),
            })
            .unwrap();
        assert_eq!(email.to, "dev@acme.test");
        assert!(email.subject.contains("Acme"));
        assert!(email.html.contains("https://app.test/invitations/accept?token=abc.def"));
        assert!(email.html.contains("tenant_admin"));
    }

    #[test]
    fn test_render_payment_failed() {
        let email = notifier()
            .render(&Notification::PaymentFailed {
                tenant_id: TenantId::new(),
                recipient: Some("billing@acme.test".into()),
                invoice_id: InvoiceId::new(),
                invoice_number: "INV-202601-AAAAAAAAAA".into(),
                payment_id: PaymentId::new(),
                amount: Decimal::new(2900, 2),
                currency: "USD".into(),
                reason: "card declined".into(),
            })
            .unwrap();
        assert!(email.subject.contains("INV-202601-AAAAAAAAAA"));
        assert!(email.html.contains("29.00 USD"));
        assert!(email.html.contains("card declined"));
    }

    #[test]
    fn test_tenant_supplied_text_is_escaped() {
        let email = notifier()
            .render(&Notification::InvitationCreated {
                tenant_id: TenantId::new(),
                tenant_name: "<script>alert('x')</script> & Co".into(),
                email: "dev@acme.test".into(),
                role: Role::User,
                token: "abc.def".into(),
                expires_at: time::OffsetDateTime::now_utc(),
            })
            .unwrap();
        assert!(!email.html.contains("<script>"));
        assert!(email.html.contains("&lt;script&gt;alert(&#39;x&#39;)&lt;/script&gt; &amp; Co"));

        let email = notifier()
            .render(&Notification::PaymentFailed {
                tenant_id: TenantId::new(),
                recipient: Some("billing@acme.test".into()),
                invoice_id: InvoiceId::new(),
                invoice_number: "INV-202601-AAAAAAAAAA".into(),
                payment_id: PaymentId::new(),
                amount: Decimal::new(2900, 2),
                currency: "USD".into(),
                reason: "<b>\"declined\"</b>".into(),
            })
            .unwrap();
        assert!(email.html.contains("&lt;b&gt;&quot;declined&quot;&lt;/b&gt;"));
    }

    #[test]
    fn test_no_recipient_renders_nothing() {
        let rendered = notifier().render(&Notification::PaymentSucceeded {
            tenant_id: TenantId::new(),
            recipient: None,
            invoice_id: InvoiceId::new(),
            invoice_number: "INV-1".into(),
            payment_id: PaymentId::new(),
            amount: Decimal::ONE,
            currency: "USD".into(),
        });
        assert!(rendered.is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_delivery_is_an_error() {
        let result = notifier()
            .notify(&Notification::PasswordResetRequested {
                email: "ops@acme.test".into(),
            })
            .await;
        assert!(matches!(result, Err(NotifyError::NotConfigured)));
    }
}
