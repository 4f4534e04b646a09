//! Application configuration

use std::env;
use std::time::Duration;

use tenantry_billing::BillingConfig;

/// Subdomain labels that never name a tenant
pub const DEFAULT_RESERVED_SUBDOMAINS: &[&str] = &["www", "api", "admin", "static", "media"];

/// Path prefixes that are served without a tenant
pub const DEFAULT_EXEMPT_PATHS: &[&str] = &[
    "/admin/",
    "/api/docs/",
    "/api/redoc/",
    "/static/",
    "/media/",
    "/health/",
];

pub const DEFAULT_TENANT_HEADER: &str = "X-Tenant";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub public_url: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Tenant resolution
    pub tenant_header: String,
    pub reserved_subdomains: Vec<String>,
    pub exempt_paths: Vec<String>,
    pub domain_cache_ttl: Duration,

    // Invitations
    pub invitation_hmac_secret: String,
    pub invitation_expiry_days: i64,

    // Billing
    pub billing: BillingConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            public_url: env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),

            // Tenant resolution
            tenant_header: env::var("TENANT_HEADER")
                .ok()
                .filter(|h| !h.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TENANT_HEADER.to_string()),
            reserved_subdomains: list_var("RESERVED_SUBDOMAINS", DEFAULT_RESERVED_SUBDOMAINS)
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect(),
            exempt_paths: list_var("TENANT_EXEMPT_PATHS", DEFAULT_EXEMPT_PATHS),
            domain_cache_ttl: Duration::from_secs(
                env::var("DOMAIN_CACHE_TTL_SECS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .unwrap_or(300),
            ),

            // Invitations
            invitation_hmac_secret: {
                let secret = env::var("INVITATION_HMAC_SECRET")
                    .map_err(|_| ConfigError::Missing("INVITATION_HMAC_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "INVITATION_HMAC_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },
            invitation_expiry_days: {
                let days: i64 = env::var("INVITATION_EXPIRY_DAYS")
                    .unwrap_or_else(|_| "7".to_string())
                    .parse()
                    .map_err(|_| ConfigError::Invalid("INVITATION_EXPIRY_DAYS must be a number"))?;
                if days <= 0 {
                    return Err(ConfigError::Invalid(
                        "INVITATION_EXPIRY_DAYS must be positive",
                    ));
                }
                days
            },

            // Billing
            billing: BillingConfig::from_env(),
        })
    }
}

/// Comma-separated list, or the defaults when unset or empty
fn list_var(name: &str, defaults: &[&str]) -> Vec<String> {
    let parsed: Vec<String> = env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    if parsed.is_empty() {
        defaults.iter().map(|s| s.to_string()).collect()
    } else {
        parsed
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
    #[error("Invalid value: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Config tests modify shared env vars
    static CONFIG_TEST_MUTEX: Mutex<()> = Mutex::new(());

    fn setup_minimal_config() {
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var(
            "INVITATION_HMAC_SECRET",
            "test-invitation-secret-at-least-32-chars",
        );
    }

    fn cleanup_config() {
        for var in [
            "DATABASE_URL",
            "INVITATION_HMAC_SECRET",
            "INVITATION_EXPIRY_DAYS",
            "TENANT_HEADER",
            "RESERVED_SUBDOMAINS",
            "TENANT_EXEMPT_PATHS",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults() {
        let _lock = CONFIG_TEST_MUTEX.lock().unwrap();
        cleanup_config();
        setup_minimal_config();

        let config = Config::from_env().unwrap();
        assert_eq!(config.tenant_header, "X-Tenant");
        assert_eq!(config.reserved_subdomains, vec!["www", "api", "admin", "static", "media"]);
        assert!(config.exempt_paths.contains(&"/health/".to_string()));
        assert_eq!(config.domain_cache_ttl, Duration::from_secs(300));
        assert_eq!(config.invitation_expiry_days, 7);

        cleanup_config();
    }

    #[test]
    fn test_overrides_and_validation() {
        let _lock = CONFIG_TEST_MUTEX.lock().unwrap();
        cleanup_config();

        // Missing secret
        env::set_var("DATABASE_URL", "postgres://test");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("INVITATION_HMAC_SECRET"))
        ));

        // Short secret
        env::set_var("INVITATION_HMAC_SECRET", "too-short");
        assert!(matches!(Config::from_env(), Err(ConfigError::WeakSecret(_))));

        // Bad expiry
        setup_minimal_config();
        env::set_var("INVITATION_EXPIRY_DAYS", "0");
        assert!(matches!(Config::from_env(), Err(ConfigError::Invalid(_))));
        env::set_var("INVITATION_EXPIRY_DAYS", "14");

        env::set_var("TENANT_HEADER", "X-Org");
        env::set_var("RESERVED_SUBDOMAINS", " WWW, app ,,");
        let config = Config::from_env().unwrap();
        assert_eq!(config.tenant_header, "X-Org");
        assert_eq!(config.reserved_subdomains, vec!["www", "app"]);
        assert_eq!(config.invitation_expiry_days, 14);

        cleanup_config();
    }
}
