//! Configuration module for collections-service.

use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use service_core::retry::RetryConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::models::DirectDebitScheme;

#[derive(Debug, Clone)]
pub struct CollectionsConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub notification: NotificationConfig,
    pub contracts: ContractServiceConfig,
    pub retry: RetryConfig,
    pub policy: CollectionPolicy,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub access_token: Secret<String>,
    /// Shared secret for the `Webhook-Signature` HMAC.
    pub webhook_secret: Secret<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ContractServiceConfig {
    pub base_url: String,
    pub timeout: Duration,
}

/// Business timing rules for collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionPolicy {
    /// Minimum pre-notification lead for SEPA Core debits.
    pub sepa_advance_notice_days: i64,
    /// Minimum pre-notification lead for Bacs debits.
    pub bacs_advance_notice_days: i64,
    /// How many days before `notify_by` the pre-notification may go out.
    pub notice_window_days: i64,
    /// How many days before the due date a notified charge is submitted.
    pub submission_lead_days: i64,
    pub dunning_cool_down_days: i64,
    /// Expiry alerts start this many days before a mandate or contract ends.
    pub expiry_horizon_days: i64,
    /// Maximum number of periods searched when carrying an amount forward.
    pub carry_forward_periods: u32,
}

impl Default for CollectionPolicy {
    fn default() -> Self {
        Self {
            sepa_advance_notice_days: 14,
            bacs_advance_notice_days: 10,
            notice_window_days: 5,
            submission_lead_days: 5,
            dunning_cool_down_days: 7,
            expiry_horizon_days: 90,
            carry_forward_periods: 12,
        }
    }
}

impl CollectionPolicy {
    pub fn advance_notice_days(&self, scheme: DirectDebitScheme) -> i64 {
        match scheme {
            DirectDebitScheme::SepaCore => self.sepa_advance_notice_days,
            DirectDebitScheme::Bacs => self.bacs_advance_notice_days,
        }
    }

    pub fn dunning_cool_down(&self) -> chrono::Duration {
        chrono::Duration::days(self.dunning_cool_down_days)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn secret_from_env(key: &str) -> Result<Secret<String>, AppError> {
    env::var(key)
        .map(Secret::new)
        .map_err(|_| AppError::ConfigError(anyhow::anyhow!("{} is required", key)))
}

impl CollectionsConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        let common = core_config::Config::load("COLLECTIONS")?;
        let defaults = CollectionPolicy::default();
        let retry_defaults = RetryConfig::default();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "collections-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: secret_from_env("COLLECTIONS_DATABASE_URL")?,
                max_connections: env_or("COLLECTIONS_DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_or("COLLECTIONS_DATABASE_MIN_CONNECTIONS", 2),
            },
            gateway: GatewayConfig {
                base_url: env::var("COLLECTIONS_GATEWAY_URL")
                    .unwrap_or_else(|_| "http://localhost:4010".to_string()),
                access_token: secret_from_env("COLLECTIONS_GATEWAY_ACCESS_TOKEN")?,
                webhook_secret: secret_from_env("COLLECTIONS_GATEWAY_WEBHOOK_SECRET")?,
                timeout: Duration::from_secs(env_or("COLLECTIONS_GATEWAY_TIMEOUT_SECS", 30)),
            },
            notification: NotificationConfig {
                base_url: env::var("COLLECTIONS_NOTIFICATION_URL")
                    .unwrap_or_else(|_| "http://notification-service:3001".to_string()),
                timeout: Duration::from_secs(env_or("COLLECTIONS_NOTIFICATION_TIMEOUT_SECS", 10)),
            },
            contracts: ContractServiceConfig {
                base_url: env::var("COLLECTIONS_CONTRACTS_URL")
                    .unwrap_or_else(|_| "http://contract-service:3001".to_string()),
                timeout: Duration::from_secs(env_or("COLLECTIONS_CONTRACTS_TIMEOUT_SECS", 10)),
            },
            retry: RetryConfig {
                max_retries: env_or("COLLECTIONS_RETRY_MAX_RETRIES", retry_defaults.max_retries),
                initial_backoff: Duration::from_millis(env_or(
                    "COLLECTIONS_RETRY_INITIAL_BACKOFF_MS",
                    200,
                )),
                max_backoff: Duration::from_millis(env_or("COLLECTIONS_RETRY_MAX_BACKOFF_MS", 10_000)),
                ..retry_defaults
            },
            policy: CollectionPolicy {
                sepa_advance_notice_days: env_or(
                    "COLLECTIONS_SEPA_ADVANCE_NOTICE_DAYS",
                    defaults.sepa_advance_notice_days,
                ),
                bacs_advance_notice_days: env_or(
                    "COLLECTIONS_BACS_ADVANCE_NOTICE_DAYS",
                    defaults.bacs_advance_notice_days,
                ),
                notice_window_days: env_or(
                    "COLLECTIONS_NOTICE_WINDOW_DAYS",
                    defaults.notice_window_days,
                ),
                submission_lead_days: env_or(
                    "COLLECTIONS_SUBMISSION_LEAD_DAYS",
                    defaults.submission_lead_days,
                ),
                dunning_cool_down_days: env_or(
                    "COLLECTIONS_DUNNING_COOL_DOWN_DAYS",
                    defaults.dunning_cool_down_days,
                ),
                expiry_horizon_days: env_or(
                    "COLLECTIONS_EXPIRY_HORIZON_DAYS",
                    defaults.expiry_horizon_days,
                ),
                carry_forward_periods: env_or(
                    "COLLECTIONS_CARRY_FORWARD_PERIODS",
                    defaults.carry_forward_periods,
                ),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notice_period_follows_scheme() {
        let policy = CollectionPolicy::default();
        assert_eq!(policy.advance_notice_days(DirectDebitScheme::SepaCore), 14);
        assert_eq!(policy.advance_notice_days(DirectDebitScheme::Bacs), 10);
    }

    #[test]
    fn env_or_falls_back_on_garbage() {
        std::env::set_var("COLLECTIONS_TEST_GARBAGE_DAYS", "fourteen");
        assert_eq!(env_or("COLLECTIONS_TEST_GARBAGE_DAYS", 14i64), 14);
    }
}
