//! Environment configuration for the billing engine

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::provider::ProviderClientConfig;
use crate::reconcile::ReconcileConfig;

/// Which agreement survives when a tenant has several live ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionPolicy {
    /// Newest agreement by creation time wins
    #[default]
    MostRecent,
    /// Keep the current primary if it is still live, otherwise newest wins
    KeepPrimary,
}

impl FromStr for ElectionPolicy {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "most_recent" => Ok(ElectionPolicy::MostRecent),
            "keep_primary" => Ok(ElectionPolicy::KeepPrimary),
            other => Err(BillingError::Config(format!(
                "RECONCILE_ELECTION must be most_recent or keep_primary, got '{}'",
                other
            ))),
        }
    }
}

/// 30 days
const MAX_STALE_CANCEL_MINUTES: i64 = 43_200;
/// One year
const MAX_CHECKOUT_EXPIRY_HOURS: i64 = 8_760;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub provider_base_url: String,
    pub provider_access_token: String,
    pub provider_timeout: Duration,
    /// Where the provider sends the payer after checkout
    pub provider_back_url: String,
    pub stale_cancel_threshold: time::Duration,
    pub election: ElectionPolicy,
    pub cancel_retry_batch_size: usize,
    /// CREATED / CHECKOUT_STARTED changes older than this are expired
    pub checkout_expiry: time::Duration,
}

impl BillingConfig {
    /// Load configuration from environment variables (the caller loads any `.env` file)
    pub fn from_env() -> BillingResult<Self> {
        let timeout_secs: u64 = parse_positive("PROVIDER_TIMEOUT_SECS", 10, 300)?;
        let stale_minutes: i64 = parse_positive("RECONCILE_STALE_CANCEL_MINUTES", 60, MAX_STALE_CANCEL_MINUTES)?;
        let expiry_hours: i64 = parse_positive("CHECKOUT_EXPIRY_HOURS", 48, MAX_CHECKOUT_EXPIRY_HOURS)?;

        Ok(Self {
            provider_base_url: required("PROVIDER_BASE_URL")?,
            provider_access_token: required("PROVIDER_ACCESS_TOKEN")?,
            provider_timeout: Duration::from_secs(timeout_secs),
            provider_back_url: required("PROVIDER_BACK_URL")?,
            stale_cancel_threshold: time::Duration::minutes(stale_minutes),
            election: match std::env::var("RECONCILE_ELECTION") {
                Ok(raw) => raw.parse()?,
                Err(_) => ElectionPolicy::default(),
            },
            cancel_retry_batch_size: parse_positive("CANCEL_RETRY_BATCH_SIZE", 50, 10_000)?,
            checkout_expiry: time::Duration::hours(expiry_hours),
        })
    }

    pub fn provider_client_config(&self) -> ProviderClientConfig {
        ProviderClientConfig::new(
            self.provider_base_url.clone(),
            self.provider_access_token.clone(),
            self.provider_timeout,
        )
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            stale_cancel_threshold: self.stale_cancel_threshold,
            election: self.election,
        }
    }
}

fn required(name: &str) -> BillingResult<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(BillingError::Config(format!("{} must be set", name))),
    }
}

/// Parse an optional number in `1..=max`, falling back to `default` when unset
fn parse_positive<T>(name: &str, default: T, max: T) -> BillingResult<T>
where
    T: FromStr + PartialOrd + Default + std::fmt::Display,
{
    let Ok(raw) = std::env::var(name) else {
        return Ok(default);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() && value <= max => Ok(value),
        _ => Err(BillingError::Config(format!(
            "{} must be a positive number no larger than {}, got '{}'",
            name, max, raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 8] = [
        "PROVIDER_BASE_URL",
        "PROVIDER_ACCESS_TOKEN",
        "PROVIDER_BACK_URL",
        "PROVIDER_TIMEOUT_SECS",
        "RECONCILE_STALE_CANCEL_MINUTES",
        "RECONCILE_ELECTION",
        "CANCEL_RETRY_BATCH_SIZE",
        "CHECKOUT_EXPIRY_HOURS",
    ];

    fn reset_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
        std::env::set_var("PROVIDER_BASE_URL", "https://provider.test/v1");
        std::env::set_var("PROVIDER_ACCESS_TOKEN", "tok_test");
        std::env::set_var("PROVIDER_BACK_URL", "https://app.test/billing/return");
    }

    #[test]
    #[serial]
    fn test_defaults() {
        reset_env();
        let config = BillingConfig::from_env().unwrap();
        assert_eq!(config.provider_timeout, Duration::from_secs(10));
        assert_eq!(config.stale_cancel_threshold, time::Duration::minutes(60));
        assert_eq!(config.election, ElectionPolicy::MostRecent);
        assert_eq!(config.cancel_retry_batch_size, 50);
        assert_eq!(config.checkout_expiry, time::Duration::hours(48));
    }

    #[test]
    #[serial]
    fn test_overrides() {
        reset_env();
        std::env::set_var("RECONCILE_ELECTION", "KEEP_PRIMARY");
        std::env::set_var("CANCEL_RETRY_BATCH_SIZE", "7");
        std::env::set_var("RECONCILE_STALE_CANCEL_MINUTES", "15");

        let config = BillingConfig::from_env().unwrap();
        assert_eq!(config.election, ElectionPolicy::KeepPrimary);
        assert_eq!(config.cancel_retry_batch_size, 7);
        assert_eq!(config.reconcile_config().stale_cancel_threshold, time::Duration::minutes(15));
    }

    #[test]
    #[serial]
    fn test_invalid_numbers_are_config_errors() {
        reset_env();
        std::env::set_var("CANCEL_RETRY_BATCH_SIZE", "lots");
        assert!(matches!(BillingConfig::from_env(), Err(BillingError::Config(_))));

        std::env::set_var("CANCEL_RETRY_BATCH_SIZE", "0");
        assert!(matches!(BillingConfig::from_env(), Err(BillingError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_out_of_range_durations_are_config_errors() {
        reset_env();
        std::env::set_var("CHECKOUT_EXPIRY_HOURS", i64::MAX.to_string());
        assert!(matches!(BillingConfig::from_env(), Err(BillingError::Config(_))));

        reset_env();
        std::env::set_var("RECONCILE_STALE_CANCEL_MINUTES", "9223372036854775807");
        assert!(matches!(BillingConfig::from_env(), Err(BillingError::Config(_))));

        reset_env();
        std::env::set_var("CHECKOUT_EXPIRY_HOURS", "8760");
        let config = BillingConfig::from_env().unwrap();
        assert_eq!(config.checkout_expiry, time::Duration::hours(8_760));
    }

    #[test]
    #[serial]
    fn test_missing_provider_url() {
        reset_env();
        std::env::remove_var("PROVIDER_BASE_URL");
        let err = BillingConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("PROVIDER_BASE_URL"));
    }
}
