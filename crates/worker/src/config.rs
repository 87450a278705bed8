//! Worker settings: database pool and job schedules

use std::time::Duration;

use anyhow::{anyhow, Context};

/// Six-field cron expressions (seconds first)
pub const DEFAULT_APPLY_CRON: &str = "0 */5 * * * *";
pub const DEFAULT_RECONCILE_CRON: &str = "0 0 * * * *";
pub const DEFAULT_RETRY_CRON: &str = "0 */10 * * * *";
pub const DEFAULT_EXPIRE_CRON: &str = "0 30 * * * *";
pub const DEFAULT_INVARIANTS_CRON: &str = "0 15 3 * * *";
pub const HEARTBEAT_CRON: &str = "0 */5 * * * *";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub apply_cron: String,
    pub reconcile_cron: String,
    pub retry_cron: String,
    pub expire_cron: String,
    pub invariants_cron: String,
    pub job_timeout: Duration,
    /// `LOG_FORMAT=json` switches the subscriber to JSON lines
    pub json_logs: bool,
}

impl WorkerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| anyhow!("DATABASE_URL must be set"))?;

        let schedule = |name: &str, default: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Ok(Self {
            database_url,
            database_max_connections: positive(&lookup, "DATABASE_MAX_CONNECTIONS", 5)?,
            apply_cron: schedule("APPLY_CRON", DEFAULT_APPLY_CRON),
            reconcile_cron: schedule("RECONCILE_CRON", DEFAULT_RECONCILE_CRON),
            retry_cron: schedule("RETRY_CRON", DEFAULT_RETRY_CRON),
            expire_cron: schedule("EXPIRE_CRON", DEFAULT_EXPIRE_CRON),
            invariants_cron: schedule("INVARIANTS_CRON", DEFAULT_INVARIANTS_CRON),
            job_timeout: Duration::from_secs(positive(&lookup, "JOB_TIMEOUT_SECS", 300)?),
            json_logs: lookup("LOG_FORMAT").is_some_and(|v| v.eq_ignore_ascii_case("json")),
        })
    }
}

fn positive<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(raw) = lookup(name) else {
        return Ok(default);
    };
    let value: T = raw
        .trim()
        .parse()
        .with_context(|| format!("{} must be a positive number, got '{}'", name, raw))?;
    if value <= T::default() {
        return Err(anyhow!("{} must be a positive number, got '{}'", name, raw));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<WorkerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("DATABASE_URL", "postgres://localhost/tally")]).unwrap();
        assert_eq!(config.database_max_connections, 5);
        assert_eq!(config.apply_cron, DEFAULT_APPLY_CRON);
        assert_eq!(config.invariants_cron, DEFAULT_INVARIANTS_CRON);
        assert_eq!(config.job_timeout, Duration::from_secs(300));
        assert!(!config.json_logs);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("DATABASE_URL", "postgres://db/tally"),
            ("DATABASE_MAX_CONNECTIONS", "12"),
            ("RETRY_CRON", "0 */2 * * * *"),
            ("JOB_TIMEOUT_SECS", "30"),
            ("LOG_FORMAT", "JSON"),
        ])
        .unwrap();
        assert_eq!(config.database_max_connections, 12);
        assert_eq!(config.retry_cron, "0 */2 * * * *");
        assert_eq!(config.job_timeout, Duration::from_secs(30));
        assert!(config.json_logs);
    }

    #[test]
    fn test_missing_database_url() {
        assert!(load(&[]).is_err());
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        let url = ("DATABASE_URL", "postgres://db/tally");
        assert!(load(&[url, ("JOB_TIMEOUT_SECS", "0")]).is_err());
        assert!(load(&[url, ("DATABASE_MAX_CONNECTIONS", "many")]).is_err());
    }
}
