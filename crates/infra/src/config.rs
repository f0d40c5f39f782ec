//! Configuration loading and representation.
//!
//! Values come from the process environment (`DATABASE_URL` plus `WMS_*`
//! variables). Anything unset keeps its default.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::idempotency::DEFAULT_VOLATILE_FIELDS;
use crate::transactional::ExecutorOptions;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Idempotency guard settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// A `processing` record untouched for this long is treated as a crashed
    /// attempt and resolved to `failed`.
    pub abandon_after: Duration,
    /// Top-level payload fields ignored when deriving keys.
    pub volatile_fields: Vec<String>,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            abandon_after: Duration::from_secs(10 * 60),
            volatile_fields: DEFAULT_VOLATILE_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl IdempotencyConfig {
    pub fn with_abandon_after(mut self, abandon_after: Duration) -> Self {
        self.abandon_after = abandon_after;
        self
    }

    pub fn with_volatile_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.volatile_fields = fields.into_iter().map(Into::into).collect();
        self
    }
}

/// Expired-record sweeper settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub interval: Duration,
}

impl SweeperConfig {
    /// A zero interval would spin; reject it wherever the config came from.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "WMS_SWEEP_INTERVAL_SECS",
                value: format!("{:?}", self.interval),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
        }
    }
}

/// Everything the infrastructure layer reads from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfraConfig {
    pub database_url: Option<String>,
    pub executor: ExecutorOptions,
    pub idempotency: IdempotencyConfig,
    pub sweeper: SweeperConfig,
}

impl InfraConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source (tests, layered config).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = InfraConfig {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            ..Default::default()
        };

        if let Some(v) = parse::<u32>(&lookup, "WMS_MAX_RETRIES")? {
            config.executor.max_retries = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "WMS_RETRY_DELAY_MS")? {
            config.executor.retry_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse::<bool>(&lookup, "WMS_USE_IDEMPOTENCY")? {
            config.executor.use_idempotency = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "WMS_IDEMPOTENCY_TTL_HOURS")? {
            config.executor.idempotency_ttl_hours = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "WMS_ATTEMPT_TIMEOUT_MS")? {
            config.executor.timeout = (v > 0).then(|| Duration::from_millis(v));
        }
        if let Some(v) = parse::<u64>(&lookup, "WMS_ABANDON_AFTER_SECS")? {
            config.idempotency.abandon_after = Duration::from_secs(v);
        }
        if let Some(v) = parse::<u64>(&lookup, "WMS_SWEEP_INTERVAL_SECS")? {
            config.sweeper.interval = Duration::from_secs(v);
            config.sweeper.validate()?;
        }
        if let Some(v) = lookup("WMS_VOLATILE_FIELDS") {
            config.idempotency.volatile_fields = v
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect();
        }

        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| vars.get(k).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = InfraConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, InfraConfig::default());
        assert_eq!(config.executor.max_retries, 3);
        assert_eq!(config.idempotency.abandon_after, Duration::from_secs(600));
    }

    #[test]
    fn reads_overrides() {
        let config = InfraConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://wms@localhost/wms"),
            ("WMS_MAX_RETRIES", "5"),
            ("WMS_RETRY_DELAY_MS", "250"),
            ("WMS_USE_IDEMPOTENCY", "false"),
            ("WMS_ATTEMPT_TIMEOUT_MS", "1500"),
            ("WMS_SWEEP_INTERVAL_SECS", "60"),
            ("WMS_VOLATILE_FIELDS", "timestamp, request_id,"),
        ]))
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://wms@localhost/wms"));
        assert_eq!(config.executor.max_retries, 5);
        assert_eq!(config.executor.retry_delay, Duration::from_millis(250));
        assert!(!config.executor.use_idempotency);
        assert_eq!(config.executor.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.sweeper.interval, Duration::from_secs(60));
        assert_eq!(config.idempotency.volatile_fields, vec!["timestamp", "request_id"]);
    }

    #[test]
    fn rejects_garbage() {
        let err = InfraConfig::from_lookup(lookup(&[("WMS_MAX_RETRIES", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "WMS_MAX_RETRIES", .. }));

        let err = InfraConfig::from_lookup(lookup(&[("WMS_SWEEP_INTERVAL_SECS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "WMS_SWEEP_INTERVAL_SECS", .. }));
    }
}
