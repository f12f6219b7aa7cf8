use std::env;
use std::str::FromStr;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Seconds a dispatched request may wait for its callback; must exceed
    /// the DON's maximum round-trip
    pub fulfillment_timeout_secs: u64,
    pub max_price_staleness_secs: u64,
    /// Largest response the DON is allowed to return
    pub max_response_bytes: usize,
    pub secrets_ttl_secs: u64,
    pub max_callback_gas: u32,
    pub max_source_bytes: usize,
    pub poll_interval_secs: u64,
    pub expiry_sweep_interval_secs: u64,
    /// Tries per fulfillment fetch before the poll gives up until next tick
    pub fetch_attempts: u32,
    pub fetch_backoff_ms: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            fulfillment_timeout_secs: 900,
            max_price_staleness_secs: 3600,
            max_response_bytes: 256,
            secrets_ttl_secs: 3600,
            max_callback_gas: 300_000,
            max_source_bytes: 30_000,
            poll_interval_secs: 5,
            expiry_sweep_interval_secs: 60,
            fetch_attempts: 5,
            fetch_backoff_ms: 100,
        }
    }
}

impl OracleConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from defaults overridden by whatever `lookup` returns
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = OracleConfig::default();

        override_from(&lookup, "ORACLE_FULFILLMENT_TIMEOUT_SECS", &mut config.fulfillment_timeout_secs)?;
        override_from(&lookup, "ORACLE_MAX_PRICE_STALENESS_SECS", &mut config.max_price_staleness_secs)?;
        override_from(&lookup, "ORACLE_MAX_RESPONSE_BYTES", &mut config.max_response_bytes)?;
        override_from(&lookup, "ORACLE_SECRETS_TTL_SECS", &mut config.secrets_ttl_secs)?;
        override_from(&lookup, "ORACLE_MAX_CALLBACK_GAS", &mut config.max_callback_gas)?;
        override_from(&lookup, "ORACLE_MAX_SOURCE_BYTES", &mut config.max_source_bytes)?;
        override_from(&lookup, "ORACLE_POLL_INTERVAL_SECS", &mut config.poll_interval_secs)?;
        override_from(&lookup, "ORACLE_EXPIRY_SWEEP_INTERVAL_SECS", &mut config.expiry_sweep_interval_secs)?;
        override_from(&lookup, "ORACLE_FETCH_ATTEMPTS", &mut config.fetch_attempts)?;
        override_from(&lookup, "ORACLE_FETCH_BACKOFF_MS", &mut config.fetch_backoff_ms)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fulfillment_timeout_secs < 60 {
            return Err(ConfigError::ValidationError(
                "fulfillment timeout must be at least 60 seconds".to_string(),
            ));
        }

        if self.max_response_bytes == 0 {
            return Err(ConfigError::ValidationError("max response bytes must be greater than 0".to_string()));
        }

        if self.secrets_ttl_secs == 0 {
            return Err(ConfigError::ValidationError("secrets TTL must be greater than 0".to_string()));
        }

        if self.max_callback_gas == 0 {
            return Err(ConfigError::ValidationError("max callback gas must be greater than 0".to_string()));
        }

        if self.poll_interval_secs == 0 || self.expiry_sweep_interval_secs == 0 {
            return Err(ConfigError::ValidationError("sweep intervals must be greater than 0".to_string()));
        }

        if self.fetch_attempts == 0 {
            return Err(ConfigError::ValidationError("fetch attempts must be at least 1".to_string()));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_interval_secs)
    }

    pub fn fetch_backoff(&self) -> Duration {
        Duration::from_millis(self.fetch_backoff_ms)
    }
}

fn override_from<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(val) = lookup(key) {
        *slot = val.parse()
            .map_err(|_| ConfigError::InvalidEnvVar(key.to_string(), val))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = OracleConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, OracleConfig::default());
    }

    #[test]
    fn test_overrides_applied() {
        let config = OracleConfig::from_lookup(lookup(&[
            ("ORACLE_FULFILLMENT_TIMEOUT_SECS", "1200"),
            ("ORACLE_MAX_RESPONSE_BYTES", "512"),
        ]))
        .unwrap();

        assert_eq!(config.fulfillment_timeout_secs, 1200);
        assert_eq!(config.max_response_bytes, 512);
    }

    #[test]
    fn test_unparseable_value_rejected() {
        let err = OracleConfig::from_lookup(lookup(&[("ORACLE_MAX_CALLBACK_GAS", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidEnvVar("ORACLE_MAX_CALLBACK_GAS".to_string(), "lots".to_string())
        );
    }

    #[test]
    fn test_short_timeout_rejected() {
        let err = OracleConfig::from_lookup(lookup(&[("ORACLE_FULFILLMENT_TIMEOUT_SECS", "10")])).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }
}
