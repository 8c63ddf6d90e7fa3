//! # Runtime Configuration
//!
//! Messaging settings plus the runtime's own knobs, all read from the
//! environment.

use std::env;
use std::time::Duration;

use service_bus::{BusConfig, ConfigError};

/// Default period between liveness sweeps.
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

const HEALTH_CHECK_INTERVAL_VAR: &str = "MICROSERVICE_HEALTH_CHECK_INTERVAL_SECS";
const LOG_LEVEL_VAR: &str = "MICROSERVICE_LOG_LEVEL";

/// Complete runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Messaging configuration.
    pub bus: BusConfig,
    /// Period of the liveness sweep; `None` disables it.
    pub health_check_interval: Option<Duration>,
    /// Tracing filter directive.
    pub log_level: String,
}

impl RuntimeConfig {
    pub fn new(bus: BusConfig) -> Self {
        Self {
            bus,
            health_check_interval: Some(Duration::from_secs(DEFAULT_HEALTH_CHECK_INTERVAL_SECS)),
            log_level: "info".to_string(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - Messaging variables, see `BusConfig::from_env`
    /// - `MICROSERVICE_HEALTH_CHECK_INTERVAL_SECS`: sweep period, `0` disables (default: 30)
    /// - `MICROSERVICE_LOG_LEVEL` or `RUST_LOG`: log filter (default: info)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(BusConfig::from_env()?);

        if let Ok(value) = env::var(HEALTH_CHECK_INTERVAL_VAR) {
            config.health_check_interval = parse_interval(&value)?;
        }

        if let Ok(level) = env::var(LOG_LEVEL_VAR).or_else(|_| env::var("RUST_LOG")) {
            config.log_level = level;
        }

        Ok(config)
    }
}

fn parse_interval(value: &str) -> Result<Option<Duration>, ConfigError> {
    let secs: u64 = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name: HEALTH_CHECK_INTERVAL_VAR,
        value: value.to_string(),
    })?;
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}
