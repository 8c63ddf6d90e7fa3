//! # Bus Configuration
//!
//! Loaded from the environment by the hosting process. The service identity
//! is kept as configured and only validated when the connection is opened.

use std::env;

use crate::error::ConfigError;
use crate::queue_name::QueueNameTemplate;

/// Broker address used when none is configured.
pub const DEFAULT_BROKER_URL: &str = "amqp://127.0.0.1:5672/%2f";

/// Environment variable names.
pub mod vars {
    pub const SERVICE_NAME: &str = "MICROSERVICE_NAME";
    /// Spelling read by existing deployments; used when `SERVICE_NAME` is unset.
    pub const LEGACY_SERVICE_NAME: &str = "MICROSERVICE_Name";
    pub const BROKER_URL: &str = "MICROSERVICE_MSG_BROKER_URL";
    pub const EXCHANGE: &str = "MICROSERVICE_MSG_WORKER_EXCHANGE";
    pub const QUEUE_NAME_FORMAT: &str = "MICROSERVICE_MSG_QUE_NAME_FORMAT";
}

/// Messaging configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// This process's service identity, as configured.
    pub service_name: String,
    /// AMQP URI of the broker.
    pub broker_url: String,
    /// Name of the shared durable direct exchange.
    pub exchange: String,
    /// Queue-name template.
    pub queue_name_template: QueueNameTemplate,
}

impl BusConfig {
    pub fn new(
        service_name: impl Into<String>,
        broker_url: impl Into<String>,
        exchange: impl Into<String>,
        queue_name_template: QueueNameTemplate,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            broker_url: broker_url.into(),
            exchange: exchange.into(),
            queue_name_template,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MICROSERVICE_NAME` (or legacy `MICROSERVICE_Name`): service identity (required)
    /// - `MICROSERVICE_MSG_BROKER_URL`: broker URI (default: local broker)
    /// - `MICROSERVICE_MSG_WORKER_EXCHANGE`: exchange name (required)
    /// - `MICROSERVICE_MSG_QUE_NAME_FORMAT`: queue-name template (required)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let service_name = required(&lookup, vars::SERVICE_NAME)
            .or_else(|_| required(&lookup, vars::LEGACY_SERVICE_NAME))
            .map_err(|_| ConfigError::MissingVariable(vars::SERVICE_NAME))?;
        let exchange = required(&lookup, vars::EXCHANGE)?;
        let template = QueueNameTemplate::parse(required(&lookup, vars::QUEUE_NAME_FORMAT)?)?;
        let broker_url =
            lookup(vars::BROKER_URL).unwrap_or_else(|| DEFAULT_BROKER_URL.to_string());

        Ok(Self::new(service_name, broker_url, exchange, template))
    }
}

fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    match lookup(name) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVariable(name)),
    }
}
