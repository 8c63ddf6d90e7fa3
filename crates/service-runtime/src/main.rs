//! # Service Runtime
//!
//! Entry point for one mesh service process.
//!
//! ## Startup Sequence
//!
//! 1. Load configuration from the environment
//! 2. Open the broker connection and wire the event handlers
//! 3. Run the liveness sweep until Ctrl+C
//! 4. Close the connection

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use service_bus::AmqpBroker;
use service_runtime::{RuntimeConfig, ServiceRuntime};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RuntimeConfig::from_env().context("Invalid messaging configuration")?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(&config.log_level))
        .with_target(true)
        .with_thread_ids(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let runtime = ServiceRuntime::new(config, Arc::new(AmqpBroker));
    runtime.start().await?;

    info!("Service is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    runtime.shutdown().await;

    Ok(())
}
