//! # Service Runtime
//!
//! Composition root for a mesh service. Owns the one `ConnectionManager` of
//! the process and hands it to everything that needs messaging.
//!
//! ## Startup Sequence
//!
//! 1. Open the messaging connection (fatal on failure)
//! 2. Load the event handlers for this service
//! 3. Wire the handlers as consumers
//! 4. Start the periodic liveness sweep
//!
//! External traffic must not be accepted before `start` returns `Ok`.

pub mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use service_bus::{Broker, ConnectionManager, EventRegistry, HealthCheck};

pub use config::RuntimeConfig;

/// A running mesh service.
pub struct ServiceRuntime {
    config: RuntimeConfig,
    bus: Arc<ConnectionManager>,
    health: HealthCheck,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceRuntime {
    /// Build the runtime. Nothing is connected until `start`.
    pub fn new(config: RuntimeConfig, broker: Arc<dyn Broker>) -> Self {
        let bus = Arc::new(ConnectionManager::new(config.bus.clone(), broker));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            bus,
            health: HealthCheck::new(),
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Run the startup sequence.
    pub async fn start(&self) -> Result<()> {
        info!("===========================================");
        info!("  Service: {}", self.config.bus.service_name);
        info!("  Exchange: {}", self.config.bus.exchange);
        info!("===========================================");

        self.bus
            .open_connection()
            .await
            .context("Rabbit MQ failed")?;
        let service = self.bus.service()?;

        let registry = EventRegistry::load_events(service, &self.health)?;
        let consumers = registry.wire(&self.bus).await?;
        self.tasks.lock().extend(consumers);

        if let Some(interval) = self.config.health_check_interval {
            let sweep = self.spawn_health_sweep(interval);
            self.tasks.lock().push(sweep);
        }

        info!(service = %service, "Messaging layer ready");
        Ok(())
    }

    fn spawn_health_sweep(&self, interval: std::time::Duration) -> JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let health = self.health.clone();
        let mut shutdown = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = health.send_validate_check_on_servers(&bus).await {
                            warn!(error = %e, "Liveness sweep failed");
                            continue;
                        }
                        let pending = health.tracker().pending();
                        if pending.is_empty() {
                            info!("All services loaded");
                        } else {
                            info!(pending = ?pending, "Waiting for services");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Liveness sweep stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Readiness signal for the hosting process.
    pub fn is_ready(&self) -> bool {
        self.bus.is_connected() && self.health.has_all_services_loaded()
    }

    /// The process's connection manager.
    pub fn bus(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.bus)
    }

    pub fn health(&self) -> &HealthCheck {
        &self.health
    }

    /// Stop background work and close the connection.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown...");

        if let Err(e) = self.shutdown_tx.send(true) {
            error!("Failed to send shutdown signal: {}", e);
        }

        if let Err(e) = self.bus.close_connection().await {
            error!(error = %e, "Failed to close messaging connection");
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }

        info!("Shutdown complete");
    }
}
