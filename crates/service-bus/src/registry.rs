//! # Event Registry
//!
//! Maps each inbound event (and optional origin filter) to its handler.
//! Populated once at startup, then wired to the broker in a separate step.
//!
//! ```text
//! load_events(service)          wire(bus)
//! ┌────────────────────┐        ┌───────────────────────────────┐
//! │ (Ping, -) → Ping   │ ─────→ │ consume(queue(self, Ping))    │
//! │ (Pong, -) → Pong   │ ─────→ │ consume(queue(self, Pong))    │
//! │ service-specific…  │        └───────────────────────────────┘
//! └────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::connection::ConnectionManager;
use crate::error::BusError;
use crate::handler::EventHandler;
use crate::health::HealthCheck;
use crate::services::{EventName, ServiceId};
use crate::transport::ConsumeOptions;

type BindingKey = (EventName, Option<ServiceId>);

/// Handlers keyed by event name and origin filter.
#[derive(Default)]
pub struct EventRegistry {
    handlers: BTreeMap<BindingKey, Arc<dyn EventHandler>>,
    health: Option<HealthCheck>,
}

impl EventRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the handler set for `service`: the health-check pair plus any
    /// handlers specific to that service.
    pub fn load_events(service: ServiceId, health: &HealthCheck) -> Result<Self, BusError> {
        let mut registry = Self {
            health: Some(health.clone()),
            ..Self::default()
        };
        registry.register(Arc::new(health.ping_handler()))?;
        registry.register(Arc::new(health.pong_handler()))?;

        for handler in service_handlers(service) {
            registry.register(handler)?;
        }

        info!(service = %service, handlers = registry.len(), "Events loaded");
        Ok(registry)
    }

    /// Add a handler. Fails if one is already registered for the same event
    /// and origin filter.
    pub fn register(&mut self, handler: Arc<dyn EventHandler>) -> Result<(), BusError> {
        let key = (handler.event_name(), handler.origin_filter());
        if self.handlers.contains_key(&key) {
            return Err(BusError::DuplicateHandler {
                event: key.0,
                origin: key.1.map_or_else(|| "self".to_string(), |s| s.to_string()),
            });
        }
        self.handlers.insert(key, handler);
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, event: EventName, origin: Option<ServiceId>) -> bool {
        self.handlers.contains_key(&(event, origin))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Register every handler as a consumer. Handlers live until the
    /// connection closes.
    ///
    /// Once every consumer is in place this service counts as loaded in the
    /// health check the registry was built with.
    pub async fn wire(&self, bus: &Arc<ConnectionManager>) -> Result<Vec<JoinHandle<()>>, BusError> {
        let service = bus.service()?;
        let mut consumers = Vec::with_capacity(self.handlers.len());
        for ((event, origin), handler) in &self.handlers {
            let consumer = bus
                .consume(*event, Arc::clone(handler), *origin, ConsumeOptions::default())
                .await?;
            consumers.push(consumer);
        }

        if let Some(health) = &self.health {
            health.tracker().confirm_self(service);
        }
        Ok(consumers)
    }
}

/// Handlers that only some services run.
fn service_handlers(service: ServiceId) -> Vec<Arc<dyn EventHandler>> {
    match service {
        ServiceId::WebApiGateway
        | ServiceId::Backend
        | ServiceId::Users
        | ServiceId::Communities
        | ServiceId::CommunitiesGroups
        | ServiceId::Payments => Vec::new(),
    }
}
