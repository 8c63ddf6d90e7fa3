//! # Service Bus - Inter-Service Messaging
//!
//! One broker connection per process, a shared durable direct exchange,
//! deterministic per-service queue names, event handlers bound to inbound
//! events, and a ping/pong liveness protocol across the known services.
//!
//! ## Components
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ EventRegistry  (event, origin) → EventHandler                │
//! │   PingHandler / PongHandler / service-specific handlers      │
//! └───────────────────────────┬──────────────────────────────────┘
//!                             │ wire()
//!                             ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │ ConnectionManager                                            │
//! │   open / close / consume / send_to_queue / ack               │
//! │   QueueNameTemplate: (destination, event) → queue            │
//! └───────────────────────────┬──────────────────────────────────┘
//!                             ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Broker transport:  AmqpBroker (lapin) │ InMemoryBroker        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Startup
//!
//! ```ignore
//! let bus = Arc::new(ConnectionManager::new(BusConfig::from_env()?, Arc::new(AmqpBroker)));
//! bus.open_connection().await?;
//!
//! let health = HealthCheck::new();
//! let registry = EventRegistry::load_events(bus.service()?, &health)?;
//! registry.wire(&bus).await?;
//!
//! health.send_validate_check_on_servers(&bus).await?;
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod health;
pub mod queue_name;
pub mod registry;
pub mod services;
pub mod transport;

pub use config::BusConfig;
pub use connection::{ConnectionManager, PublishOptions};
pub use error::{BusError, ConfigError, HandlerError, TransportError};
pub use handler::EventHandler;
pub use health::{HealthCheck, LivenessTracker, PingHandler, PingMessage, PongHandler};
pub use queue_name::{resolve, QueueNameTemplate};
pub use registry::EventRegistry;
pub use services::{EventName, ServiceId};
pub use transport::{AmqpBroker, Broker, ConsumeOptions, InMemoryBroker, Message, MessageProperties};
