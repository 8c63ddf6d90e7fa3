//! # Error Types
//!
//! Configuration and connectivity failures are fatal at startup. Handler
//! failures are reported to the consumer loop, which leaves the message
//! unacknowledged.

use thiserror::Error;

use crate::services::EventName;

/// Invalid or missing configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Service identity is not one of the known services.
    #[error("Unknown service group: {0}")]
    UnknownService(String),

    /// Queue-name template lacks a required placeholder.
    #[error("Queue name template {template:?} is missing placeholder {placeholder}")]
    MissingPlaceholder {
        template: String,
        placeholder: &'static str,
    },

    /// Required environment variable is not set.
    #[error("Missing environment variable {0}")]
    MissingVariable(&'static str),

    /// Environment variable is set but cannot be parsed.
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

/// Failures reported by a broker implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not reach the broker.
    #[error("Failed to connect to broker: {0}")]
    Connect(String),

    /// Could not open a channel on an established connection.
    #[error("Failed to create channel: {0}")]
    Channel(String),

    /// A channel operation was rejected.
    #[error("{op} failed: {reason}")]
    Operation { op: &'static str, reason: String },

    /// Ack for a delivery tag that is not outstanding on the channel.
    #[error("Unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    /// The channel or connection has been closed.
    #[error("Channel closed")]
    Closed,
}

/// Errors surfaced by the connection manager and registry.
#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Startup could not establish the connection, channel or topology.
    #[error("Rabbit MQ failed: {0}")]
    Connectivity(#[source] TransportError),

    /// Operation attempted before `open_connection` or after `close_connection`.
    #[error("Not connected to broker")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Payload could not be encoded for publishing.
    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// A handler is already registered for this event and origin.
    #[error("Handler already registered for {event} (origin: {origin})")]
    DuplicateHandler { event: EventName, origin: String },
}

/// Failure inside `EventHandler::handle_event`.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Payload could not be processed and should be redelivered.
    #[error("Payload rejected: {0}")]
    Payload(String),
}
