//! # Broker Transport
//!
//! The seam between the connection manager and a concrete broker.
//!
//! ```text
//! Broker ──connect──→ BrokerConnection ──create_channel──→ BrokerChannel
//!                                                          │ declare_exchange
//!                                                          │ declare_queue / bind_queue
//!                                                          │ publish / consume / ack
//! ```
//!
//! - `amqp`: AMQP 0-9-1 via `lapin`
//! - `in_memory`: in-process broker for tests and local runs

pub mod amqp;
pub mod in_memory;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_stream::Stream;

use crate::error::TransportError;

pub use amqp::AmqpBroker;
pub use in_memory::InMemoryBroker;

/// Properties carried with a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Origin timestamp in unix seconds.
    pub timestamp: Option<u64>,
    /// Ask the broker to persist the message.
    pub persistent: bool,
}

/// A message delivered to a consumer.
///
/// Owned by the handler from delivery until it is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel-scoped tag used for acknowledgment.
    pub delivery_tag: u64,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Message properties.
    pub properties: MessageProperties,
}

/// Consumer registration options.
///
/// There is no auto-ack switch: every consumer acknowledges explicitly.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Consumer tag; generated when `None`.
    pub consumer_tag: Option<String>,
    /// Request exclusive access to the queue.
    pub exclusive: bool,
}

/// Stream of deliveries for one consumer.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message, TransportError>> + Send>>;

/// Entry point to a broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a transport connection.
    async fn connect(&self, url: &str) -> Result<Box<dyn BrokerConnection>, TransportError>;
}

/// An open broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError>;

    /// Close the connection.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A channel. All topology, publish, consume and ack calls go through it.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Assert a durable direct exchange. Re-asserting is a no-op.
    async fn declare_exchange(&self, exchange: &str) -> Result<(), TransportError>;

    /// Assert a durable queue. Re-asserting with the same parameters is a no-op.
    async fn declare_queue(&self, queue: &str) -> Result<(), TransportError>;

    /// Bind `queue` to `exchange` under `routing_key`.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Publish directly to `queue`. Returns the broker's enqueue signal.
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<bool, TransportError>;

    /// Register a manual-ack consumer on `queue`.
    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<MessageStream, TransportError>;

    /// Acknowledge `delivery_tag`, and every earlier outstanding tag when
    /// `multiple` is set.
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), TransportError>;

    /// Close the channel.
    async fn close(&self) -> Result<(), TransportError>;
}
