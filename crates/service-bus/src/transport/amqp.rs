//! # AMQP Transport
//!
//! `lapin`-backed broker driven by the tokio runtime. Channels run in
//! publisher-confirm mode.

use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio_stream::StreamExt;
use tracing::debug;
use uuid::Uuid;

use super::{
    Broker, BrokerChannel, BrokerConnection, ConsumeOptions, Message, MessageProperties,
    MessageStream,
};
use crate::error::TransportError;

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Delivery mode flag for persistent messages.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Broker reached over AMQP 0-9-1.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpBroker;

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, url: &str) -> Result<Box<dyn BrokerConnection>, TransportError> {
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let connection = Connection::connect(url, properties)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(Box::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        // Publisher confirms: `publish` reports the broker's ack or nack.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connection
            .close(REPLY_SUCCESS, "Bye")
            .await
            .map_err(|e| op_error("connection.close", e))
    }
}

struct AmqpChannel {
    channel: Channel,
}

fn op_error(op: &'static str, error: lapin::Error) -> TransportError {
    TransportError::Operation {
        op,
        reason: error.to_string(),
    }
}

fn into_message(delivery: lapin::message::Delivery) -> Message {
    let properties = MessageProperties {
        timestamp: *delivery.properties.timestamp(),
        persistent: *delivery.properties.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
    };
    Message {
        delivery_tag: delivery.delivery_tag,
        payload: delivery.data,
        properties,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), TransportError> {
        let options = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(exchange, ExchangeKind::Direct, options, FieldTable::default())
            .await
            .map_err(|e| op_error("exchange.declare", e))
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), TransportError> {
        let options = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };
        let declared = self
            .channel
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map_err(|e| op_error("queue.declare", e))?;
        debug!(
            queue = %declared.name(),
            messages = declared.message_count(),
            consumers = declared.consumer_count(),
            "Queue asserted"
        );
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| op_error("queue.bind", e))
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<bool, TransportError> {
        let mut amqp_properties = BasicProperties::default();
        if let Some(timestamp) = properties.timestamp {
            amqp_properties = amqp_properties.with_timestamp(timestamp);
        }
        if properties.persistent {
            amqp_properties = amqp_properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        // Default exchange: routing key is the queue name.
        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                amqp_properties,
            )
            .await
            .map_err(|e| op_error("basic.publish", e))?;
        let confirmation = confirm.await.map_err(|e| op_error("basic.publish", e))?;

        Ok(!confirmation.is_nack())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<MessageStream, TransportError> {
        let consumer_tag = options
            .consumer_tag
            .unwrap_or_else(|| format!("{queue}-{}", Uuid::new_v4()));
        let consume_options = BasicConsumeOptions {
            no_ack: false,
            exclusive: options.exclusive,
            ..BasicConsumeOptions::default()
        };

        let consumer = self
            .channel
            .basic_consume(queue, &consumer_tag, consume_options, FieldTable::default())
            .await
            .map_err(|e| op_error("basic.consume", e))?;

        let stream = consumer.map(|delivery| {
            delivery
                .map(into_message)
                .map_err(|e| op_error("basic.deliver", e))
        });
        Ok(Box::pin(stream))
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|e| op_error("basic.ack", e))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.channel
            .close(REPLY_SUCCESS, "Bye")
            .await
            .map_err(|e| op_error("channel.close", e))
    }
}
