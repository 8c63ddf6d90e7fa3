//! # In-Memory Transport
//!
//! In-process broker with the parts of AMQP semantics the bus relies on:
//! durable idempotent declarations, queue bindings, per-channel delivery
//! tags, manual and cumulative acknowledgment, and requeue of unacknowledged
//! messages when a channel closes.
//!
//! Several services can share one `InMemoryBroker` to exercise the full
//! ping/pong exchange without a real broker.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use super::{
    Broker, BrokerChannel, BrokerConnection, ConsumeOptions, Message, MessageProperties,
    MessageStream,
};
use crate::error::TransportError;

type DeliverySender = mpsc::UnboundedSender<Result<Message, TransportError>>;

/// A message as it was handed to `publish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub queue: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Debug, Clone)]
struct Envelope {
    payload: Vec<u8>,
    properties: MessageProperties,
}

struct QueueConsumer {
    channel_id: u64,
    tag: String,
    sender: DeliverySender,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Envelope>,
    consumers: Vec<QueueConsumer>,
}

struct Unacked {
    queue: String,
    envelope: Envelope,
}

#[derive(Default)]
struct ChannelState {
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    closed: bool,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    bindings: HashSet<(String, String, String)>,
    channels: HashMap<u64, ChannelState>,
    next_channel_id: u64,
    published: Vec<PublishedMessage>,
}

impl BrokerState {
    fn open_channel(&mut self, channel_id: u64) -> Result<&mut ChannelState, TransportError> {
        match self.channels.get_mut(&channel_id) {
            Some(channel) if !channel.closed => Ok(channel),
            _ => Err(TransportError::Closed),
        }
    }

    /// Push ready messages of `queue` to its consumers.
    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };
            if state.consumers.is_empty() {
                return;
            }
            let Some(envelope) = state.ready.pop_front() else {
                return;
            };

            // Round-robin: the consumer that receives moves to the back.
            let consumer = state.consumers.remove(0);
            let Some(channel) = self.channels.get_mut(&consumer.channel_id) else {
                state.ready.push_front(envelope);
                continue;
            };

            channel.next_tag += 1;
            let tag = channel.next_tag;
            let message = Message {
                delivery_tag: tag,
                payload: envelope.payload.clone(),
                properties: envelope.properties.clone(),
            };

            if consumer.sender.send(Ok(message)).is_err() {
                debug!(queue, consumer = %consumer.tag, "Dropping closed consumer");
                state.ready.push_front(envelope);
                continue;
            }

            channel.unacked.insert(
                tag,
                Unacked {
                    queue: queue.to_string(),
                    envelope,
                },
            );
            state.consumers.push(consumer);
        }
    }

    /// Close a channel: drop its consumers and requeue what it never acked.
    fn close_channel(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if channel.closed {
            return;
        }
        channel.closed = true;
        let unacked = std::mem::take(&mut channel.unacked);

        for state in self.queues.values_mut() {
            state.consumers.retain(|c| c.channel_id != channel_id);
        }

        let mut touched = HashSet::new();
        for (_, entry) in unacked.into_iter().rev() {
            if let Some(state) = self.queues.get_mut(&entry.queue) {
                state.ready.push_front(entry.envelope);
                touched.insert(entry.queue);
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }
}

/// In-process broker. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    unreachable: Arc<AtomicBool>,
    failing_channel_close: Arc<AtomicBool>,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `connect` calls fail (or succeed again).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make `close` on channels fail (or succeed again). A failed close
    /// leaves the channel open.
    pub fn set_failing_channel_close(&self, failing: bool) {
        self.failing_channel_close.store(failing, Ordering::SeqCst);
    }

    /// Channels not closed yet, across all connections.
    #[must_use]
    pub fn open_channel_count(&self) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .filter(|c| !c.closed)
            .count()
    }

    #[must_use]
    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.state.lock().exchanges.contains(exchange)
    }

    /// Names of all declared queues, sorted.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// `(exchange, routing_key)` bindings of `queue`, sorted.
    #[must_use]
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        let mut bindings: Vec<_> = self
            .state
            .lock()
            .bindings
            .iter()
            .filter(|(_, q, _)| q == queue)
            .map(|(exchange, _, key)| (exchange.clone(), key.clone()))
            .collect();
        bindings.sort();
        bindings
    }

    /// Every message published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    /// Messages waiting in `queue` for a consumer.
    #[must_use]
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Consumers registered on `queue`.
    #[must_use]
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Delivered but unacknowledged messages across all open channels.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self, url: &str) -> Result<Box<dyn BrokerConnection>, TransportError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(format!("{url}: connection refused")));
        }
        Ok(Box::new(InMemoryConnection {
            broker: self.clone(),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

struct InMemoryConnection {
    broker: InMemoryBroker,
    channels: Mutex<Vec<u64>>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Channel("connection is closed".to_string()));
        }
        let id = {
            let mut state = self.broker.state.lock();
            state.next_channel_id += 1;
            let id = state.next_channel_id;
            state.channels.insert(id, ChannelState::default());
            id
        };
        self.channels.lock().push(id);
        Ok(Arc::new(InMemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        let ids = std::mem::take(&mut *self.channels.lock());
        let mut state = self.broker.state.lock();
        for id in ids {
            state.close_channel(id);
        }
        Ok(())
    }
}

struct InMemoryChannel {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.open_channel(self.id)?;
        state.exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.open_channel(self.id)?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.open_channel(self.id)?;
        if !state.exchanges.contains(exchange) {
            return Err(TransportError::Operation {
                op: "queue.bind",
                reason: format!("no exchange '{exchange}'"),
            });
        }
        if !state.queues.contains_key(queue) {
            return Err(TransportError::Operation {
                op: "queue.bind",
                reason: format!("no queue '{queue}'"),
            });
        }
        state.bindings.insert((
            exchange.to_string(),
            queue.to_string(),
            routing_key.to_string(),
        ));
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<bool, TransportError> {
        let mut state = self.broker.state.lock();
        state.open_channel(self.id)?;
        state.published.push(PublishedMessage {
            queue: queue.to_string(),
            payload: payload.to_vec(),
            properties: properties.clone(),
        });

        // Unroutable messages on the default exchange are dropped by the broker.
        let Some(target) = state.queues.get_mut(queue) else {
            warn!(queue, "Published to undeclared queue, message dropped");
            return Ok(true);
        };
        target.ready.push_back(Envelope {
            payload: payload.to_vec(),
            properties,
        });
        state.dispatch(queue);
        Ok(true)
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<MessageStream, TransportError> {
        let mut state = self.broker.state.lock();
        state.open_channel(self.id)?;

        let Some(target) = state.queues.get_mut(queue) else {
            return Err(TransportError::Operation {
                op: "basic.consume",
                reason: format!("no queue '{queue}'"),
            });
        };
        if options.exclusive && !target.consumers.is_empty() {
            return Err(TransportError::Operation {
                op: "basic.consume",
                reason: format!("queue '{queue}' already has consumers"),
            });
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let tag = options
            .consumer_tag
            .unwrap_or_else(|| format!("{queue}-{}", uuid::Uuid::new_v4()));
        target.consumers.push(QueueConsumer {
            channel_id: self.id,
            tag,
            sender,
        });
        state.dispatch(queue);

        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        let channel = state.open_channel(self.id)?;

        if !channel.unacked.contains_key(&delivery_tag) {
            return Err(TransportError::UnknownDeliveryTag(delivery_tag));
        }
        if multiple {
            let remaining = channel.unacked.split_off(&(delivery_tag + 1));
            channel.unacked = remaining;
        } else {
            channel.unacked.remove(&delivery_tag);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.broker.failing_channel_close.load(Ordering::SeqCst) {
            return Err(TransportError::Operation {
                op: "channel.close",
                reason: "channel close refused".to_string(),
            });
        }
        self.broker.state.lock().close_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_stream::StreamExt;

    async fn channel(broker: &InMemoryBroker) -> Arc<dyn BrokerChannel> {
        let connection = broker.connect("memory://").await.unwrap();
        connection.create_channel().await.unwrap()
    }

    async fn next(stream: &mut MessageStream) -> Message {
        timeout(Duration::from_millis(100), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended")
            .expect("delivery error")
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_connect() {
        let broker = InMemoryBroker::new();
        broker.set_unreachable(true);
        let result = broker.connect("amqp://nowhere").await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn test_declare_queue_is_idempotent() {
        let broker = InMemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_exchange("mesh").await.unwrap();
        ch.declare_queue("q").await.unwrap();
        ch.bind_queue("q", "mesh", "q").await.unwrap();

        ch.declare_queue("q").await.unwrap();
        ch.bind_queue("q", "mesh", "q").await.unwrap();

        assert_eq!(broker.queue_names(), vec!["q".to_string()]);
        assert_eq!(
            broker.bindings("q"),
            vec![("mesh".to_string(), "q".to_string())]
        );
    }

    #[tokio::test]
    async fn test_bind_requires_declared_queue() {
        let broker = InMemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_exchange("mesh").await.unwrap();
        assert!(ch.bind_queue("missing", "mesh", "missing").await.is_err());
    }

    #[tokio::test]
    async fn test_messages_wait_for_consumer() {
        let broker = InMemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_queue("q").await.unwrap();
        ch.publish("q", b"one", MessageProperties::default())
            .await
            .unwrap();
        assert_eq!(broker.ready_count("q"), 1);

        let mut stream = ch.consume("q", ConsumeOptions::default()).await.unwrap();
        let message = next(&mut stream).await;
        assert_eq!(message.payload, b"one");
        assert_eq!(message.delivery_tag, 1);
        assert_eq!(broker.ready_count("q"), 0);
        assert_eq!(broker.unacked_count(), 1);
    }

    #[tokio::test]
    async fn test_single_ack_only_acks_one() {
        let broker = InMemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_queue("q").await.unwrap();
        let mut stream = ch.consume("q", ConsumeOptions::default()).await.unwrap();
        for payload in [b"a", b"b", b"c"] {
            ch.publish("q", payload, MessageProperties::default())
                .await
                .unwrap();
        }
        let _first = next(&mut stream).await;
        let second = next(&mut stream).await;
        let _third = next(&mut stream).await;

        ch.ack(second.delivery_tag, false).await.unwrap();
        assert_eq!(broker.unacked_count(), 2);
    }

    #[tokio::test]
    async fn test_cumulative_ack_acks_earlier_messages() {
        let broker = InMemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_queue("q").await.unwrap();
        let mut stream = ch.consume("q", ConsumeOptions::default()).await.unwrap();
        for payload in [b"a", b"b", b"c"] {
            ch.publish("q", payload, MessageProperties::default())
                .await
                .unwrap();
        }
        let first = next(&mut stream).await;
        let second = next(&mut stream).await;
        let third = next(&mut stream).await;

        ch.ack(second.delivery_tag, true).await.unwrap();
        assert_eq!(broker.unacked_count(), 1);
        assert!(matches!(
            ch.ack(first.delivery_tag, false).await,
            Err(TransportError::UnknownDeliveryTag(_))
        ));
        ch.ack(third.delivery_tag, false).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_double_ack_is_rejected() {
        let broker = InMemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_queue("q").await.unwrap();
        let mut stream = ch.consume("q", ConsumeOptions::default()).await.unwrap();
        ch.publish("q", b"x", MessageProperties::default())
            .await
            .unwrap();
        let message = next(&mut stream).await;

        ch.ack(message.delivery_tag, false).await.unwrap();
        assert_eq!(
            ch.ack(message.delivery_tag, false).await,
            Err(TransportError::UnknownDeliveryTag(message.delivery_tag))
        );
    }

    #[tokio::test]
    async fn test_close_requeues_unacked() {
        let broker = InMemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_queue("q").await.unwrap();
        let mut stream = ch.consume("q", ConsumeOptions::default()).await.unwrap();
        ch.publish("q", b"x", MessageProperties::default())
            .await
            .unwrap();
        let _ = next(&mut stream).await;

        ch.close().await.unwrap();

        assert_eq!(broker.ready_count("q"), 1);
        assert_eq!(broker.consumer_count("q"), 0);
        assert!(ch.publish("q", b"y", MessageProperties::default()).await.is_err());

        let other = channel(&broker).await;
        let mut redelivered = other.consume("q", ConsumeOptions::default()).await.unwrap();
        assert_eq!(next(&mut redelivered).await.payload, b"x");
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_queue_is_recorded() {
        let broker = InMemoryBroker::new();
        let ch = channel(&broker).await;
        assert!(ch
            .publish("nowhere", b"x", MessageProperties::default())
            .await
            .unwrap());
        assert_eq!(broker.published().len(), 1);
        assert_eq!(broker.ready_count("nowhere"), 0);
    }
}
