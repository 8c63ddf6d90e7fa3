//! # Connection Manager
//!
//! Owns the single broker connection, its channel and the shared exchange.
//! One instance is built by the composition root and shared by reference.
//!
//! ## Startup Sequence
//!
//! 1. Validate the configured service identity
//! 2. Connect to the broker
//! 3. Create the channel
//! 4. Assert the durable direct exchange
//! 5. Assert and bind one queue per known event for this service
//!
//! Every publish, consume and ack call goes through the one channel.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::config::BusConfig;
use crate::error::{BusError, TransportError};
use crate::handler::EventHandler;
use crate::services::{EventName, ServiceId};
use crate::transport::{
    Broker, BrokerChannel, BrokerConnection, ConsumeOptions, Message, MessageProperties,
};

/// Options for `send_to_queue`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    /// Ask the broker to persist the message.
    pub persistent: bool,
}

struct Session {
    service: ServiceId,
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

impl Session {
    /// Close the channel, then the connection even if the channel failed.
    /// Reports the first error.
    async fn close(self) -> Result<(), TransportError> {
        let channel = self.channel.close().await;
        let connection = self.connection.close().await;
        channel.and(connection)
    }
}

/// Process-wide messaging connection.
pub struct ConnectionManager {
    config: BusConfig,
    broker: Arc<dyn Broker>,
    session: Mutex<Option<Session>>,
}

impl ConnectionManager {
    /// Create a manager. Nothing is connected until `open_connection`.
    pub fn new(config: BusConfig, broker: Arc<dyn Broker>) -> Self {
        Self {
            config,
            broker,
            session: Mutex::new(None),
        }
    }

    /// Bus configuration.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Whether `open_connection` has completed and no close has happened since.
    pub fn is_connected(&self) -> bool {
        self.session.lock().is_some()
    }

    /// This process's validated identity.
    pub fn service(&self) -> Result<ServiceId, BusError> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.service)
            .ok_or(BusError::NotConnected)
    }

    fn channel(&self) -> Result<(ServiceId, Arc<dyn BrokerChannel>), BusError> {
        self.session
            .lock()
            .as_ref()
            .map(|s| (s.service, Arc::clone(&s.channel)))
            .ok_or(BusError::NotConnected)
    }

    fn queue_name(
        &self,
        service: ServiceId,
        event: EventName,
        origin: Option<ServiceId>,
    ) -> String {
        self.config
            .queue_name_template
            .resolve(origin.unwrap_or(service), event)
    }

    /// Queue name for `event`, scoped to `origin` when given, otherwise to self.
    pub fn resolve_queue(
        &self,
        event: EventName,
        origin: Option<ServiceId>,
    ) -> Result<String, BusError> {
        Ok(self.queue_name(self.service()?, event, origin))
    }

    /// Run the startup sequence.
    ///
    /// Any failure is fatal: the hosting process must not serve traffic
    /// without a working messaging layer.
    pub async fn open_connection(&self) -> Result<(), BusError> {
        let service: ServiceId = self.config.service_name.parse().map_err(|e| {
            error!(service = %self.config.service_name, "Unknown service group");
            BusError::Config(e)
        })?;

        if self.is_connected() {
            warn!(service = %service, "Connection already open");
            return Ok(());
        }

        let session = self.establish(service).await.map_err(|e| {
            warn!("Rabbit MQ handle failed, system shutting down");
            error!(error = %e, broker = %self.config.broker_url, "Messaging startup failed");
            BusError::Connectivity(e)
        })?;

        // A concurrent open may have finished first; keep its session.
        let surplus = {
            let mut current = self.session.lock();
            if current.is_some() {
                Some(session)
            } else {
                *current = Some(session);
                None
            }
        };
        if let Some(surplus) = surplus {
            warn!(service = %service, "Connection opened concurrently, closing duplicate");
            if let Err(e) = surplus.close().await {
                warn!(error = %e, "Failed to close duplicate connection");
            }
            return Ok(());
        }

        info!(
            service = %service,
            exchange = %self.config.exchange,
            "Messaging connection open"
        );
        Ok(())
    }

    async fn establish(&self, service: ServiceId) -> Result<Session, TransportError> {
        let connection: Arc<dyn BrokerConnection> =
            Arc::from(self.broker.connect(&self.config.broker_url).await?);
        let channel = connection.create_channel().await?;

        channel.declare_exchange(&self.config.exchange).await?;

        for event in EventName::ALL {
            let queue = self.queue_name(service, event, None);
            channel.declare_queue(&queue).await?;
            channel
                .bind_queue(&queue, &self.config.exchange, &queue)
                .await?;
            debug!(queue = %queue, event = %event, "Queue asserted and bound");
        }

        Ok(Session {
            service,
            connection,
            channel,
        })
    }

    /// Close the channel and then the connection. No-op when not connected.
    pub async fn close_connection(&self) -> Result<(), BusError> {
        let session = self.session.lock().take();
        let Some(session) = session else {
            debug!("Close requested with no open connection");
            return Ok(());
        };

        let service = session.service;
        session.close().await?;
        info!(service = %service, "Messaging connection closed");
        Ok(())
    }

    /// Register `handler` as the consumer of `event`.
    ///
    /// The queue is scoped to `origin` when given. Deliveries are handed to
    /// the handler one at a time; acknowledging is the handler's job.
    pub async fn consume(
        self: &Arc<Self>,
        event: EventName,
        handler: Arc<dyn EventHandler>,
        origin: Option<ServiceId>,
        options: ConsumeOptions,
    ) -> Result<JoinHandle<()>, BusError> {
        let (service, channel) = self.channel()?;
        let queue = self.queue_name(service, event, origin);
        if origin.is_some() {
            // Reply queues scoped to a peer are not part of the startup topology.
            channel.declare_queue(&queue).await?;
            channel
                .bind_queue(&queue, &self.config.exchange, &queue)
                .await?;
        }
        let mut deliveries = channel.consume(&queue, options).await?;
        info!(service = %service, queue = %queue, event = %event, "Consumer registered");

        let bus = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(delivery) = deliveries.next().await {
                let message = match delivery {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "Delivery error");
                        continue;
                    }
                };
                let delivery_tag = message.delivery_tag;
                if let Err(e) = handler.handle_event(&bus, message).await {
                    warn!(
                        queue = %queue,
                        delivery_tag,
                        error = %e,
                        "Handler failed, message left unacknowledged"
                    );
                }
            }
            debug!(queue = %queue, "Consumer stopped");
        }))
    }

    /// Publish `payload` to the queue for `event`, scoped to `origin` when given.
    ///
    /// Returns the broker's enqueue signal.
    pub async fn send_to_queue(
        &self,
        event: EventName,
        payload: &[u8],
        origin: Option<ServiceId>,
        options: PublishOptions,
    ) -> Result<bool, BusError> {
        let (service, channel) = self.channel()?;
        let queue = self.queue_name(service, event, origin);
        let timestamp = u64::try_from(Utc::now().timestamp()).unwrap_or_default();

        info!(service = %service, queue = %queue, timestamp, "Message sent");

        let properties = MessageProperties {
            timestamp: Some(timestamp),
            persistent: options.persistent,
        };
        Ok(channel.publish(&queue, payload, properties).await?)
    }

    /// Acknowledge `message`; with `cumulative`, also every earlier
    /// unacknowledged message on the channel.
    pub async fn ack(&self, message: &Message, cumulative: bool) -> Result<(), BusError> {
        let (_, channel) = self.channel()?;
        Ok(channel.ack(message.delivery_tag, cumulative).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::queue_name::QueueNameTemplate;
    use crate::transport::InMemoryBroker;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    const TEMPLATE: &str = "mesh.##DestServiceGroupName##.##EventName##";

    fn manager(service: &str, broker: &InMemoryBroker) -> Arc<ConnectionManager> {
        let config = BusConfig::new(
            service,
            "amqp://memory",
            "mesh",
            QueueNameTemplate::parse(TEMPLATE).unwrap(),
        );
        Arc::new(ConnectionManager::new(config, Arc::new(broker.clone())))
    }

    #[tokio::test]
    async fn test_open_accepts_every_known_service() {
        for service in ServiceId::ALL {
            let broker = InMemoryBroker::new();
            let bus = manager(service.as_str(), &broker);
            bus.open_connection().await.unwrap();
            assert_eq!(bus.service().unwrap(), service);
        }
    }

    #[tokio::test]
    async fn test_open_rejects_unknown_service() {
        let broker = InMemoryBroker::new();
        let bus = manager("Billing", &broker);

        let err = bus.open_connection().await.unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
        assert!(!bus.is_connected());
        assert!(!broker.has_exchange("mesh"));
    }

    #[tokio::test]
    async fn test_open_fails_when_broker_unreachable() {
        let broker = InMemoryBroker::new();
        broker.set_unreachable(true);
        let bus = manager("Backend", &broker);

        let err = bus.open_connection().await.unwrap_err();
        assert!(matches!(
            err,
            BusError::Connectivity(TransportError::Connect(_))
        ));
        assert!(!bus.is_connected());
    }

    #[tokio::test]
    async fn test_open_asserts_topology() {
        let broker = InMemoryBroker::new();
        let bus = manager("Backend", &broker);
        bus.open_connection().await.unwrap();

        assert!(broker.has_exchange("mesh"));
        assert_eq!(
            broker.queue_names(),
            vec!["mesh.Backend.Ping".to_string(), "mesh.Backend.Pong".to_string()]
        );
        assert_eq!(
            broker.bindings("mesh.Backend.Ping"),
            vec![("mesh".to_string(), "mesh.Backend.Ping".to_string())]
        );
    }

    #[tokio::test]
    async fn test_reopen_after_restart_is_idempotent() {
        let broker = InMemoryBroker::new();
        let first = manager("Backend", &broker);
        first.open_connection().await.unwrap();
        first.close_connection().await.unwrap();

        let second = manager("Backend", &broker);
        second.open_connection().await.unwrap();

        assert_eq!(broker.queue_names().len(), EventName::ALL.len());
        assert_eq!(broker.bindings("mesh.Backend.Pong").len(), 1);
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let broker = InMemoryBroker::new();
        let bus = manager("Backend", &broker);

        let sent = bus
            .send_to_queue(EventName::Ping, b"x", None, PublishOptions::default())
            .await;
        assert!(matches!(sent, Err(BusError::NotConnected)));
        assert!(matches!(bus.service(), Err(BusError::NotConnected)));
    }

    #[tokio::test]
    async fn test_close_without_connection_is_noop() {
        let broker = InMemoryBroker::new();
        let bus = manager("Backend", &broker);
        bus.close_connection().await.unwrap();
        bus.close_connection().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_resolves_origin_scoped_queue() {
        let broker = InMemoryBroker::new();
        let bus = manager("Backend", &broker);
        bus.open_connection().await.unwrap();

        let enqueued = bus
            .send_to_queue(
                EventName::Pong,
                b"Backend:ok",
                Some(ServiceId::Users),
                PublishOptions::default(),
            )
            .await
            .unwrap();
        assert!(enqueued);

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].queue, "mesh.Users.Pong");
        assert!(published[0].properties.timestamp.is_some());
    }

    #[tokio::test]
    async fn test_send_defaults_to_self_queue() {
        let broker = InMemoryBroker::new();
        let bus = manager("Payments", &broker);
        bus.open_connection().await.unwrap();

        bus.send_to_queue(EventName::Ping, b"{}", None, PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(broker.published()[0].queue, "mesh.Payments.Ping");
        assert_eq!(broker.ready_count("mesh.Payments.Ping"), 1);
    }

    /// Yields before connecting so concurrent opens interleave.
    struct YieldingBroker(InMemoryBroker);

    #[async_trait]
    impl Broker for YieldingBroker {
        async fn connect(&self, url: &str) -> Result<Box<dyn BrokerConnection>, TransportError> {
            tokio::task::yield_now().await;
            self.0.connect(url).await
        }
    }

    /// Hands deliveries to the test without acknowledging them.
    struct Collector(mpsc::UnboundedSender<Message>);

    #[async_trait]
    impl EventHandler for Collector {
        fn event_name(&self) -> EventName {
            EventName::Ping
        }

        async fn handle_event(
            &self,
            _bus: &ConnectionManager,
            message: Message,
        ) -> Result<(), HandlerError> {
            let _ = self.0.send(message);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_open_keeps_one_session() {
        let broker = InMemoryBroker::new();
        let config = BusConfig::new(
            "Backend",
            "amqp://memory",
            "mesh",
            QueueNameTemplate::parse(TEMPLATE).unwrap(),
        );
        let bus = ConnectionManager::new(config, Arc::new(YieldingBroker(broker.clone())));

        let (first, second) = tokio::join!(bus.open_connection(), bus.open_connection());
        first.unwrap();
        second.unwrap();

        assert!(bus.is_connected());
        assert_eq!(broker.open_channel_count(), 1);

        bus.close_connection().await.unwrap();
        assert_eq!(broker.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_close_shuts_connection_when_channel_close_fails() {
        let broker = InMemoryBroker::new();
        let bus = manager("Backend", &broker);
        bus.open_connection().await.unwrap();
        bus.consume(
            EventName::Ping,
            Arc::new(Collector(mpsc::unbounded_channel().0)),
            None,
            ConsumeOptions::default(),
        )
        .await
        .unwrap();

        broker.set_failing_channel_close(true);
        let err = bus.close_connection().await.unwrap_err();

        assert!(matches!(
            err,
            BusError::Transport(TransportError::Operation {
                op: "channel.close",
                ..
            })
        ));
        assert!(!bus.is_connected());
        assert_eq!(broker.open_channel_count(), 0);
        assert_eq!(broker.consumer_count("mesh.Backend.Ping"), 0);
    }

    #[tokio::test]
    async fn test_cumulative_ack_covers_earlier_deliveries() {
        let broker = InMemoryBroker::new();
        let bus = manager("Backend", &broker);
        bus.open_connection().await.unwrap();

        let (sender, mut deliveries) = mpsc::unbounded_channel();
        bus.consume(
            EventName::Ping,
            Arc::new(Collector(sender)),
            None,
            ConsumeOptions::default(),
        )
        .await
        .unwrap();

        for payload in [b"a", b"b", b"c"] {
            bus.send_to_queue(EventName::Ping, payload, None, PublishOptions::default())
                .await
                .unwrap();
        }
        let _first = deliveries.recv().await.unwrap();
        let second = deliveries.recv().await.unwrap();
        let third = deliveries.recv().await.unwrap();
        assert_eq!(broker.unacked_count(), 3);

        bus.ack(&second, true).await.unwrap();
        assert_eq!(broker.unacked_count(), 1);

        bus.ack(&third, false).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
    }
}
