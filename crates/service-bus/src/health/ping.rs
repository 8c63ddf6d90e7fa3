//! Ping: the request side of the health check.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::connection::{ConnectionManager, PublishOptions};
use crate::error::HandlerError;
use crate::handler::EventHandler;
use crate::services::{EventName, ServiceId};
use crate::transport::Message;

/// Content of a health check request.
pub const PING_CONTENT: &str = "ping";

/// Ping payload, JSON encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingMessage {
    /// Service that sent the request and expects the reply.
    pub from_service: ServiceId,
    pub content: String,
}

impl PingMessage {
    /// A health check request sent by `from_service`.
    #[must_use]
    pub fn request(from_service: ServiceId) -> Self {
        Self {
            from_service,
            content: PING_CONTENT.to_string(),
        }
    }

    #[must_use]
    pub fn is_request(&self) -> bool {
        self.content == PING_CONTENT
    }
}

/// Pong payload sent by `service`.
#[must_use]
pub fn pong_payload(service: ServiceId) -> String {
    format!("{service}:ok")
}

/// Answers health check requests with a Pong on the sender's reply queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingHandler;

impl PingHandler {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventHandler for PingHandler {
    fn event_name(&self) -> EventName {
        EventName::Ping
    }

    async fn handle_event(
        &self,
        bus: &ConnectionManager,
        message: Message,
    ) -> Result<(), HandlerError> {
        match serde_json::from_slice::<PingMessage>(&message.payload) {
            Ok(ping) if ping.is_request() => {
                let reply = pong_payload(bus.service()?);
                bus.send_to_queue(
                    EventName::Pong,
                    reply.as_bytes(),
                    Some(ping.from_service),
                    PublishOptions::default(),
                )
                .await?;
            }
            Ok(ping) => {
                debug!(from = %ping.from_service, content = %ping.content, "Ping without request content");
            }
            Err(e) => {
                warn!(error = %e, delivery_tag = message.delivery_tag, "Malformed ping payload");
            }
        }

        bus.ack(&message, false).await?;
        Ok(())
    }
}
