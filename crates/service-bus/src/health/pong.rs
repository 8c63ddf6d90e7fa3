//! Pong: the reply side of the health check.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use super::liveness::LivenessTracker;
use crate::connection::ConnectionManager;
use crate::error::HandlerError;
use crate::handler::EventHandler;
use crate::services::{EventName, ServiceId};
use crate::transport::Message;

/// A parsed Pong delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongReceipt {
    pub received_from: ServiceId,
    /// Origin timestamp of the delivery, unix seconds.
    pub timestamp: Option<u64>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PongError {
    #[error("Pong payload is not UTF-8")]
    NotUtf8,
    #[error("Pong from unknown service {0:?}")]
    UnknownService(String),
}

impl PongReceipt {
    /// Parse a `"{service}:ok"` payload. Only the text before the first `:`
    /// is used.
    pub fn parse(message: &Message) -> Result<Self, PongError> {
        let text = std::str::from_utf8(&message.payload).map_err(|_| PongError::NotUtf8)?;
        let name = text.split_once(':').map_or(text, |(name, _)| name);
        let received_from = name
            .parse()
            .map_err(|_| PongError::UnknownService(name.to_string()))?;

        Ok(Self {
            received_from,
            timestamp: message.properties.timestamp,
        })
    }
}

/// Records replies in the liveness tracker.
#[derive(Debug, Clone)]
pub struct PongHandler {
    tracker: Arc<LivenessTracker>,
}

impl PongHandler {
    #[must_use]
    pub fn new(tracker: Arc<LivenessTracker>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl EventHandler for PongHandler {
    fn event_name(&self) -> EventName {
        EventName::Pong
    }

    async fn handle_event(
        &self,
        bus: &ConnectionManager,
        message: Message,
    ) -> Result<(), HandlerError> {
        match PongReceipt::parse(&message) {
            Ok(receipt) => {
                info!(
                    received_from = %receipt.received_from,
                    command = "Ping",
                    response = "Pong",
                    timestamp = ?receipt.timestamp,
                    "Health check reply"
                );
                let count = self.tracker.mark_responded(receipt.received_from);
                if count == 1 {
                    info!(service = %receipt.received_from, "Service confirmed");
                }
            }
            Err(e) => {
                warn!(error = %e, delivery_tag = message.delivery_tag, "Malformed pong payload");
            }
        }

        bus.ack(&message, false).await?;
        Ok(())
    }
}
