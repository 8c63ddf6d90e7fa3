//! # Event Handlers
//!
//! Contract for consumers of inbound events. Building a handler has no side
//! effects; the registry wires it to its queue in a separate step.

use async_trait::async_trait;

use crate::connection::ConnectionManager;
use crate::error::HandlerError;
use crate::services::{EventName, ServiceId};
use crate::transport::Message;

/// A consumer of one event type.
///
/// Implementations parse the payload, may publish follow-up events through
/// `bus`, and must acknowledge the received message exactly once before
/// returning `Ok`. Returning `Err` leaves the message unacknowledged.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// The event this handler consumes.
    fn event_name(&self) -> EventName;

    /// Consume from the queue scoped to this peer instead of self.
    fn origin_filter(&self) -> Option<ServiceId> {
        None
    }

    /// Process one delivery.
    async fn handle_event(&self, bus: &ConnectionManager, message: Message)
        -> Result<(), HandlerError>;
}
