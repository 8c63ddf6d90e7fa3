//! # Health Check (Ping / Pong)
//!
//! ```text
//!  Service A                                   Service B
//!  ─────────                                   ─────────
//!  send_validate_check_on_servers()
//!    ──Ping {fromService: A}──→ queue(B, Ping)
//!                                              PingHandler
//!                 queue(A, Pong) ←──"B:ok"──
//!  PongHandler
//!    tracker[B] += 1
//! ```
//!
//! Per peer the state is Unconfirmed (count 0) or Confirmed (count >= 1);
//! the transition is one-way for the life of the process.

pub mod liveness;
pub mod ping;
pub mod pong;

use std::sync::Arc;

use tracing::info;

use crate::connection::{ConnectionManager, PublishOptions};
use crate::error::BusError;
use crate::services::EventName;

pub use liveness::LivenessTracker;
pub use ping::{pong_payload, PingHandler, PingMessage, PING_CONTENT};
pub use pong::{PongError, PongHandler, PongReceipt};

/// Liveness sweep and readiness predicate.
#[derive(Debug, Clone, Default)]
pub struct HealthCheck {
    tracker: Arc<LivenessTracker>,
}

impl HealthCheck {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn tracker(&self) -> Arc<LivenessTracker> {
        Arc::clone(&self.tracker)
    }

    #[must_use]
    pub fn ping_handler(&self) -> PingHandler {
        PingHandler::new()
    }

    #[must_use]
    pub fn pong_handler(&self) -> PongHandler {
        PongHandler::new(self.tracker())
    }

    /// Send one Ping to every known service except self.
    ///
    /// Returns the number of pings sent.
    pub async fn send_validate_check_on_servers(
        &self,
        bus: &ConnectionManager,
    ) -> Result<usize, BusError> {
        let service = bus.service()?;
        let payload = serde_json::to_vec(&PingMessage::request(service))?;

        let mut sent = 0;
        for peer in service.peers() {
            bus.send_to_queue(EventName::Ping, &payload, Some(peer), PublishOptions::default())
                .await?;
            sent += 1;
        }

        info!(service = %service, pings = sent, "Validate check sent to servers");
        Ok(sent)
    }

    /// True iff every known service has answered at least one ping.
    #[must_use]
    pub fn has_all_services_loaded(&self) -> bool {
        self.tracker.has_all_services_loaded()
    }
}
