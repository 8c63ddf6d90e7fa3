//! # Known Services and Events
//!
//! The closed sets of service identities and event names every process in the
//! mesh agrees on. Queue names are derived from these values, so the wire
//! names below must never change.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Identity of a service in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceId {
    /// Public web API gateway.
    #[serde(rename = "Web-API-Gateway")]
    WebApiGateway,
    /// Core backend.
    Backend,
    /// User accounts.
    Users,
    /// Communities.
    Communities,
    /// Community groups.
    #[serde(rename = "Communities-Groups")]
    CommunitiesGroups,
    /// Payments.
    Payments,
}

impl ServiceId {
    /// Every known service, in declaration order.
    pub const ALL: [ServiceId; 6] = [
        Self::WebApiGateway,
        Self::Backend,
        Self::Users,
        Self::Communities,
        Self::CommunitiesGroups,
        Self::Payments,
    ];

    /// Wire name used in queue names and payloads.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebApiGateway => "Web-API-Gateway",
            Self::Backend => "Backend",
            Self::Users => "Users",
            Self::Communities => "Communities",
            Self::CommunitiesGroups => "Communities-Groups",
            Self::Payments => "Payments",
        }
    }

    /// Every known service except `self`.
    pub fn peers(self) -> impl Iterator<Item = ServiceId> {
        Self::ALL.into_iter().filter(move |s| *s != self)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|service| service.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownService(s.to_string()))
    }
}

/// Event types exchanged between services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventName {
    /// Liveness check request.
    Ping,
    /// Liveness reply.
    Pong,
}

impl EventName {
    /// Every known event. One queue per event is asserted for each service.
    pub const ALL: [EventName; 2] = [Self::Ping, Self::Pong];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "Ping",
            Self::Pong => "Pong",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
