//! # Queue Name Resolution
//!
//! Queue names are derived from a configured template with two placeholders:
//! the destination service group and the event name.
//!
//! ```text
//! template:  "mesh.##DestServiceGroupName##.##EventName##"
//! resolve(template, Backend, Ping) -> "mesh.Backend.Ping"
//! ```
//!
//! A service consumes from queues resolved with its own identity as the
//! destination. Replies to a specific peer are published to queues resolved
//! with that peer's identity.

use crate::error::ConfigError;
use crate::services::{EventName, ServiceId};

/// Placeholder for the destination service group.
pub const DESTINATION_PLACEHOLDER: &str = "##DestServiceGroupName##";

/// Misspelled destination placeholder still found in deployed configuration.
pub const LEGACY_DESTINATION_PLACEHOLDER: &str = "##DestSericeGroupName##";

/// Placeholder for the event name.
pub const EVENT_PLACEHOLDER: &str = "##EventName##";

/// A validated queue-name template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNameTemplate {
    raw: String,
    destination_token: &'static str,
}

impl QueueNameTemplate {
    /// Validate that `template` contains both placeholders.
    pub fn parse(template: impl Into<String>) -> Result<Self, ConfigError> {
        let raw = template.into();

        let destination_token = if raw.contains(DESTINATION_PLACEHOLDER) {
            DESTINATION_PLACEHOLDER
        } else if raw.contains(LEGACY_DESTINATION_PLACEHOLDER) {
            LEGACY_DESTINATION_PLACEHOLDER
        } else {
            return Err(ConfigError::MissingPlaceholder {
                template: raw,
                placeholder: DESTINATION_PLACEHOLDER,
            });
        };

        if !raw.contains(EVENT_PLACEHOLDER) {
            return Err(ConfigError::MissingPlaceholder {
                template: raw,
                placeholder: EVENT_PLACEHOLDER,
            });
        }

        Ok(Self {
            raw,
            destination_token,
        })
    }

    /// Fill in the placeholders.
    #[must_use]
    pub fn resolve(&self, destination: ServiceId, event: EventName) -> String {
        self.raw
            .replace(self.destination_token, destination.as_str())
            .replace(EVENT_PLACEHOLDER, event.as_str())
    }

    /// The template as configured.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Resolve a queue name straight from a template string.
pub fn resolve(
    template: &str,
    destination: ServiceId,
    event: EventName,
) -> Result<String, ConfigError> {
    Ok(QueueNameTemplate::parse(template)?.resolve(destination, event))
}
