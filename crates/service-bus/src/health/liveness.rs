//! Per-service response counters backing the readiness predicate.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::services::ServiceId;

/// Confirmed health-check replies per known service.
///
/// Holds exactly one counter per known service, created at zero. Counters
/// only ever grow.
#[derive(Debug)]
pub struct LivenessTracker {
    counters: RwLock<BTreeMap<ServiceId, u64>>,
}

impl LivenessTracker {
    #[must_use]
    pub fn new() -> Self {
        let counters = ServiceId::ALL.into_iter().map(|s| (s, 0)).collect();
        Self {
            counters: RwLock::new(counters),
        }
    }

    /// Record one reply from `service`. Returns the new count.
    pub fn mark_responded(&self, service: ServiceId) -> u64 {
        let mut counters = self.counters.write();
        let count = counters.entry(service).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Mark this process's own service as up.
    ///
    /// Self is never pinged, so its counter is confirmed once the local
    /// consumers are wired. Leaves a non-zero counter untouched.
    pub fn confirm_self(&self, service: ServiceId) {
        let mut counters = self.counters.write();
        let count = counters.entry(service).or_insert(0);
        if *count == 0 {
            *count = 1;
        }
    }

    /// Replies received from `service`.
    #[must_use]
    pub fn count(&self, service: ServiceId) -> u64 {
        self.counters.read().get(&service).copied().unwrap_or(0)
    }

    /// True once every known service has replied at least once.
    #[must_use]
    pub fn has_all_services_loaded(&self) -> bool {
        self.counters.read().values().all(|count| *count >= 1)
    }

    /// Services that have not replied yet.
    #[must_use]
    pub fn pending(&self) -> Vec<ServiceId> {
        self.counters
            .read()
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(service, _)| *service)
            .collect()
    }

    /// Copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<ServiceId, u64> {
        self.counters.read().clone()
    }
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new()
    }
}
