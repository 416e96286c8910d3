//! Destination counters.
//!
//! Drops never disturb the event loop; they are counted here instead.
//! Shared between the loop and handles through an `Arc`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counter. Relaxed ordering: statistics only.
#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

impl Serialize for Counter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.get().serialize(serializer)
    }
}

#[derive(Debug, Default, Serialize)]
pub struct DestinationStats {
    // Lookups
    pub lookups_started: Counter,
    pub lookups_joined: Counter,
    pub lookups_resolved: Counter,
    pub lookups_not_found: Counter,
    pub lookup_messages_sent: Counter,

    // Publishing
    pub publishes_sent: Counter,
    pub publishes_confirmed: Counter,
    pub publish_timeouts: Counter,

    // Dropped inbound traffic, by reason
    pub dropped_malformed: Counter,
    pub dropped_undecryptable: Counter,
    pub dropped_invalid_lease_set: Counter,
    pub dropped_unknown_protocol: Counter,
    pub dropped_unmatched_status: Counter,
    pub dropped_late_reply: Counter,
    pub dropped_unexpected: Counter,

    // Outbound application data that could not be sent
    pub dropped_outbound: Counter,
}

impl DestinationStats {
    /// Total inbound messages dropped for any reason.
    pub fn total_dropped(&self) -> u64 {
        self.dropped_malformed.get()
            + self.dropped_undecryptable.get()
            + self.dropped_invalid_lease_set.get()
            + self.dropped_unknown_protocol.get()
            + self.dropped_unmatched_status.get()
            + self.dropped_late_reply.get()
            + self.dropped_unexpected.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let stats = DestinationStats::default();
        assert_eq!(stats.total_dropped(), 0);
        assert_eq!(stats.lookups_started.get(), 0);
    }

    #[test]
    fn total_dropped_sums_inbound_reasons() {
        let stats = DestinationStats::default();
        stats.dropped_malformed.inc();
        stats.dropped_unknown_protocol.inc();
        stats.dropped_unknown_protocol.inc();
        stats.dropped_outbound.inc();
        assert_eq!(stats.total_dropped(), 3);
    }

    #[test]
    fn serializes_as_plain_numbers() {
        let stats = DestinationStats::default();
        stats.publishes_confirmed.inc();
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["publishes_confirmed"], 1);
        assert_eq!(json["dropped_malformed"], 0);
    }
}
