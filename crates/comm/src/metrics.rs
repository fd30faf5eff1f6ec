//! Dispatch counters.
//!
//! All counters use relaxed atomics and are safe to update from the publisher,
//! timer, and response-delivery tasks concurrently.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters for one dispatch engine.
#[derive(Debug, Default)]
pub struct CommMetrics {
    /// Messages handed to the outbound sink.
    pub messages_published: Counter,
    /// Sink failures.
    pub publish_failures: Counter,
    /// Responses routed to a waiting request.
    pub responses_matched: Counter,
    /// Responses matching no waiting request.
    pub responses_ignored: Counter,
    /// Re-publications after a timeout.
    pub retries: Counter,
    /// Requests that ran out of retries.
    pub retries_exhausted: Counter,
    /// Responses that failed their request's check.
    pub mismatches: Counter,
    /// PDPs disabled after exhaustion or mismatch.
    pub pdps_disabled: Counter,
    /// Liveness probes sent by the heartbeat tracker.
    pub heartbeat_probes: Counter,
    /// Status messages discarded for age.
    pub expired_messages: Counter,
}

impl CommMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> CommMetricsSnapshot {
        CommMetricsSnapshot {
            messages_published: self.messages_published.get(),
            publish_failures: self.publish_failures.get(),
            responses_matched: self.responses_matched.get(),
            responses_ignored: self.responses_ignored.get(),
            retries: self.retries.get(),
            retries_exhausted: self.retries_exhausted.get(),
            mismatches: self.mismatches.get(),
            pdps_disabled: self.pdps_disabled.get(),
            heartbeat_probes: self.heartbeat_probes.get(),
            expired_messages: self.expired_messages.get(),
        }
    }
}

/// Plain copy of [`CommMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommMetricsSnapshot {
    pub messages_published: u64,
    pub publish_failures: u64,
    pub responses_matched: u64,
    pub responses_ignored: u64,
    pub retries: u64,
    pub retries_exhausted: u64,
    pub mismatches: u64,
    pub pdps_disabled: u64,
    pub heartbeat_probes: u64,
    pub expired_messages: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        counter.inc();
        counter.inc();
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_snapshot() {
        let metrics = CommMetrics::new();
        metrics.retries.inc();
        metrics.pdps_disabled.inc();
        let snap = metrics.snapshot();
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.pdps_disabled, 1);
        assert_eq!(snap.messages_published, 0);
    }
}
