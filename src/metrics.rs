//! Per-context counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const NANOSECONDS_PER_MICROSECOND: u128 = 1_000;

/// Traffic and health counters for one [`MidiContext`](crate::MidiContext).
///
/// All counters are relaxed atomics; a [`MetricsSnapshot`] is consistent per
/// field, not across fields.
#[derive(Debug, Default)]
pub struct Metrics {
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    decode_errors: AtomicU64,
    protocol_violations: AtomicU64,
    sequence_gaps: AtomicU64,
    journal_recoveries: AtomicU64,
    duplicates: AtomicU64,
    queue_overflows: AtomicU64,
    active_peers: AtomicU64,
    dispatch_latency_total_ns: AtomicU64,
    dispatch_latency_max_ns: AtomicU64,
}

impl Metrics {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_sequence_gap(&self) {
        self.sequence_gaps.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_journal_recovery(&self) {
        self.journal_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_queue_overflow(&self) {
        self.queue_overflows.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_peer_connected(&self) {
        self.active_peers.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_peer_disconnected(&self) {
        // Saturate: a stop racing a timeout may report the same peer twice.
        let _ = self
            .active_peers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    #[inline]
    pub(crate) fn record_dispatch_latency(&self, duration: Duration) {
        let nanos = duration
            .as_nanos()
            .min(u128::from(u64::MAX))
            .try_into()
            .unwrap_or(u64::MAX);
        self.dispatch_latency_total_ns
            .fetch_add(nanos, Ordering::Relaxed);
        update_max(&self.dispatch_latency_max_ns, nanos);
    }

    /// Copy the current counter values
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps.load(Ordering::Relaxed),
            journal_recoveries: self.journal_recoveries.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            queue_overflows: self.queue_overflows.load(Ordering::Relaxed),
            active_peers: self.active_peers.load(Ordering::Relaxed),
            dispatch_latency_total_ns: self.dispatch_latency_total_ns.load(Ordering::Relaxed),
            dispatch_latency_max_ns: self.dispatch_latency_max_ns.load(Ordering::Relaxed),
        }
    }
}

fn update_max(target: &AtomicU64, candidate: u64) {
    let mut current = target.load(Ordering::Relaxed);
    while candidate > current {
        match target.compare_exchange_weak(
            current,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(old) => current = old,
        }
    }
}

/// Point-in-time copy of [`Metrics`].
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSnapshot {
    /// Messages accepted for dispatch
    pub messages_received: u64,
    /// Messages handed to a transport
    pub messages_sent: u64,
    /// Sends to unknown devices and deliveries after shutdown
    pub messages_dropped: u64,
    /// Inbound byte sequences that failed to decode
    pub decode_errors: u64,
    /// Malformed RTP-MIDI packets
    pub protocol_violations: u64,
    /// RTP-MIDI sequence gaps detected
    pub sequence_gaps: u64,
    /// Gaps repaired from a recovery journal
    pub journal_recoveries: u64,
    /// Duplicate or late RTP-MIDI packets discarded
    pub duplicates: u64,
    /// Messages dropped because the dispatch queue was full
    pub queue_overflows: u64,
    /// Connected RTP-MIDI peers
    pub active_peers: u64,
    /// Sum of enqueue-to-delivery latency
    pub dispatch_latency_total_ns: u64,
    /// Largest enqueue-to-delivery latency
    pub dispatch_latency_max_ns: u64,
}

impl MetricsSnapshot {
    /// Average enqueue-to-delivery latency in microseconds.
    #[must_use]
    pub fn avg_dispatch_latency_us(&self) -> Option<u64> {
        average_microseconds(self.dispatch_latency_total_ns, self.messages_received)
    }
}

fn average_microseconds(total_ns: u64, count: u64) -> Option<u64> {
    if count == 0 {
        return None;
    }

    let total_ns_u128 = u128::from(total_ns);
    u64::try_from(total_ns_u128 / (u128::from(count) * NANOSECONDS_PER_MICROSECOND)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = Metrics::new();
        metrics.record_received();
        metrics.record_received();
        metrics.record_sequence_gap();
        metrics.record_peer_connected();
        metrics.record_peer_disconnected();
        metrics.record_peer_disconnected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_received, 2);
        assert_eq!(snapshot.sequence_gaps, 1);
        assert_eq!(snapshot.active_peers, 0);
    }

    #[test]
    fn test_latency_average_and_max() {
        let metrics = Metrics::new();
        metrics.record_received();
        metrics.record_received();
        metrics.record_dispatch_latency(Duration::from_micros(10));
        metrics.record_dispatch_latency(Duration::from_micros(30));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.avg_dispatch_latency_us(), Some(20));
        assert_eq!(snapshot.dispatch_latency_max_ns, 30_000);
        assert_eq!(MetricsSnapshot::default().avg_dispatch_latency_us(), None);
    }
}
