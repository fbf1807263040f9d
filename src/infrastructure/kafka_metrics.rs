use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    // Producer metrics
    pub messages_published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub publish_retries: AtomicU64,
    pub publish_latency: AtomicU64, // in milliseconds
    pub dead_lettered: AtomicU64,
    pub messages_lost: AtomicU64,

    // Relay metrics
    pub relay_ticks: AtomicU64,
    pub relay_ticks_skipped: AtomicU64,
    pub entries_relayed: AtomicU64,
    pub relay_failures: AtomicU64,
    pub relay_latency: AtomicU64, // in milliseconds

    // Consumer metrics
    pub messages_consumed: AtomicU64,
    pub messages_applied: AtomicU64,
    pub duplicates_skipped: AtomicU64,
    pub apply_failures: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub ack_failures: AtomicU64,
}

/// Point-in-time copy of the counters, for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_published: u64,
    pub publish_failures: u64,
    pub publish_retries: u64,
    pub dead_lettered: u64,
    pub messages_lost: u64,
    pub avg_publish_latency_ms: u64,
    pub entries_relayed: u64,
    pub relay_failures: u64,
    pub avg_relay_latency_ms: u64,
    pub messages_consumed: u64,
    pub messages_applied: u64,
    pub duplicates_skipped: u64,
    pub apply_failures: u64,
    pub messages_dropped: u64,
}

impl DeliveryMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_latency(&self, duration: Duration) {
        self.publish_latency
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Time spent relaying one outbox entry, broker transaction included.
    pub fn record_relay_latency(&self, duration: Duration) {
        self.relay_latency
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn get_average_publish_latency(&self) -> f64 {
        Self::average(&self.publish_latency, &self.messages_published)
    }

    pub fn get_average_relay_latency(&self) -> f64 {
        Self::average(&self.relay_latency, &self.entries_relayed)
    }

    fn average(total: &AtomicU64, count: &AtomicU64) -> f64 {
        let total = total.load(Ordering::Relaxed);
        let count = count.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    pub fn get_duplicate_rate(&self) -> f64 {
        let duplicates = self.duplicates_skipped.load(Ordering::Relaxed);
        let consumed = self.messages_consumed.load(Ordering::Relaxed);
        if consumed > 0 {
            duplicates as f64 / consumed as f64
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            publish_retries: self.publish_retries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            messages_lost: self.messages_lost.load(Ordering::Relaxed),
            avg_publish_latency_ms: self.get_average_publish_latency().round() as u64,
            entries_relayed: self.entries_relayed.load(Ordering::Relaxed),
            relay_failures: self.relay_failures.load(Ordering::Relaxed),
            avg_relay_latency_ms: self.get_average_relay_latency().round() as u64,
            messages_consumed: self.messages_consumed.load(Ordering::Relaxed),
            messages_applied: self.messages_applied.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            apply_failures: self.apply_failures.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
        }
    }
}
