//! Metrics collection for bus traffic
//!
//! Counts published, delivered, dropped and failed messages per topic, plus
//! request/response totals. Every increment is also forwarded to a
//! [`MetricsRecorder`], which is how external systems (Prometheus in
//! `bus-telemetry`) observe the bus.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-topic outcome being counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Published,
    Delivered,
    Dropped,
    DeliveryFailed,
    SerializationFailed,
    Expired,
}

impl Outcome {
    /// Label used by exporters.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Published => "published",
            Self::Delivered => "delivered",
            Self::Dropped => "dropped",
            Self::DeliveryFailed => "delivery_failed",
            Self::SerializationFailed => "serialization_failed",
            Self::Expired => "expired",
        }
    }
}

/// Request/response event being counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestOutcome {
    Sent,
    Answered,
    TimedOut,
    Discarded,
    Cancelled,
}

impl RequestOutcome {
    /// Label used by exporters.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Answered => "answered",
            Self::TimedOut => "timed_out",
            Self::Discarded => "discarded",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Trait for custom metrics recording implementations
///
/// Implement this trait to integrate with external metrics systems.
pub trait MetricsRecorder: Send + Sync {
    /// A message on `topic` reached `outcome`.
    fn record(&self, topic: &str, outcome: Outcome);

    /// A request/response event.
    fn record_request(&self, outcome: RequestOutcome);
}

/// No-op metrics recorder for when no exporter is attached
#[derive(Debug, Default)]
pub struct NoOpMetrics;

impl MetricsRecorder for NoOpMetrics {
    fn record(&self, _: &str, _: Outcome) {}
    fn record_request(&self, _: RequestOutcome) {}
}

#[derive(Debug, Default)]
struct TopicCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    delivery_failed: AtomicU64,
    serialization_failed: AtomicU64,
    expired: AtomicU64,
}

impl TopicCounters {
    fn counter(&self, outcome: Outcome) -> &AtomicU64 {
        match outcome {
            Outcome::Published => &self.published,
            Outcome::Delivered => &self.delivered,
            Outcome::Dropped => &self.dropped,
            Outcome::DeliveryFailed => &self.delivery_failed,
            Outcome::SerializationFailed => &self.serialization_failed,
            Outcome::Expired => &self.expired,
        }
    }

    fn snapshot(&self) -> TopicMetrics {
        TopicMetrics {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivery_failed: self.delivery_failed.load(Ordering::Relaxed),
            serialization_failed: self.serialization_failed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct RequestCounters {
    sent: AtomicU64,
    answered: AtomicU64,
    timed_out: AtomicU64,
    discarded: AtomicU64,
    cancelled: AtomicU64,
}

/// Thread-safe metrics collector shared by every bus component.
pub struct MetricsCollector {
    topics: DashMap<String, TopicCounters>,
    requests: RequestCounters,
    recorder: Arc<dyn MetricsRecorder>,
}

impl MetricsCollector {
    /// Collector without an external recorder.
    pub fn new() -> Self {
        Self::with_recorder(Arc::new(NoOpMetrics))
    }

    /// Collector forwarding every increment to `recorder`.
    pub fn with_recorder(recorder: Arc<dyn MetricsRecorder>) -> Self {
        Self {
            topics: DashMap::new(),
            requests: RequestCounters::default(),
            recorder,
        }
    }

    /// Count one message outcome on `topic`.
    pub fn record(&self, topic: &str, outcome: Outcome) {
        let counted = match self.topics.get(topic) {
            Some(counters) => {
                counters.counter(outcome).fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        };
        // The shard read guard must be released before `entry` takes the write lock.
        if !counted {
            self.topics
                .entry(topic.to_string())
                .or_default()
                .counter(outcome)
                .fetch_add(1, Ordering::Relaxed);
        }
        self.recorder.record(topic, outcome);
    }

    /// Count one request/response event.
    pub fn record_request(&self, outcome: RequestOutcome) {
        let counter = match outcome {
            RequestOutcome::Sent => &self.requests.sent,
            RequestOutcome::Answered => &self.requests.answered,
            RequestOutcome::TimedOut => &self.requests.timed_out,
            RequestOutcome::Discarded => &self.requests.discarded,
            RequestOutcome::Cancelled => &self.requests.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.recorder.record_request(outcome);
    }

    /// Counters for a single topic, if it has seen traffic.
    pub fn topic(&self, topic: &str) -> Option<TopicMetrics> {
        self.topics.get(topic).map(|c| c.snapshot())
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let topics: BTreeMap<String, TopicMetrics> = self
            .topics
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();

        let totals = topics.values().fold(TopicMetrics::default(), |acc, t| acc + *t);

        MetricsSnapshot {
            topics,
            totals,
            requests_sent: self.requests.sent.load(Ordering::Relaxed),
            responses_received: self.requests.answered.load(Ordering::Relaxed),
            request_timeouts: self.requests.timed_out.load(Ordering::Relaxed),
            responses_discarded: self.requests.discarded.load(Ordering::Relaxed),
            requests_cancelled: self.requests.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.topics.clear();
        self.requests.sent.store(0, Ordering::Relaxed);
        self.requests.answered.store(0, Ordering::Relaxed);
        self.requests.timed_out.store(0, Ordering::Relaxed);
        self.requests.discarded.store(0, Ordering::Relaxed);
        self.requests.cancelled.store(0, Ordering::Relaxed);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("topics", &self.topics.len())
            .finish()
    }
}

/// Point-in-time counters for one topic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TopicMetrics {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub delivery_failed: u64,
    pub serialization_failed: u64,
    pub expired: u64,
}

impl std::ops::Add for TopicMetrics {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            published: self.published + rhs.published,
            delivered: self.delivered + rhs.delivered,
            dropped: self.dropped + rhs.dropped,
            delivery_failed: self.delivery_failed + rhs.delivery_failed,
            serialization_failed: self.serialization_failed + rhs.serialization_failed,
            expired: self.expired + rhs.expired,
        }
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub topics: BTreeMap<String, TopicMetrics>,
    pub totals: TopicMetrics,
    pub requests_sent: u64,
    pub responses_received: u64,
    pub request_timeouts: u64,
    pub responses_discarded: u64,
    pub requests_cancelled: u64,
}
