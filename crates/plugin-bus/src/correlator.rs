//! # Request-Response Correlator
//!
//! Bridges `request` callers to responders running on the worker pool.
//!
//! Flow:
//! 1. `request` calls [`Correlator::register`] and gets a oneshot receiver
//! 2. The request envelope carries the correlation id and a reply topic
//!    `_bus.reply.<correlation_id>`
//! 3. The responder's answer is routed back by the dispatcher, which calls
//!    [`Correlator::complete`]
//! 4. The caller awaits the receiver or times out
//!
//! The first of response, timeout or shutdown removes the pending entry.
//! Whoever loses the race finds nothing to remove.

use crate::metrics::{MetricsCollector, RequestOutcome};
use bus_types::{BusError, CorrelationId, Payload, Topic};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Segment under the reserved prefix used for reply topics.
pub const REPLY_SEGMENT: &str = "reply";

/// Result delivered to a waiting requester.
pub type ResponseResult = Result<Payload, BusError>;

/// Payload published on a reply topic.
#[derive(Debug, Clone)]
pub(crate) struct Reply(pub(crate) ResponseResult);

/// Reply topic for a correlation id.
pub(crate) fn reply_topic(id: CorrelationId) -> Result<Topic, BusError> {
    Topic::internal(&format!("{REPLY_SEGMENT}.{id}"))
}

/// A request waiting for its response.
struct PendingRequest {
    sender: oneshot::Sender<ResponseResult>,
    created_at: Instant,
    deadline: Instant,
    topic: String,
}

/// Table of in-flight requests keyed by correlation id.
pub struct Correlator {
    pending: DashMap<CorrelationId, PendingRequest>,
    metrics: Arc<MetricsCollector>,
}

impl Correlator {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self {
            pending: DashMap::new(),
            metrics,
        }
    }

    /// Register a pending request and get a receiver for the response.
    pub fn register(
        &self,
        topic: &Topic,
        timeout: Duration,
    ) -> (CorrelationId, oneshot::Receiver<ResponseResult>) {
        let correlation_id = CorrelationId::new();
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();

        self.pending.insert(
            correlation_id,
            PendingRequest {
                sender: tx,
                created_at: now,
                deadline: now + timeout,
                topic: topic.to_string(),
            },
        );
        self.metrics.record_request(RequestOutcome::Sent);

        debug!(
            correlation_id = %correlation_id,
            topic = %topic,
            timeout_ms = timeout.as_millis() as u64,
            "Registered pending request"
        );

        (correlation_id, rx)
    }

    /// Hand a response to its requester.
    ///
    /// Returns false when the request is unknown, already answered, timed
    /// out or abandoned; the response is then discarded and counted.
    pub fn complete(&self, correlation_id: CorrelationId, result: ResponseResult) -> bool {
        let Some((_, pending)) = self.pending.remove(&correlation_id) else {
            self.metrics.record_request(RequestOutcome::Discarded);
            debug!(
                correlation_id = %correlation_id,
                "Discarding response for unknown or expired correlation ID"
            );
            return false;
        };

        let response_time = pending.created_at.elapsed();
        match pending.sender.send(result) {
            Ok(()) => {
                self.metrics.record_request(RequestOutcome::Answered);
                debug!(
                    correlation_id = %correlation_id,
                    topic = pending.topic,
                    response_time_ms = response_time.as_millis() as u64,
                    "Completed pending request"
                );
                true
            }
            Err(_) => {
                // Requester went away (its future was dropped).
                self.metrics.record_request(RequestOutcome::Discarded);
                debug!(
                    correlation_id = %correlation_id,
                    topic = pending.topic,
                    "Pending request receiver dropped"
                );
                false
            }
        }
    }

    /// Remove a request whose caller observed its timeout.
    ///
    /// Returns false when a response (or shutdown) won the race.
    pub fn expire(&self, correlation_id: CorrelationId) -> bool {
        match self.pending.remove(&correlation_id) {
            Some((_, pending)) => {
                self.metrics.record_request(RequestOutcome::TimedOut);
                warn!(
                    correlation_id = %correlation_id,
                    topic = pending.topic,
                    elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
                    "Request timed out"
                );
                true
            }
            None => false,
        }
    }

    /// Fail every request whose deadline has passed. Returns how many.
    pub fn expire_overdue(&self) -> usize {
        let now = Instant::now();
        let overdue: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut removed = 0;
        for id in overdue {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let timeout_ms = pending
                    .deadline
                    .duration_since(pending.created_at)
                    .as_millis() as u64;
                let _ = pending.sender.send(Err(BusError::TimeoutExpired {
                    topic: pending.topic,
                    timeout_ms,
                }));
                self.metrics.record_request(RequestOutcome::TimedOut);
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, "Cleaned up expired pending requests");
        }
        removed
    }

    /// Cancel one pending request with `BusClosed`.
    pub fn cancel(&self, correlation_id: CorrelationId) -> bool {
        match self.pending.remove(&correlation_id) {
            Some((_, pending)) => {
                let _ = pending.sender.send(Err(BusError::BusClosed));
                self.metrics.record_request(RequestOutcome::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Cancel every pending request (bus shutdown). Returns how many.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| *e.key()).collect();
        let cancelled = ids.into_iter().filter(|id| self.cancel(*id)).count();
        if cancelled > 0 {
            warn!(cancelled, "Cancelled pending requests on shutdown");
        }
        cancelled
    }

    /// Number of requests still waiting.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Periodically fail overdue requests whose callers never observed the timeout.
pub(crate) async fn sweep_task(correlator: Arc<Correlator>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        correlator.expire_overdue();
    }
}
