//! # Message Dispatcher
//!
//! Publish path, executed on the publisher's task:
//!
//! 1. reject when the bus is closed
//! 2. route `_bus.reply.*` envelopes to the correlator
//! 3. count `published` and persist (when enabled)
//! 4. match subscriptions, run each pipeline, enqueue
//! 5. in synchronous mode, await every accepted delivery
//!
//! A full queue only affects its own subscription. `QueueFull` is reported
//! after every match was attempted.

use crate::config::DeliveryMode;
use crate::correlator::{Correlator, Reply, ResponseResult};
use crate::metrics::{MetricsCollector, Outcome};
use crate::persistence::MessageStore;
use crate::pipeline::Prepared;
use crate::queue::{DeliveryOutcome, PushOutcome, QueueEntry};
use crate::registry::TopicRegistry;
use crate::subscription::Subscription;
use crate::worker::{Outstanding, WorkerPool};
use bus_types::{BusError, Envelope, Payload};
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Routes published envelopes to subscriber queues.
pub struct Dispatcher {
    pub(crate) registry: Arc<TopicRegistry>,
    pub(crate) metrics: Arc<MetricsCollector>,
    pub(crate) correlator: Arc<Correlator>,
    pub(crate) store: Option<Arc<dyn MessageStore>>,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) outstanding: Arc<Outstanding>,
    pub(crate) closed: Arc<AtomicBool>,
    pub(crate) default_mode: DeliveryMode,
    pub(crate) delivery_timeout: Duration,
}

/// Tally of one publish across its matched subscriptions.
#[derive(Debug, Default)]
struct Fanout {
    accepted: usize,
    rejected: usize,
    waits: Vec<oneshot::Receiver<DeliveryOutcome>>,
}

impl Dispatcher {
    /// Publish one envelope. Returns the number of accepted deliveries.
    pub async fn dispatch(
        &self,
        envelope: Envelope,
        mode: Option<DeliveryMode>,
    ) -> Result<usize, BusError> {
        self.dispatch_within(envelope, mode, self.delivery_timeout)
            .await
    }

    /// Like [`dispatch`](Self::dispatch), but a `Block` queue waits at most
    /// `block_timeout` for space.
    pub(crate) async fn dispatch_within(
        &self,
        envelope: Envelope,
        mode: Option<DeliveryMode>,
        block_timeout: Duration,
    ) -> Result<usize, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::BusClosed);
        }

        if envelope.topic.is_internal() {
            return self.route_reply(&envelope).map(usize::from);
        }

        let topic = envelope.topic.as_str();
        self.metrics.record(topic, Outcome::Published);
        self.persist(&envelope).await;

        let matched = self.registry.matches(&envelope.topic);
        if matched.is_empty() {
            debug!(topic, "No subscribers for topic");
            return Ok(0);
        }

        let mode = mode.unwrap_or(self.default_mode);
        let mut fanout = Fanout::default();
        for subscription in &matched {
            self.deliver(subscription, &envelope, mode, block_timeout, &mut fanout)
                .await;
        }

        trace!(
            topic,
            matched = matched.len(),
            accepted = fanout.accepted,
            rejected = fanout.rejected,
            "Dispatched message"
        );

        if !fanout.waits.is_empty() {
            let waited = tokio::time::timeout(self.delivery_timeout, join_all(fanout.waits)).await;
            if waited.is_err() {
                warn!(
                    topic,
                    timeout_ms = self.delivery_timeout.as_millis() as u64,
                    "Synchronous delivery timed out"
                );
                return Err(BusError::TimeoutExpired {
                    topic: topic.to_string(),
                    timeout_ms: self.delivery_timeout.as_millis() as u64,
                });
            }
        }

        if fanout.rejected > 0 {
            return Err(BusError::QueueFull {
                topic: topic.to_string(),
                rejected: fanout.rejected,
            });
        }
        Ok(fanout.accepted)
    }

    /// Run one subscription's pipeline and enqueue the result.
    async fn deliver(
        &self,
        subscription: &Arc<Subscription>,
        envelope: &Envelope,
        mode: DeliveryMode,
        block_timeout: Duration,
        fanout: &mut Fanout,
    ) {
        let topic = envelope.topic.as_str();
        let prepared = match subscription.pipeline.prepare(envelope) {
            Prepared::Pass(prepared) => prepared,
            Prepared::Filtered => return,
            Prepared::Failed(e) => {
                self.metrics.record(topic, Outcome::SerializationFailed);
                warn!(
                    topic,
                    subscription_id = %subscription.id,
                    error = %e,
                    "Message not deliverable to subscription"
                );
                return;
            }
        };

        let sync = mode == DeliveryMode::Sync || subscription.mode == Some(DeliveryMode::Sync);
        let (ack, wait) = if sync {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        self.outstanding.add();
        let outcome = subscription
            .queue
            .push(QueueEntry::new(prepared, ack), block_timeout)
            .await;

        match outcome {
            PushOutcome::Queued { schedule } => {
                fanout.accepted += 1;
                fanout.waits.extend(wait);
                if schedule {
                    self.pool.schedule(Arc::clone(subscription));
                }
            }
            PushOutcome::QueuedEvicting { mut evicted, schedule } => {
                self.metrics
                    .record(evicted.envelope.topic.as_str(), Outcome::Dropped);
                evicted.acknowledge(DeliveryOutcome::Failed);
                self.outstanding.done();
                debug!(
                    topic,
                    subscription_id = %subscription.id,
                    "Queue full, evicted oldest entry"
                );
                fanout.accepted += 1;
                fanout.waits.extend(wait);
                if schedule {
                    self.pool.schedule(Arc::clone(subscription));
                }
            }
            PushOutcome::Dropped(_) => {
                self.metrics.record(topic, Outcome::Dropped);
                self.outstanding.done();
                debug!(
                    topic,
                    subscription_id = %subscription.id,
                    "Queue full, dropped newest entry"
                );
            }
            PushOutcome::Rejected(_) => {
                self.metrics.record(topic, Outcome::Dropped);
                self.outstanding.done();
                fanout.rejected += 1;
                warn!(
                    topic,
                    subscription_id = %subscription.id,
                    capacity = subscription.queue.capacity(),
                    "Queue full, delivery rejected"
                );
            }
        }
    }

    /// Append a serializable payload to the store. Failures never fail the publish.
    async fn persist(&self, envelope: &Envelope) {
        let Some(store) = &self.store else {
            return;
        };
        if !envelope.payload.is_serializable() {
            trace!(topic = %envelope.topic, "Payload not serializable, not persisted");
            return;
        }
        let appended = match envelope.payload.encode() {
            Ok(bytes) => store.append(&envelope.topic, bytes, envelope.timestamp).await,
            Err(e) => Err(e),
        };
        if let Err(e) = appended {
            warn!(topic = %envelope.topic, error = %e, "Failed to persist message");
        }
    }

    /// Answer a request envelope through its reply topic.
    ///
    /// Returns whether a waiting requester received the result.
    pub(crate) fn reply(
        &self,
        request: &Envelope,
        result: ResponseResult,
    ) -> Result<bool, BusError> {
        let (Some(correlation_id), Some(reply_to)) = (request.correlation_id, &request.reply_to)
        else {
            return Err(BusError::InvalidMessage(format!(
                "message on '{}' is not a request",
                request.topic
            )));
        };
        let response = Envelope::new(reply_to.clone(), Payload::new(Reply(result)))
            .with_correlation(correlation_id, None);
        self.route_reply(&response)
    }

    /// Hand an envelope on a reply topic to the correlator.
    fn route_reply(&self, envelope: &Envelope) -> Result<bool, BusError> {
        let Some(correlation_id) = envelope.correlation_id else {
            return Err(BusError::InvalidMessage(format!(
                "reply on '{}' has no correlation id",
                envelope.topic
            )));
        };
        let reply = envelope.payload.downcast_ref::<Reply>()?;
        Ok(self.correlator.complete(correlation_id, reply.0.clone()))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("default_mode", &self.default_mode)
            .field("delivery_timeout", &self.delivery_timeout)
            .field("persistence", &self.store.is_some())
            .finish()
    }
}
