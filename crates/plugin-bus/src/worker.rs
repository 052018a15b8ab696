//! # Delivery Worker Pool
//!
//! `worker_threads` tokio tasks pull runnable subscription queues from a
//! shared scheduling channel. A worker takes one entry, runs the handler,
//! and puts the queue back on the channel if more entries wait. Since a
//! queue is scheduled at most once at a time, entries of one subscription
//! run one after another in FIFO order, each exactly once.

use crate::metrics::{MetricsCollector, Outcome};
use crate::queue::{DeliveryOutcome, QueueEntry};
use crate::subscription::{Subscription, SubscriptionId};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Count of accepted but not yet finished queue entries.
#[derive(Debug, Default)]
pub(crate) struct Outstanding {
    count: AtomicUsize,
    idle: Notify,
}

impl Outstanding {
    pub(crate) fn add(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn done(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub(crate) fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until nothing is outstanding. Returns false if `grace` elapsed first.
    pub(crate) async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.idle.notified();
            if self.get() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.get() == 0;
            }
        }
    }
}

/// State shared by the pool handle and its workers.
struct PoolShared {
    sender: mpsc::UnboundedSender<Arc<Subscription>>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<Subscription>>>,
    /// Queues currently handed to the pool, for forced drain on stop.
    active: DashMap<SubscriptionId, Arc<Subscription>>,
    metrics: Arc<MetricsCollector>,
    outstanding: Arc<Outstanding>,
}

/// Fixed-size pool of delivery tasks.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn new(metrics: Arc<MetricsCollector>, outstanding: Arc<Outstanding>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(PoolShared {
                sender,
                receiver: tokio::sync::Mutex::new(receiver),
                active: DashMap::new(),
                metrics,
                outstanding,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `count` workers. Does nothing if the pool is already running.
    pub(crate) fn start(&self, count: usize) -> bool {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return false;
        }
        for worker_id in 0..count {
            let shared = Arc::clone(&self.shared);
            workers.push(tokio::spawn(run_worker(worker_id, shared)));
        }
        info!(workers = count, "Delivery worker pool started");
        true
    }

    /// Whether workers have been spawned.
    pub fn is_running(&self) -> bool {
        !self.workers.lock().is_empty()
    }

    /// Hand a runnable queue to the workers.
    pub(crate) fn schedule(&self, subscription: Arc<Subscription>) {
        self.shared.schedule(subscription);
    }

    /// Abort every worker and drop whatever is still queued.
    ///
    /// Dropped entries are counted and their synchronous publishers are told
    /// the delivery failed. Returns the number of dropped entries.
    pub(crate) fn stop(&self) -> usize {
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in &workers {
            worker.abort();
        }
        if !workers.is_empty() {
            info!(workers = workers.len(), "Delivery worker pool stopped");
        }

        let queued: Vec<Arc<Subscription>> = self
            .shared
            .active
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.shared.active.clear();

        let mut dropped = 0;
        for subscription in queued {
            for mut entry in subscription.queue.drain() {
                self.shared
                    .metrics
                    .record(entry.envelope.topic.as_str(), Outcome::Dropped);
                entry.acknowledge(DeliveryOutcome::Failed);
                self.shared.outstanding.done();
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(dropped, "Dropped undelivered entries on shutdown");
        }
        dropped
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.lock().len())
            .field("active_queues", &self.shared.active.len())
            .field("outstanding", &self.shared.outstanding.get())
            .finish()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().drain(..) {
            worker.abort();
        }
    }
}

impl PoolShared {
    fn schedule(&self, subscription: Arc<Subscription>) {
        self.active
            .insert(subscription.id, Arc::clone(&subscription));
        // The receiver lives as long as `self`, so sending cannot fail.
        let _ = self.sender.send(subscription);
    }

    /// One turn on a scheduled queue: at most one entry.
    async fn run_turn(&self, subscription: Arc<Subscription>) {
        if let Some(entry) = subscription.queue.pop() {
            self.process_entry(&subscription, entry).await;
        }

        if subscription.queue.finish_turn() {
            self.schedule(subscription);
        } else {
            let id = subscription.id;
            self.active
                .remove_if(&id, |_, s| !s.queue.is_scheduled());
        }
    }

    async fn process_entry(&self, subscription: &Subscription, mut entry: QueueEntry) {
        let mut in_flight = InFlight::new(self, entry.envelope.topic.as_str());

        if entry.envelope.is_expired() {
            self.metrics
                .record(entry.envelope.topic.as_str(), Outcome::Expired);
            debug!(
                topic = %entry.envelope.topic,
                subscription_id = %subscription.id,
                age_ms = entry.envelope.age().as_millis() as u64,
                "Dropping expired message"
            );
            entry.acknowledge(DeliveryOutcome::Expired);
            in_flight.finish();
            return;
        }

        trace!(
            topic = %entry.envelope.topic,
            subscription_id = %subscription.id,
            queued_ms = entry.queued_for().as_millis() as u64,
            "Delivering message"
        );

        let handler = Arc::clone(&subscription.handler);
        let envelope = entry.envelope.clone();
        let result = AssertUnwindSafe(async move { handler(envelope).await })
            .catch_unwind()
            .await;

        let topic = entry.envelope.topic.as_str();
        let outcome = match result {
            Ok(Ok(())) => {
                self.metrics.record(topic, Outcome::Delivered);
                DeliveryOutcome::Delivered
            }
            Ok(Err(e)) => {
                self.metrics.record(topic, Outcome::DeliveryFailed);
                warn!(
                    topic,
                    subscription_id = %subscription.id,
                    error = %e,
                    "Handler failed"
                );
                DeliveryOutcome::Failed
            }
            Err(panic) => {
                self.metrics.record(topic, Outcome::DeliveryFailed);
                warn!(
                    topic,
                    subscription_id = %subscription.id,
                    panic = panic_message(panic.as_ref()),
                    "Handler panicked"
                );
                DeliveryOutcome::Failed
            }
        };
        entry.acknowledge(outcome);
        in_flight.finish();
    }
}

async fn run_worker(worker_id: usize, shared: Arc<PoolShared>) {
    debug!(worker_id, "Delivery worker started");
    loop {
        let next = {
            let mut receiver = shared.receiver.lock().await;
            receiver.recv().await
        };
        match next {
            Some(subscription) => shared.run_turn(subscription).await,
            None => break,
        }
    }
    debug!(worker_id, "Delivery worker exiting");
}

/// Accounts for an entry whose worker is aborted mid-delivery.
struct InFlight<'a> {
    shared: &'a PoolShared,
    topic: String,
    finished: bool,
}

impl<'a> InFlight<'a> {
    fn new(shared: &'a PoolShared, topic: &str) -> Self {
        Self {
            shared,
            topic: topic.to_string(),
            finished: false,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.shared.outstanding.done();
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.shared
                .metrics
                .record(&self.topic, Outcome::DeliveryFailed);
            self.shared.outstanding.done();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}
