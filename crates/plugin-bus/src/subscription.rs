//! # Subscriptions
//!
//! The [`SubscriptionManager`] owns every live [`Subscription`]; the topic
//! registry only holds weak references. Callers receive a move-only
//! [`SubscriptionHandle`] which unsubscribes exactly once, either explicitly
//! or when dropped.

use crate::config::DeliveryMode;
use crate::pipeline::Pipeline;
use crate::queue::SubscriberQueue;
use crate::registry::TopicRegistry;
use bus_types::{BusError, Envelope, TopicPattern};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::debug;

/// Future returned by an erased handler.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Type-erased handler invoked by the worker pool.
pub(crate) type ErasedHandler = Arc<dyn Fn(Envelope) -> HandlerFuture + Send + Sync>;

/// Unique, monotonic subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub(crate) u64);

impl SubscriptionId {
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Plain subscriber or request responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Subscriber,
    Responder,
}

/// One active registration.
pub struct Subscription {
    pub(crate) id: SubscriptionId,
    pub(crate) pattern: TopicPattern,
    pub(crate) kind: SubscriptionKind,
    pub(crate) pipeline: Pipeline,
    pub(crate) handler: ErasedHandler,
    pub(crate) mode: Option<DeliveryMode>,
    pub(crate) queue: SubscriberQueue,
    pub(crate) created_at: Instant,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    /// Delivery mode requested at subscribe time, if any.
    pub fn mode(&self) -> Option<DeliveryMode> {
        self.mode
    }

    pub fn queue(&self) -> &SubscriberQueue {
        &self.queue
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern.as_str())
            .field("kind", &self.kind)
            .field("pipeline", &self.pipeline)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Everything needed to create a subscription except its id and queue.
pub(crate) struct SubscriptionSpec {
    pub(crate) pattern: TopicPattern,
    pub(crate) kind: SubscriptionKind,
    pub(crate) pipeline: Pipeline,
    pub(crate) handler: ErasedHandler,
    pub(crate) mode: Option<DeliveryMode>,
}

/// Creates and destroys subscriptions.
pub struct SubscriptionManager {
    next_id: AtomicU64,
    subscriptions: DashMap<SubscriptionId, Arc<Subscription>>,
    registry: Arc<TopicRegistry>,
    closed: Arc<AtomicBool>,
    queue_capacity: usize,
    overflow_policy: crate::config::OverflowPolicy,
}

impl SubscriptionManager {
    pub(crate) fn new(
        registry: Arc<TopicRegistry>,
        closed: Arc<AtomicBool>,
        queue_capacity: usize,
        overflow_policy: crate::config::OverflowPolicy,
    ) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscriptions: DashMap::new(),
            registry,
            closed,
            queue_capacity,
            overflow_policy,
        }
    }

    /// Register a subscription and hand out its handle.
    pub(crate) fn create(
        self: &Arc<Self>,
        spec: SubscriptionSpec,
    ) -> Result<SubscriptionHandle, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::BusClosed);
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscription = Arc::new(Subscription {
            id,
            pattern: spec.pattern,
            kind: spec.kind,
            pipeline: spec.pipeline,
            handler: spec.handler,
            mode: spec.mode,
            queue: SubscriberQueue::new(self.queue_capacity, self.overflow_policy),
            created_at: Instant::now(),
        });

        self.subscriptions.insert(id, Arc::clone(&subscription));
        self.registry.insert(&subscription);

        // A shutdown racing with this call must not leave a live registration.
        if self.closed.load(Ordering::Acquire) {
            let _ = self.destroy(id);
            return Err(BusError::BusClosed);
        }

        debug!(
            subscription_id = %id,
            pattern = %subscription.pattern,
            kind = ?subscription.kind,
            "Subscription created"
        );

        Ok(SubscriptionHandle {
            id,
            pattern: subscription.pattern.clone(),
            manager: Arc::downgrade(self),
            active: true,
        })
    }

    /// Remove a subscription. Errors only when the id is unknown.
    pub fn destroy(&self, id: SubscriptionId) -> Result<(), BusError> {
        let Some((_, subscription)) = self.subscriptions.remove(&id) else {
            return Err(BusError::SubscriberNotFound(id.as_u64()));
        };
        self.registry.remove(id, &subscription.pattern);
        debug!(
            subscription_id = %id,
            pattern = %subscription.pattern,
            queued = subscription.queue.len(),
            "Subscription destroyed"
        );
        Ok(())
    }

    /// Remove every subscription (bus shutdown). Returns how many were removed.
    pub(crate) fn clear(&self) -> usize {
        let ids: Vec<SubscriptionId> = self.subscriptions.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter(|id| self.destroy(*id).is_ok())
            .count()
    }

    /// Whether `id` is still registered.
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.subscriptions.contains_key(&id)
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        self.subscriptions.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

/// Move-only capability controlling one subscription.
///
/// Dropping the handle unsubscribes. Use [`SubscriptionHandle::detach`] to
/// keep the subscription alive until the bus shuts down.
#[must_use = "dropping a SubscriptionHandle unsubscribes immediately"]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    pattern: TopicPattern,
    manager: Weak<SubscriptionManager>,
    active: bool,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Topic or pattern this handle was created for.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Whether the subscription is still registered.
    pub fn is_active(&self) -> bool {
        self.active
            && self
                .manager
                .upgrade()
                .is_some_and(|manager| manager.contains(self.id))
    }

    /// Stop future deliveries. Entries already queued still run.
    ///
    /// Idempotent: later calls do nothing.
    pub fn unsubscribe(&mut self) {
        if !std::mem::replace(&mut self.active, false) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            let _ = manager.destroy(self.id);
        }
    }

    /// Give up the handle without unsubscribing.
    pub fn detach(mut self) -> SubscriptionId {
        self.active = false;
        self.id
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("pattern", &self.pattern.as_str())
            .field("active", &self.active)
            .finish()
    }
}
