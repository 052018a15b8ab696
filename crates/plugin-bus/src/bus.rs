//! # Message Bus
//!
//! The public facade tying registry, subscriptions, dispatcher, worker pool
//! and correlator together.
//!
//! A [`MessageBus`] is an explicit instance. Clones share the same state, so
//! hand a clone to every plugin that needs one.

use crate::config::{BusConfig, DeliveryMode};
use crate::correlator::{reply_topic, sweep_task, Correlator};
use crate::dispatcher::Dispatcher;
use crate::message::Message;
use crate::metrics::{MetricsCollector, MetricsRecorder, MetricsSnapshot};
use crate::persistence::{FileMessageStore, InMemoryMessageStore, MessageStore};
use crate::pipeline::{erase_filter, erase_transform, Pipeline};
use crate::registry::TopicRegistry;
use crate::subscription::{
    ErasedHandler, HandlerFuture, SubscriptionHandle, SubscriptionKind, SubscriptionManager,
    SubscriptionSpec,
};
use crate::worker::{Outstanding, WorkerPool};
use bus_types::{BusError, Envelope, Payload, Priority, Topic, TopicPattern};
use futures::stream::{BoxStream, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-publish metadata.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub priority: Priority,
    /// Overrides the bus default delivery mode.
    pub mode: Option<DeliveryMode>,
    pub sender_id: Option<String>,
    pub ttl: Option<Duration>,
}

impl PublishOptions {
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = Some(mode);
        self
    }

    #[must_use]
    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Per-subscription settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// `Some(Sync)` makes every publish wait for this subscription.
    pub mode: Option<DeliveryMode>,
}

impl SubscribeOptions {
    #[must_use]
    pub fn with_mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// Builder for a [`MessageBus`] with custom store or metrics recorder.
#[derive(Default)]
pub struct MessageBusBuilder {
    config: BusConfig,
    store: Option<Arc<dyn MessageStore>>,
    recorder: Option<Arc<dyn MetricsRecorder>>,
}

impl MessageBusBuilder {
    #[must_use]
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Store used when persistence is enabled.
    ///
    /// Without one, the bus writes to `persistence_directory` if set and
    /// keeps messages in memory otherwise.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// External sink receiving every metric increment.
    #[must_use]
    pub fn recorder(mut self, recorder: Arc<dyn MetricsRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn build(self) -> Result<MessageBus, BusError> {
        let config = self.config;
        config.validate()?;

        let metrics = Arc::new(match self.recorder {
            Some(recorder) => MetricsCollector::with_recorder(recorder),
            None => MetricsCollector::new(),
        });

        let store: Option<Arc<dyn MessageStore>> = match (config.enable_persistence, self.store) {
            (false, _) => None,
            (true, Some(store)) => Some(store),
            (true, None) => match &config.persistence_directory {
                Some(directory) => {
                    Some(Arc::new(FileMessageStore::new(directory)) as Arc<dyn MessageStore>)
                }
                None => Some(Arc::new(InMemoryMessageStore::new()) as Arc<dyn MessageStore>),
            },
        };

        let closed = Arc::new(AtomicBool::new(false));
        let registry = Arc::new(TopicRegistry::new());
        let outstanding = Arc::new(Outstanding::default());
        let correlator = Arc::new(Correlator::new(metrics.clone()));
        let pool = Arc::new(WorkerPool::new(metrics.clone(), outstanding.clone()));

        let manager = Arc::new(SubscriptionManager::new(
            registry.clone(),
            closed.clone(),
            config.max_queue_size,
            config.overflow_policy,
        ));

        let dispatcher = Arc::new(Dispatcher {
            registry: registry.clone(),
            metrics: metrics.clone(),
            correlator: correlator.clone(),
            store: store.clone(),
            pool: pool.clone(),
            outstanding: outstanding.clone(),
            closed: closed.clone(),
            default_mode: config.default_delivery_mode,
            delivery_timeout: config.delivery_timeout,
        });

        debug!(
            worker_threads = config.worker_threads,
            max_queue_size = config.max_queue_size,
            overflow_policy = ?config.overflow_policy,
            persistence = store.is_some(),
            "Message bus created"
        );

        Ok(MessageBus {
            inner: Arc::new(BusInner {
                config,
                closed,
                registry,
                manager,
                dispatcher,
                metrics,
                correlator,
                pool,
                outstanding,
                store,
                background: Mutex::new(Vec::new()),
            }),
        })
    }
}

struct BusInner {
    config: BusConfig,
    closed: Arc<AtomicBool>,
    registry: Arc<TopicRegistry>,
    manager: Arc<SubscriptionManager>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<MetricsCollector>,
    correlator: Arc<Correlator>,
    pool: Arc<WorkerPool>,
    outstanding: Arc<Outstanding>,
    store: Option<Arc<dyn MessageStore>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        for task in self.background.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// In-process publish/subscribe and request/response bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Create a bus from a validated configuration.
    pub fn new(config: BusConfig) -> Result<Self, BusError> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> MessageBusBuilder {
        MessageBusBuilder::default()
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Spawn the worker pool and background tasks.
    ///
    /// Must run inside a tokio runtime. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), BusError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(BusError::BusClosed);
        }
        if !inner.pool.start(inner.config.worker_threads) {
            return Ok(());
        }

        let mut background = inner.background.lock();
        background.push(tokio::spawn(sweep_task(
            inner.correlator.clone(),
            inner.config.metrics_interval,
        )));
        if inner.config.enable_metrics {
            background.push(tokio::spawn(report_task(
                inner.metrics.clone(),
                inner.correlator.clone(),
                inner.config.metrics_interval,
            )));
        }

        info!(
            worker_threads = inner.config.worker_threads,
            metrics = inner.config.enable_metrics,
            "Message bus started"
        );
        Ok(())
    }

    /// Whether the bus has been started and not shut down.
    pub fn is_running(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire) && self.inner.pool.is_running()
    }

    /// Stop accepting work, drain queued deliveries for up to
    /// `shutdown_grace_period`, then cancel whatever is left.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Message bus shutting down");

        let unsubscribed = inner.manager.clear();

        let grace = inner.config.shutdown_grace_period;
        if inner.pool.is_running() && !inner.outstanding.wait_idle(grace).await {
            warn!(
                grace_ms = grace.as_millis() as u64,
                outstanding = inner.outstanding.get(),
                "Grace period elapsed with deliveries outstanding"
            );
        }

        let dropped = inner.pool.stop();
        let cancelled = inner.correlator.cancel_all();
        for task in inner.background.lock().drain(..) {
            task.abort();
        }

        info!(unsubscribed, dropped, cancelled, "Message bus stopped");
    }

    // ------------------------------------------------------------------
    // Publish
    // ------------------------------------------------------------------

    /// Publish with default options. Returns the number of accepted deliveries.
    pub async fn publish<T>(&self, topic: &str, payload: T) -> Result<usize, BusError>
    where
        T: Serialize + Any + Send + Sync,
    {
        self.publish_with(topic, payload, PublishOptions::default())
            .await
    }

    pub async fn publish_with<T>(
        &self,
        topic: &str,
        payload: T,
        options: PublishOptions,
    ) -> Result<usize, BusError>
    where
        T: Serialize + Any + Send + Sync,
    {
        self.publish_payload(topic, Payload::serializable(payload), options)
            .await
    }

    /// Publish an already wrapped payload, e.g. one that is not serializable.
    pub async fn publish_payload(
        &self,
        topic: &str,
        payload: Payload,
        options: PublishOptions,
    ) -> Result<usize, BusError> {
        let topic = Topic::parse(topic)?;
        let mut envelope = Envelope::new(topic, payload)
            .with_priority(options.priority)
            .with_ttl(options.ttl);
        if let Some(sender_id) = options.sender_id {
            envelope = envelope.with_sender(sender_id);
        }
        self.inner.dispatcher.dispatch(envelope, options.mode).await
    }

    // ------------------------------------------------------------------
    // Subscribe
    // ------------------------------------------------------------------

    /// Subscribe to one exact topic.
    pub fn subscribe<T, F, Fut>(
        &self,
        topic: &str,
        handler: F,
    ) -> Result<SubscriptionHandle, BusError>
    where
        T: Any + Send + Sync,
        F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe_with(topic, SubscribeOptions::default(), handler)
    }

    pub fn subscribe_with<T, F, Fut>(
        &self,
        topic: &str,
        options: SubscribeOptions,
        handler: F,
    ) -> Result<SubscriptionHandle, BusError>
    where
        T: Any + Send + Sync,
        F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let pattern = TopicPattern::exact(&Topic::parse(topic)?);
        self.register(pattern, Pipeline::for_type::<T>(), handler, options.mode)
    }

    /// Subscribe to every topic matching a wildcard pattern (`*`, trailing `**`).
    pub fn subscribe_pattern<T, F, Fut>(
        &self,
        pattern: &str,
        handler: F,
    ) -> Result<SubscriptionHandle, BusError>
    where
        T: Any + Send + Sync,
        F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let pattern = TopicPattern::parse(pattern)?;
        self.register(pattern, Pipeline::for_type::<T>(), handler, None)
    }

    /// Subscribe with a predicate evaluated before enqueue.
    pub fn subscribe_filtered<T, P, F, Fut>(
        &self,
        pattern: &str,
        filter: P,
        handler: F,
    ) -> Result<SubscriptionHandle, BusError>
    where
        T: Any + Send + Sync,
        P: Fn(&Message<T>) -> bool + Send + Sync + 'static,
        F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let pattern = TopicPattern::parse(pattern)?;
        let pipeline = Pipeline::for_type::<T>().with_filter(Some(erase_filter(filter)));
        self.register(pattern, pipeline, handler, None)
    }

    /// Subscribe with a payload transform applied before enqueue.
    ///
    /// A failing transform drops that delivery and counts it as a
    /// serialization failure.
    pub fn subscribe_transformed<T, X, F, Fut>(
        &self,
        pattern: &str,
        transform: X,
        handler: F,
    ) -> Result<SubscriptionHandle, BusError>
    where
        T: Any + Send + Sync,
        X: Fn(&Message<T>) -> anyhow::Result<T> + Send + Sync + 'static,
        F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let pattern = TopicPattern::parse(pattern)?;
        let pipeline = Pipeline::for_type::<T>().with_transform(Some(erase_transform(transform)));
        self.register(pattern, pipeline, handler, None)
    }

    /// Stop future deliveries to `handle`. Idempotent.
    pub fn unsubscribe(&self, handle: &mut SubscriptionHandle) {
        handle.unsubscribe();
    }

    fn register<T, F, Fut>(
        &self,
        pattern: TopicPattern,
        pipeline: Pipeline,
        handler: F,
        mode: Option<DeliveryMode>,
    ) -> Result<SubscriptionHandle, BusError>
    where
        T: Any + Send + Sync,
        F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: ErasedHandler = Arc::new(move |envelope: Envelope| -> HandlerFuture {
            match Message::<T>::from_envelope(envelope) {
                Ok(message) => handler(message).boxed(),
                Err(e) => async move { Err(anyhow::Error::new(e)) }.boxed(),
            }
        });

        self.inner.manager.create(SubscriptionSpec {
            pattern,
            kind: SubscriptionKind::Subscriber,
            pipeline,
            handler,
            mode,
        })
    }

    // ------------------------------------------------------------------
    // Request / response
    // ------------------------------------------------------------------

    /// Send a request and wait up to `timeout` for the response.
    ///
    /// Fails with `TimeoutExpired` when no responder answers in time,
    /// `DeliveryFailed` when the responder errors, and
    /// `SerializationFailed` when the response is not a `Resp`.
    pub async fn request<Req, Resp>(
        &self,
        topic: &str,
        payload: Req,
        timeout: Duration,
    ) -> Result<Resp, BusError>
    where
        Req: Any + Send + Sync,
        Resp: Clone + Any + Send + Sync,
    {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(BusError::BusClosed);
        }
        let topic = Topic::parse(topic)?;

        let deadline = tokio::time::Instant::now() + timeout;
        let (correlation_id, mut response) = inner.correlator.register(&topic, timeout);
        let envelope = Envelope::new(topic.clone(), Payload::new(payload))
            .with_correlation(correlation_id, Some(reply_topic(correlation_id)?));
        let timed_out = || BusError::TimeoutExpired {
            topic: topic.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };

        // A `Block` queue may not hold the request past its own deadline.
        let block_timeout = inner.config.delivery_timeout.min(timeout);
        if let Err(e) = inner
            .dispatcher
            .dispatch_within(envelope, Some(DeliveryMode::Async), block_timeout)
            .await
        {
            if tokio::time::Instant::now() >= deadline && inner.correlator.expire(correlation_id) {
                return Err(timed_out());
            }
            inner.correlator.cancel(correlation_id);
            return Err(e);
        }

        let result = match tokio::time::timeout_at(deadline, &mut response).await {
            Ok(received) => received.unwrap_or(Err(BusError::BusClosed)),
            Err(_) if inner.correlator.expire(correlation_id) => Err(timed_out()),
            // A response or shutdown won the race against the timer.
            Err(_) => response.await.unwrap_or(Err(BusError::BusClosed)),
        };

        let payload = result?;
        let value = payload.downcast_arc::<Resp>()?;
        Ok(Arc::unwrap_or_clone(value))
    }

    /// Answer requests on `pattern` with `handler`.
    ///
    /// A handler error (or panic) reaches the requester as `DeliveryFailed`.
    pub fn respond_to<Req, Resp, F, Fut>(
        &self,
        pattern: &str,
        handler: F,
    ) -> Result<SubscriptionHandle, BusError>
    where
        Req: Any + Send + Sync,
        Resp: Any + Send + Sync,
        F: Fn(Message<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        let pattern = TopicPattern::parse(pattern)?;
        let dispatcher: Weak<Dispatcher> = Arc::downgrade(&self.inner.dispatcher);
        let handler = Arc::new(handler);

        let erased: ErasedHandler = Arc::new(move |envelope: Envelope| -> HandlerFuture {
            let dispatcher = dispatcher.clone();
            let handler = Arc::clone(&handler);
            async move {
                let topic = envelope.topic.to_string();
                let message = Message::<Req>::from_envelope(envelope.clone())?;
                let outcome = AssertUnwindSafe(async move { handler(message).await })
                    .catch_unwind()
                    .await;

                let (reply, result) = match outcome {
                    Ok(Ok(response)) => (Ok(Payload::new(response)), Ok(())),
                    Ok(Err(e)) => (
                        Err(BusError::DeliveryFailed {
                            topic: topic.clone(),
                            reason: e.to_string(),
                        }),
                        Err(e),
                    ),
                    Err(_) => (
                        Err(BusError::DeliveryFailed {
                            topic: topic.clone(),
                            reason: "responder panicked".to_string(),
                        }),
                        Err(anyhow::anyhow!("responder panicked")),
                    ),
                };

                match dispatcher.upgrade() {
                    Some(dispatcher) => {
                        if let Err(e) = dispatcher.reply(&envelope, reply) {
                            debug!(topic, error = %e, "Responder invoked without a request");
                        }
                    }
                    None => debug!(topic, "Bus dropped before response was sent"),
                }
                result
            }
            .boxed()
        });

        self.inner.manager.create(SubscriptionSpec {
            pattern,
            kind: SubscriptionKind::Responder,
            pipeline: Pipeline::for_type::<Req>(),
            handler: erased,
            mode: None,
        })
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Distinct subscribed topics and patterns, sorted.
    pub fn topics(&self) -> Vec<String> {
        self.inner.registry.topics()
    }

    /// Subscriptions a publish on `topic` would reach.
    ///
    /// For a wildcard pattern, counts subscriptions registered with exactly
    /// that pattern.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        match Topic::parse(topic) {
            Ok(topic) => self.inner.registry.matches(&topic).len(),
            Err(_) => self.inner.registry.registered_count(topic),
        }
    }

    /// Point-in-time metrics.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Decode every persisted message on `topic` as `T`, in append order.
    pub async fn replay<T>(
        &self,
        topic: &str,
    ) -> Result<BoxStream<'static, Result<T, BusError>>, BusError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let Some(store) = &self.inner.store else {
            return Err(BusError::Persistence("persistence is disabled".to_string()));
        };
        let topic = Topic::parse(topic)?;
        let stored = store.replay(&topic).await?;
        Ok(stored
            .map(|message| {
                let message = message?;
                serde_json::from_slice::<T>(&message.payload).map_err(|e| {
                    BusError::SerializationFailed {
                        expected: std::any::type_name::<T>().to_string(),
                        actual: e.to_string(),
                    }
                })
            })
            .boxed())
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("running", &self.is_running())
            .field("subscriptions", &self.inner.manager.len())
            .field("pending_requests", &self.pending_requests())
            .finish()
    }
}

/// Log a metrics snapshot every `interval`.
async fn report_task(
    metrics: Arc<MetricsCollector>,
    correlator: Arc<Correlator>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let snapshot = metrics.snapshot();
        info!(
            topics = snapshot.topics.len(),
            published = snapshot.totals.published,
            delivered = snapshot.totals.delivered,
            dropped = snapshot.totals.dropped,
            failed = snapshot.totals.delivery_failed,
            serialization_failed = snapshot.totals.serialization_failed,
            expired = snapshot.totals.expired,
            requests = snapshot.requests_sent,
            request_timeouts = snapshot.request_timeouts,
            pending = correlator.pending_count(),
            "Message bus metrics"
        );
    }
}
