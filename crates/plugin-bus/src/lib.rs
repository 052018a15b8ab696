//! # Plugin Bus
//!
//! In-process publish/subscribe and request/response message bus that lets
//! independently loaded plugins exchange typed messages without holding
//! references to one another.
//!
//! ## Architecture
//!
//! ```text
//!  publish()                                      worker pool
//!     │                                          ┌──────────┐
//!     ▼                                          │ worker 0 │
//! ┌────────────┐  match  ┌──────────┐  enqueue   │ worker 1 │  handler(msg)
//! │ Dispatcher │ ──────► │ Registry │ ─────────► │   ...    │ ─────────────►
//! └────────────┘         └──────────┘  per-sub   └──────────┘
//!     │ _bus.reply.*                   queues
//!     ▼
//! ┌────────────┐
//! │ Correlator │ ◄── request() waits here
//! └────────────┘
//! ```
//!
//! - **Registry** (`registry`): exact topics and `*` / trailing `**` patterns
//! - **Subscriptions** (`subscription`): ids, handles, ownership
//! - **Pipeline** (`pipeline`): type check, filter, transform before enqueue
//! - **Queues** (`queue`): bounded FIFO per subscription with overflow policy
//! - **Workers** (`worker`): fixed pool, one queue per worker at a time
//! - **Correlator** (`correlator`): request/response matching with deadlines
//! - **Metrics** (`metrics`): per-topic counters and an external recorder hook
//! - **Persistence** (`persistence`): append/replay port
//!
//! ## Guarantees
//!
//! - Per (topic, subscriber) FIFO delivery; no global order
//! - Each queued entry runs at most once; every drop is counted
//! - Handler failures never reach the publisher; `request` is the only call
//!   that surfaces asynchronous failure
//!
//! ## Usage Example
//!
//! ```ignore
//! use plugin_bus::{BusConfig, Message, MessageBus};
//! use std::time::Duration;
//!
//! let bus = MessageBus::new(BusConfig::default())?;
//! bus.start()?;
//!
//! let _sub = bus.subscribe("system.plugins", |msg: Message<String>| async move {
//!     tracing::info!(plugin = %*msg, "Plugin loaded");
//!     Ok(())
//! })?;
//! bus.publish("system.plugins", "audio".to_string()).await?;
//!
//! let _responder = bus.respond_to("compute.double", |msg: Message<i64>| async move {
//!     Ok(*msg * 2)
//! })?;
//! let doubled: i64 = bus.request("compute.double", 21i64, Duration::from_millis(100)).await?;
//!
//! bus.shutdown().await;
//! ```

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod bus;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod message;
pub mod metrics;
pub mod persistence;
mod pipeline;
pub mod queue;
pub mod registry;
pub mod subscription;
pub mod worker;

pub use bus::{MessageBus, MessageBusBuilder, PublishOptions, SubscribeOptions};
pub use config::{BusConfig, DeliveryMode, OverflowPolicy, MAX_WORKER_THREADS};
pub use correlator::{Correlator, ResponseResult};
pub use message::Message;
pub use metrics::{
    MetricsCollector, MetricsRecorder, MetricsSnapshot, NoOpMetrics, Outcome, RequestOutcome,
    TopicMetrics,
};
pub use persistence::{
    FileMessageStore, InMemoryMessageStore, MessageStore, ReplayStream, StoredMessage,
};
pub use queue::{DeliveryOutcome, SubscriberQueue};
pub use registry::TopicRegistry;
pub use subscription::{
    HandlerFuture, Subscription, SubscriptionHandle, SubscriptionId, SubscriptionKind,
    SubscriptionManager,
};

pub use bus_types::{
    BusError, CorrelationId, Envelope, Payload, Priority, Topic, TopicPattern, TypeTag,
};
