//! Bus configuration and validation.
//!
//! # Example
//!
//! ```ignore
//! use plugin_bus::{BusConfig, OverflowPolicy};
//!
//! let config = BusConfig::default()
//!     .with_worker_threads(2)
//!     .with_max_queue_size(64)
//!     .with_overflow_policy(OverflowPolicy::Block);
//! config.validate()?;
//! ```

use bus_types::BusError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound on worker tasks.
pub const MAX_WORKER_THREADS: usize = 256;

/// What happens when a subscriber queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued entry and enqueue the new one.
    #[default]
    DropOldest,
    /// Discard the new entry.
    DropNewest,
    /// Refuse the new entry and report `QueueFull` to the publisher.
    Reject,
    /// Wait up to `delivery_timeout` for room, then report `QueueFull`.
    Block,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "dropoldest" => Ok(Self::DropOldest),
            "dropnewest" => Ok(Self::DropNewest),
            "reject" => Ok(Self::Reject),
            "block" => Ok(Self::Block),
            other => Err(BusError::InvalidConfig(format!(
                "unknown overflow policy '{other}'"
            ))),
        }
    }
}

/// Whether `publish` waits for handlers to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Block the publisher until every matched handler has executed.
    Sync,
    /// Return once every match is enqueued.
    #[default]
    Async,
}

impl std::str::FromStr for DeliveryMode {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            other => Err(BusError::InvalidConfig(format!(
                "unknown delivery mode '{other}'"
            ))),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Message bus configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Number of delivery workers.
    pub worker_threads: usize,
    /// Capacity of each subscriber queue.
    pub max_queue_size: usize,
    /// Policy applied when a subscriber queue is full.
    pub overflow_policy: OverflowPolicy,
    /// Mode used when a publish does not choose one.
    pub default_delivery_mode: DeliveryMode,
    /// Bound on `Block` waits and synchronous delivery waits.
    #[serde(rename = "delivery_timeout_ms", with = "duration_ms")]
    pub delivery_timeout: Duration,
    /// Append serializable payloads to the message store.
    pub enable_persistence: bool,
    /// Directory handed to external message store implementations.
    pub persistence_directory: Option<PathBuf>,
    /// Periodically log a metrics snapshot.
    pub enable_metrics: bool,
    /// Interval of the metrics reporter.
    #[serde(rename = "metrics_interval_ms", with = "duration_ms")]
    pub metrics_interval: Duration,
    /// How long shutdown waits for queued deliveries to drain.
    #[serde(rename = "shutdown_grace_period_ms", with = "duration_ms")]
    pub shutdown_grace_period: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            max_queue_size: 1024,
            overflow_policy: OverflowPolicy::DropOldest,
            default_delivery_mode: DeliveryMode::Async,
            delivery_timeout: Duration::from_secs(5),
            enable_persistence: false,
            persistence_directory: None,
            enable_metrics: false,
            metrics_interval: Duration::from_secs(60),
            shutdown_grace_period: Duration::from_secs(5),
        }
    }
}

impl BusConfig {
    /// Defaults overridden by `PLUGIN_BUS_*` environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PLUGIN_BUS_WORKER_THREADS`
    /// - `PLUGIN_BUS_MAX_QUEUE_SIZE`
    /// - `PLUGIN_BUS_OVERFLOW_POLICY` (`drop_oldest`, `drop_newest`, `reject`, `block`)
    /// - `PLUGIN_BUS_DELIVERY_MODE` (`sync`, `async`)
    /// - `PLUGIN_BUS_DELIVERY_TIMEOUT_MS`
    /// - `PLUGIN_BUS_ENABLE_PERSISTENCE`
    /// - `PLUGIN_BUS_PERSISTENCE_DIR`
    /// - `PLUGIN_BUS_ENABLE_METRICS`
    /// - `PLUGIN_BUS_METRICS_INTERVAL_MS`
    /// - `PLUGIN_BUS_SHUTDOWN_GRACE_MS`
    ///
    /// Unparseable values are rejected rather than silently ignored.
    pub fn from_env() -> Result<Self, BusError> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<usize>("PLUGIN_BUS_WORKER_THREADS")? {
            config.worker_threads = v;
        }
        if let Some(v) = env_parse::<usize>("PLUGIN_BUS_MAX_QUEUE_SIZE")? {
            config.max_queue_size = v;
        }
        if let Ok(v) = env::var("PLUGIN_BUS_OVERFLOW_POLICY") {
            config.overflow_policy = v.parse()?;
        }
        if let Ok(v) = env::var("PLUGIN_BUS_DELIVERY_MODE") {
            config.default_delivery_mode = v.parse()?;
        }
        if let Some(ms) = env_parse::<u64>("PLUGIN_BUS_DELIVERY_TIMEOUT_MS")? {
            config.delivery_timeout = Duration::from_millis(ms);
        }
        if let Ok(v) = env::var("PLUGIN_BUS_ENABLE_PERSISTENCE") {
            config.enable_persistence = parse_flag(&v);
        }
        if let Ok(v) = env::var("PLUGIN_BUS_PERSISTENCE_DIR") {
            config.persistence_directory = Some(PathBuf::from(v));
        }
        if let Ok(v) = env::var("PLUGIN_BUS_ENABLE_METRICS") {
            config.enable_metrics = parse_flag(&v);
        }
        if let Some(ms) = env_parse::<u64>("PLUGIN_BUS_METRICS_INTERVAL_MS")? {
            config.metrics_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("PLUGIN_BUS_SHUTDOWN_GRACE_MS")? {
            config.shutdown_grace_period = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the bus cannot run with.
    pub fn validate(&self) -> Result<(), BusError> {
        if self.worker_threads == 0 || self.worker_threads > MAX_WORKER_THREADS {
            return Err(BusError::InvalidConfig(format!(
                "worker_threads must be between 1 and {MAX_WORKER_THREADS}, got {}",
                self.worker_threads
            )));
        }
        if self.max_queue_size == 0 {
            return Err(BusError::InvalidConfig(
                "max_queue_size cannot be 0".to_string(),
            ));
        }
        if self.delivery_timeout.is_zero() {
            return Err(BusError::InvalidConfig(
                "delivery_timeout cannot be 0".to_string(),
            ));
        }
        // The sweep task ticks on this interval even with metrics disabled.
        if self.metrics_interval.is_zero() {
            return Err(BusError::InvalidConfig(
                "metrics_interval cannot be 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Builder-style method to set the worker count
    #[must_use]
    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    /// Builder-style method to set the queue capacity
    #[must_use]
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Builder-style method to set the overflow policy
    #[must_use]
    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    /// Builder-style method to set the default delivery mode
    #[must_use]
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.default_delivery_mode = mode;
        self
    }

    /// Builder-style method to set the delivery timeout
    #[must_use]
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Builder-style method to enable persistence
    #[must_use]
    pub fn with_persistence(mut self, directory: Option<PathBuf>) -> Self {
        self.enable_persistence = true;
        self.persistence_directory = directory;
        self
    }

    /// Builder-style method to enable the metrics reporter
    #[must_use]
    pub fn with_metrics(mut self, interval: Duration) -> Self {
        self.enable_metrics = true;
        self.metrics_interval = interval;
        self
    }

    /// Builder-style method to set the shutdown grace period
    #[must_use]
    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = grace;
        self
    }
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, BusError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| BusError::InvalidConfig(format!("{key}: cannot parse '{raw}'"))),
        Err(_) => Ok(None),
    }
}
