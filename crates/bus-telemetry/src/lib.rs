//! # Bus Telemetry
//!
//! Observability wiring for the plugin bus.
//!
//! - Logs: `tracing` events from the bus, rendered by a `tracing-subscriber`
//!   pretty or JSON layer
//! - Metrics: bus counters mirrored into a Prometheus registry through
//!   [`PrometheusRecorder`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bus_telemetry::{init_telemetry, PrometheusRecorder, TelemetryConfig};
//! use plugin_bus::{BusConfig, MessageBus};
//! use std::sync::Arc;
//!
//! init_telemetry(&TelemetryConfig::from_env())?;
//! let bus = MessageBus::builder()
//!     .config(BusConfig::from_env()?)
//!     .recorder(Arc::new(PrometheusRecorder::new()))
//!     .build()?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PLUGIN_BUS_SERVICE_NAME` | `plugin-bus` | Service name attached to logs |
//! | `PLUGIN_BUS_LOG_LEVEL` | `info` | Log filter (falls back to `RUST_LOG`) |
//! | `PLUGIN_BUS_CONSOLE_OUTPUT` | `true` | Write logs to stdout |
//! | `PLUGIN_BUS_JSON_LOGS` | `false` | JSON instead of pretty logs |

mod config;
mod logging;
mod metrics;

pub use config::TelemetryConfig;
pub use logging::init_logging;
pub use metrics::{
    encode_metrics, register_metrics, PrometheusRecorder, BUS_MESSAGES, BUS_REQUESTS, REGISTRY,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),
}

/// Install the log subscriber and register bus metrics.
///
/// Metrics registration is idempotent; installing a second global
/// subscriber fails with [`TelemetryError::LoggingInit`].
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    register_metrics()?;
    init_logging(config)?;

    tracing::info!(
        service = %config.service_name,
        json_logs = config.json_logs,
        "Telemetry initialized"
    );
    Ok(())
}
