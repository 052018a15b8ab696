//! Prometheus metrics for the plugin bus.
//!
//! All metrics follow the naming convention: `plugin_bus_<metric>_<unit>`.
//! Per-topic counters are labelled with the concrete topic, so label
//! cardinality grows with the number of distinct published topics.

use lazy_static::lazy_static;
use plugin_bus::{MetricsRecorder, Outcome, RequestOutcome};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Message outcomes per topic (published, delivered, dropped, ...)
    pub static ref BUS_MESSAGES: IntCounterVec = IntCounterVec::new(
        Opts::new("plugin_bus_messages_total", "Bus message outcomes by topic"),
        &["topic", "outcome"]
    ).expect("metric creation failed");

    /// Request/response outcomes (sent, answered, timed_out, ...)
    pub static ref BUS_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("plugin_bus_requests_total", "Request/response outcomes"),
        &["outcome"]
    ).expect("metric creation failed");
}

/// Register the bus metrics with [`REGISTRY`]. Safe to call repeatedly.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(BUS_MESSAGES.clone()),
        Box::new(BUS_REQUESTS.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }
    Ok(())
}

/// Render [`REGISTRY`] in the Prometheus text exposition format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// [`MetricsRecorder`] feeding [`BUS_MESSAGES`] and [`BUS_REQUESTS`].
///
/// Install it with `MessageBus::builder().recorder(..)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusRecorder;

impl PrometheusRecorder {
    pub fn new() -> Self {
        Self
    }
}

impl MetricsRecorder for PrometheusRecorder {
    fn record(&self, topic: &str, outcome: Outcome) {
        BUS_MESSAGES
            .with_label_values(&[topic, outcome.as_str()])
            .inc();
    }

    fn record_request(&self, outcome: RequestOutcome) {
        BUS_REQUESTS.with_label_values(&[outcome.as_str()]).inc();
    }
}
