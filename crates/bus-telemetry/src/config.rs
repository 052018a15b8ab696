//! Telemetry configuration from environment variables.

use std::env;

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name attached to every log line
    pub service_name: String,

    /// Log level filter (trace, debug, info, warn, error) or a full
    /// `EnvFilter` directive
    pub log_level: String,

    /// Whether logs are written to stdout at all
    pub console_output: bool,

    /// Whether to emit JSON instead of human-readable lines
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "plugin-bus".to_string(),
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// - `PLUGIN_BUS_SERVICE_NAME`: service name (default: plugin-bus)
    /// - `PLUGIN_BUS_LOG_LEVEL` or `RUST_LOG`: log filter (default: info)
    /// - `PLUGIN_BUS_CONSOLE_OUTPUT`: enable console output (default: true)
    /// - `PLUGIN_BUS_JSON_LOGS`: enable JSON logs (default: false)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            service_name: lookup("PLUGIN_BUS_SERVICE_NAME")
                .unwrap_or_else(|| "plugin-bus".to_string()),

            log_level: lookup("PLUGIN_BUS_LOG_LEVEL")
                .or_else(|| lookup("RUST_LOG"))
                .unwrap_or_else(|| "info".to_string()),

            console_output: lookup("PLUGIN_BUS_CONSOLE_OUTPUT")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(true),

            json_logs: lookup("PLUGIN_BUS_JSON_LOGS")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_json_logs(mut self, json: bool) -> Self {
        self.json_logs = json;
        self
    }
}
