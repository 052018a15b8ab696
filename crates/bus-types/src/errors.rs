//! # Error Types
//!
//! Error kinds returned by every public bus operation.

use thiserror::Error;

/// Errors that can occur while publishing, subscribing or requesting.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    /// No messages or subscriptions are known for the topic.
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// The subscription id is not (or no longer) registered.
    #[error("Subscriber not found: {0}")]
    SubscriberNotFound(u64),

    /// A handler or responder returned an error.
    #[error("Delivery failed on topic {topic}: {reason}")]
    DeliveryFailed { topic: String, reason: String },

    /// A request deadline or synchronous delivery wait elapsed.
    #[error("Timeout expired after {timeout_ms}ms on topic {topic}")]
    TimeoutExpired { topic: String, timeout_ms: u64 },

    /// The overflow policy refused one or more deliveries.
    #[error("Queue full on topic {topic}: {rejected} delivery(ies) refused")]
    QueueFull { topic: String, rejected: usize },

    /// Payload type tag mismatch or a failing transform.
    #[error("Serialization failed: expected {expected}, got {actual}")]
    SerializationFailed { expected: String, actual: String },

    /// Malformed topic, pattern or envelope.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The bus has been shut down.
    #[error("Message bus closed")]
    BusClosed,

    /// Configuration rejected by validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The message store reported a failure.
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl BusError {
    /// Short, stable name of the error kind (used as a log field).
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TopicNotFound(_) => "topic_not_found",
            Self::SubscriberNotFound(_) => "subscriber_not_found",
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::TimeoutExpired { .. } => "timeout_expired",
            Self::QueueFull { .. } => "queue_full",
            Self::SerializationFailed { .. } => "serialization_failed",
            Self::InvalidMessage(_) => "invalid_message",
            Self::BusClosed => "bus_closed",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Persistence(_) => "persistence",
        }
    }
}
