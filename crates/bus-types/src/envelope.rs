//! # Message Envelope
//!
//! The wrapper every published message travels in.
//!
//! - **Identity**: `sender_id` names the publishing component.
//! - **Correlation**: request/response flows carry `correlation_id` and
//!   `reply_to`.
//! - **Expiry**: an optional `ttl` measured from creation; expired envelopes
//!   are dropped before their handler runs.

use crate::correlation::CorrelationId;
use crate::payload::Payload;
use crate::topic::Topic;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Sender id used when the publisher does not identify itself.
pub const ANONYMOUS_SENDER: &str = "anonymous";

/// Message priority. Ordered from lowest to highest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A message in flight.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Concrete topic the message was published on.
    pub topic: Topic,
    /// Type-tagged body.
    pub payload: Payload,
    /// Publishing component.
    pub sender_id: String,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Delivery priority (used by filters; queues stay FIFO).
    pub priority: Priority,
    /// Present on requests and responses.
    pub correlation_id: Option<CorrelationId>,
    /// Topic the responder publishes its answer to.
    pub reply_to: Option<Topic>,
    /// Maximum age before the message is discarded undelivered.
    pub ttl: Option<Duration>,
    created_at: Instant,
}

impl Envelope {
    /// Create an envelope with default metadata.
    #[must_use]
    pub fn new(topic: Topic, payload: Payload) -> Self {
        Self {
            topic,
            payload,
            sender_id: ANONYMOUS_SENDER.to_string(),
            timestamp: unix_millis(),
            priority: Priority::default(),
            correlation_id: None,
            reply_to: None,
            ttl: None,
            created_at: Instant::now(),
        }
    }

    /// Builder-style method to set the sender.
    #[must_use]
    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = sender_id.into();
        self
    }

    /// Builder-style method to set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder-style method to set the time to live.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Builder-style method to mark the envelope as part of a request flow.
    #[must_use]
    pub fn with_correlation(mut self, id: CorrelationId, reply_to: Option<Topic>) -> Self {
        self.correlation_id = Some(id);
        self.reply_to = reply_to;
        self
    }

    /// Same metadata, different payload.
    #[must_use]
    pub fn with_payload(&self, payload: Payload) -> Self {
        Self {
            payload,
            ..self.clone()
        }
    }

    /// Time since the envelope was created.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether the ttl has elapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.ttl.is_some_and(|ttl| self.age() > ttl)
    }
}
