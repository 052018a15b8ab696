//! Typed view of a delivered envelope.

use bus_types::{BusError, CorrelationId, Envelope, Priority, Topic};
use std::any::Any;
use std::ops::Deref;
use std::sync::Arc;

/// A message as seen by a handler, filter or transform.
///
/// Dereferences to the payload. Pattern subscribers read the concrete topic
/// through [`Message::topic`].
#[derive(Debug)]
pub struct Message<T> {
    envelope: Envelope,
    value: Arc<T>,
}

impl<T: Any + Send + Sync> Message<T> {
    /// Typed view of `envelope`; fails when the payload is not a `T`.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, BusError> {
        let value = envelope.payload.downcast_arc::<T>()?;
        Ok(Self { envelope, value })
    }

    /// Shared handle to the payload.
    pub fn payload(&self) -> Arc<T> {
        Arc::clone(&self.value)
    }
}

impl<T> Message<T> {
    /// Concrete topic the message was published on.
    pub fn topic(&self) -> &Topic {
        &self.envelope.topic
    }

    pub fn sender_id(&self) -> &str {
        &self.envelope.sender_id
    }

    pub fn priority(&self) -> Priority {
        self.envelope.priority
    }

    /// Milliseconds since the Unix epoch at publish time.
    pub fn timestamp(&self) -> u64 {
        self.envelope.timestamp
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.envelope.correlation_id
    }

    /// The underlying envelope.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }
}

impl<T: Clone> Message<T> {
    /// Owned payload, cloning only when other references remain.
    pub fn into_inner(self) -> T {
        Arc::unwrap_or_clone(self.value)
    }
}

impl<T> Deref for Message<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Clone for Message<T> {
    fn clone(&self) -> Self {
        Self {
            envelope: self.envelope.clone(),
            value: Arc::clone(&self.value),
        }
    }
}
