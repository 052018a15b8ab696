//! # Filter/Transform Pipeline
//!
//! Runs on the publisher's task for every matched subscription, before the
//! envelope is queued:
//!
//! 1. type-tag check (mismatch: dropped, `SerializationFailed`)
//! 2. filter predicate (reject: dropped silently, no transform cost)
//! 3. transform (error: dropped, `SerializationFailed`)

use crate::message::Message;
use bus_types::{BusError, Envelope, TypeTag};
use std::any::Any;
use std::sync::Arc;
use tracing::trace;

/// Type-erased filter predicate.
pub(crate) type ErasedFilter = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Type-erased payload transform.
pub(crate) type ErasedTransform =
    Arc<dyn Fn(&Envelope) -> Result<Envelope, BusError> + Send + Sync>;

/// Erase a typed filter.
pub(crate) fn erase_filter<T, F>(filter: F) -> ErasedFilter
where
    T: Any + Send + Sync,
    F: Fn(&Message<T>) -> bool + Send + Sync + 'static,
{
    Arc::new(move |envelope: &Envelope| {
        Message::<T>::from_envelope(envelope.clone())
            .map(|msg| filter(&msg))
            .unwrap_or(false)
    })
}

/// Erase a typed transform. The transform maps `T` to a new `T`.
pub(crate) fn erase_transform<T, F>(transform: F) -> ErasedTransform
where
    T: Any + Send + Sync,
    F: Fn(&Message<T>) -> anyhow::Result<T> + Send + Sync + 'static,
{
    Arc::new(move |envelope: &Envelope| {
        let msg = Message::<T>::from_envelope(envelope.clone())?;
        let value = transform(&msg).map_err(|e| BusError::SerializationFailed {
            expected: format!("transformed {}", std::any::type_name::<T>()),
            actual: e.to_string(),
        })?;
        Ok(envelope.with_payload(envelope.payload.replace(value)?))
    })
}

/// What a subscription makes of one published envelope.
#[derive(Debug)]
pub(crate) enum Prepared {
    /// Ready to enqueue.
    Pass(Envelope),
    /// Rejected by the filter.
    Filtered,
    /// Type mismatch or failing transform.
    Failed(BusError),
}

/// Per-subscription stage configuration.
#[derive(Clone)]
pub(crate) struct Pipeline {
    pub(crate) expected: TypeTag,
    pub(crate) filter: Option<ErasedFilter>,
    pub(crate) transform: Option<ErasedTransform>,
}

impl Pipeline {
    pub(crate) fn for_type<T: Any>() -> Self {
        Self {
            expected: TypeTag::of::<T>(),
            filter: None,
            transform: None,
        }
    }

    pub(crate) fn with_filter(mut self, filter: Option<ErasedFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub(crate) fn with_transform(mut self, transform: Option<ErasedTransform>) -> Self {
        self.transform = transform;
        self
    }

    /// Run the stages against `envelope`.
    pub(crate) fn prepare(&self, envelope: &Envelope) -> Prepared {
        let actual = envelope.payload.type_tag();
        if actual != self.expected {
            return Prepared::Failed(BusError::SerializationFailed {
                expected: self.expected.name().to_string(),
                actual: actual.name().to_string(),
            });
        }

        if let Some(filter) = &self.filter {
            if !filter(envelope) {
                trace!(topic = %envelope.topic, "Filtered out");
                return Prepared::Filtered;
            }
        }

        match &self.transform {
            Some(transform) => match transform(envelope) {
                Ok(transformed) => Prepared::Pass(transformed),
                Err(e) => Prepared::Failed(e),
            },
            None => Prepared::Pass(envelope.clone()),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("expected", &self.expected.name())
            .field("filter", &self.filter.is_some())
            .field("transform", &self.transform.is_some())
            .finish()
    }
}
