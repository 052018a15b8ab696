//! # Payload
//!
//! Type-erased message body carrying a runtime type tag.
//!
//! Publishers hand the bus a concrete `T`; subscribers declare the `T` they
//! expect. The tag is compared at delivery time and a mismatch is reported as
//! [`BusError::SerializationFailed`] instead of being delivered.

use crate::errors::BusError;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

type ErasedValue = dyn Any + Send + Sync;
type Encoder = fn(&ErasedValue) -> Result<Vec<u8>, BusError>;

fn encode_json<T: Serialize + 'static>(value: &ErasedValue) -> Result<Vec<u8>, BusError> {
    let typed = value
        .downcast_ref::<T>()
        .ok_or_else(|| BusError::SerializationFailed {
            expected: std::any::type_name::<T>().to_string(),
            actual: "<erased>".to_string(),
        })?;
    serde_json::to_vec(typed).map_err(|e| BusError::SerializationFailed {
        expected: std::any::type_name::<T>().to_string(),
        actual: e.to_string(),
    })
}

/// Runtime identity of a payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    /// Tag for `T`.
    #[must_use]
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Human readable type name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Shared, immutable, type-tagged message body.
#[derive(Clone)]
pub struct Payload {
    value: Arc<ErasedValue>,
    tag: TypeTag,
    encoder: Option<Encoder>,
}

impl Payload {
    /// Wrap any value. The payload cannot be persisted.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            tag: TypeTag::of::<T>(),
            encoder: None,
        }
    }

    /// Wrap a serializable value so it can be appended to a message store.
    pub fn serializable<T: Serialize + Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            tag: TypeTag::of::<T>(),
            encoder: Some(encode_json::<T>),
        }
    }

    /// The runtime type tag.
    #[must_use]
    pub fn type_tag(&self) -> TypeTag {
        self.tag
    }

    /// Whether the payload holds a `T`.
    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.tag.id == TypeId::of::<T>()
    }

    /// Borrow the value as `T`.
    pub fn downcast_ref<T: Any>(&self) -> Result<&T, BusError> {
        self.value
            .downcast_ref::<T>()
            .ok_or_else(|| self.mismatch::<T>())
    }

    /// Share the value as `Arc<T>`.
    pub fn downcast_arc<T: Any + Send + Sync>(&self) -> Result<Arc<T>, BusError> {
        Arc::clone(&self.value)
            .downcast::<T>()
            .map_err(|_| self.mismatch::<T>())
    }

    /// Replace the value with another `T`, keeping the tag and encoder.
    ///
    /// Used by transforms, which map a payload to a payload of the same type.
    pub fn replace<T: Any + Send + Sync>(&self, value: T) -> Result<Self, BusError> {
        if !self.is::<T>() {
            return Err(self.mismatch::<T>());
        }
        Ok(Self {
            value: Arc::new(value),
            tag: self.tag,
            encoder: self.encoder,
        })
    }

    /// Whether [`Payload::encode`] can succeed.
    #[must_use]
    pub fn is_serializable(&self) -> bool {
        self.encoder.is_some()
    }

    /// JSON encoding of the value, for persistence.
    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        match self.encoder {
            Some(encode) => encode(self.value.as_ref()),
            None => Err(BusError::SerializationFailed {
                expected: "serializable payload".to_string(),
                actual: self.tag.name.to_string(),
            }),
        }
    }

    fn mismatch<T: Any>(&self) -> BusError {
        BusError::SerializationFailed {
            expected: std::any::type_name::<T>().to_string(),
            actual: self.tag.name.to_string(),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("type", &self.tag.name)
            .field("serializable", &self.encoder.is_some())
            .finish()
    }
}
