//! # Bus Types Crate
//!
//! Topics, payloads, envelopes and error kinds shared by the plugin bus and
//! its telemetry crate.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: every type that crosses a crate boundary is
//!   defined here.
//! - **Runtime Type Tags**: payloads are type-erased but remember their type,
//!   so a subscriber never receives a value it did not ask for.
//! - **Immutable Topics**: a topic string never changes once created.

pub mod correlation;
pub mod envelope;
pub mod errors;
pub mod payload;
pub mod topic;

pub use correlation::CorrelationId;
pub use envelope::{unix_millis, Envelope, Priority, ANONYMOUS_SENDER};
pub use errors::BusError;
pub use payload::{Payload, TypeTag};
pub use topic::{Topic, TopicPattern};
