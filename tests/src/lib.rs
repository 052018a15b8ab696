//! # Plugin Bus Test Suite
//!
//! Scenario tests exercising the bus through its public API only.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── routing.rs           # exact topics, wildcards, filters, transforms
//!     ├── delivery.rs          # ordering, overflow policies, sync mode, TTL
//!     ├── request_response.rs  # correlation, timeouts, late responses
//!     ├── lifecycle.rs         # start, shutdown, draining
//!     ├── persistence.rs       # replay from memory and file stores
//!     └── telemetry.rs         # Prometheus recorder
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p bus-tests
//! cargo test -p bus-tests integration::delivery::
//!
//! # Benchmarks
//! cargo bench -p bus-tests
//! ```

#![allow(dead_code)]

pub mod integration;
