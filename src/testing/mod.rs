//! Testing utilities for kafka_controller
//!
//! Only compiled for tests.
//!
//! # Organization
//! - `mocks.rs` - In-memory MockBroker and MemoryOffsetStore
//! - `helpers.rs` - Config, handler and polling helpers

#![cfg(test)]

pub mod helpers;
pub mod mocks;

// Re-export commonly used items
pub use helpers::{test_config, wait_until, RecordingHandler};
pub use mocks::{MemoryOffsetStore, MockBroker};
