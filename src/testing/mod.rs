//! Testing utilities and mock implementations
//!
//! This module provides mock implementations for testing the bridge without
//! requiring an MQTT broker or an Internet Computer replica.

pub mod mocks;

pub use mocks::*;
