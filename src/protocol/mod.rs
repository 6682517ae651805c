//! Addressing, topic handling and message types for the canister bridge
//!
//! Broker topics carry the target canister as their first segment; canister
//! records are candid-encoded on the RPC side and JSON-encoded on the broker side.

pub mod address;
pub mod messages;
pub mod topics;

pub use address::*;
pub use messages::*;
pub use topics::*;
