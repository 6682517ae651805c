//! Canister bridge
//!
//! Synchronizes an MQTT broker with Internet Computer canisters.
//!
//! # Overview
//!
//! Devices publish on topics whose first segment names a canister. The bridge:
//! - forwards every such message to the canister's `onMessage` method
//! - fetches each canister's settings once, on first contact
//! - pulls canisters with a non-zero interval on a timer and republishes the
//!   returned messages on the broker
//!
//! # Quick Start
//!
//! ```rust
//! use canister_bridge::protocol::{resolve_topic, Message, RepublishMapping};
//!
//! let resolved = resolve_topic("/ryjl3-tyaaa-aaaaa-aaaba-cai/sensor1", b"{\"t\":21}").unwrap();
//! assert_eq!(resolved.path, "/sensor1");
//!
//! let mapping = RepublishMapping::new("out");
//! let pulled = Message {
//!     index: 0,
//!     topic: "/alerts".to_string(),
//!     message: "overheat".to_string(),
//!     timestamp: 1_700_000_000,
//! };
//! let publication = mapping.map(&resolved.address, &pulled).unwrap();
//! assert_eq!(publication.topic, "out/ryjl3-tyaaa-aaaaa-aaaba-cai/alerts");
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod remote;
pub mod testing;
pub mod transport;

pub use bridge::{Bridge, BridgeLifecycle, LifecycleError, MessageOutcome};
pub use config::*;
pub use error::{BridgeError, BridgeResult, SyncError};
pub use protocol::*;
pub use transport::mqtt::MqttClient;
