//! Synchronization engine
//!
//! Inbound: broker message → address resolution → settings (fetched once per
//! address) → `onMessage` on the canister. Outbound: per-address timers pull
//! pages from `getMessages` and republish them on the broker.

pub mod coordinator;
pub mod cursor;
pub mod forwarder;
pub mod lifecycle;
pub mod registry;
pub mod scheduler;
pub mod settings;

pub use coordinator::{Bridge, MessageOutcome};
pub use cursor::Cursor;
pub use forwarder::Forwarder;
pub use lifecycle::{BridgeLifecycle, LifecycleError};
pub use registry::{Subscription, SubscriptionRegistry};
pub use scheduler::{OverlapPolicy, PullFailurePolicy, PullHandle, PullScheduler, TickOutcome};
pub use settings::{Resolution, SettingsCache, SettingsSlot, SettingsState, SettingsStatus};
