//! Remote canister RPC surface
//!
//! Every canister the bridge talks to exposes the same three methods:
//! `getSettings`, `getMessages(fromIndex)` and `onMessage(topic, payload)`.
//! The [`RemoteService`] trait abstracts the calls so the synchronization
//! engine can be driven by the real agent or by test doubles.

use crate::protocol::{Address, PagedResult, Settings};
use async_trait::async_trait;
use thiserror::Error;

pub mod ic;
pub mod identity;

pub use ic::IcServiceClient;
pub use identity::load_identity;

/// Remote call failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
    /// The call never produced a reply (network, agent or replica rejection)
    #[error("Call failed: {0}")]
    Transport(String),
    /// The canister replied with its `Err` variant
    #[error("Canister returned error: {0}")]
    Rejected(String),
    /// Arguments or reply could not be candid-encoded/decoded
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Call timed out after {0}s")]
    Timeout(u64),
}

/// Per-canister RPC surface consumed by the bridge
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Read the canister's bridge settings (query)
    async fn get_settings(&self, address: &Address) -> Result<Settings, RemoteError>;

    /// Read one page of the canister's outbound messages starting at `from_index` (query)
    async fn get_messages(
        &self,
        address: &Address,
        from_index: u64,
    ) -> Result<PagedResult, RemoteError>;

    /// Deliver an inbound broker message to the canister (update)
    async fn on_message(
        &self,
        address: &Address,
        topic: &str,
        payload: &str,
    ) -> Result<(), RemoteError>;
}
