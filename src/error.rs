//! Error types for the canister bridge
//!
//! Two families: `SyncError` covers per-address and per-message failures,
//! which are logged and contained; `BridgeError` covers the startup failures
//! that stop the process.

use crate::protocol::{Address, AddressError};
use crate::remote::RemoteError;
use thiserror::Error;

/// Per-address / per-message failures. Never propagated past the coordinator.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Dropping message on '{topic}': {source}")]
    Parse {
        topic: String,
        #[source]
        source: AddressError,
    },

    #[error("Settings fetch for {address} failed: {source}")]
    Fetch {
        address: Address,
        #[source]
        source: RemoteError,
    },

    #[error("Settings for {address} previously failed: {reason}")]
    CachedFetchFailure { address: Address, reason: String },

    #[error("Pull from {address} at index {from_index} failed: {source}")]
    Pull {
        address: Address,
        from_index: u64,
        #[source]
        source: RemoteError,
    },

    #[error("Forward to {address} failed: {source}")]
    Forward {
        address: Address,
        #[source]
        source: RemoteError,
    },

    #[error("Publish to '{topic}' failed: {message}")]
    Publish { topic: String, message: String },
}

impl SyncError {
    /// Address the failure is scoped to, if resolution got that far
    pub fn address(&self) -> Option<&Address> {
        match self {
            SyncError::Parse { .. } | SyncError::Publish { .. } => None,
            SyncError::Fetch { address, .. }
            | SyncError::CachedFetchFailure { address, .. }
            | SyncError::Pull { address, .. }
            | SyncError::Forward { address, .. } => Some(address),
        }
    }

    /// Short machine-readable kind for structured log fields
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Parse { .. } => "parse",
            SyncError::Fetch { .. } | SyncError::CachedFetchFailure { .. } => "fetch",
            SyncError::Pull { .. } => "pull",
            SyncError::Forward { .. } => "forward",
            SyncError::Publish { .. } => "publish",
        }
    }
}

/// Startup failures. These are the only conditions that stop the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::config::ConfigError),

    #[error("Failed to load identity from {path}: {message}")]
    IdentityError { path: String, message: String },

    #[error("Trust bootstrap failed: {message}")]
    BootstrapError { message: String },

    #[error("Broker error: {0}")]
    BrokerError(#[from] crate::transport::mqtt::MqttError),

    #[error("Remote endpoint error: {0}")]
    RemoteError(#[from] RemoteError),

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl BridgeError {
    pub fn identity<P: AsRef<std::path::Path>, S: Into<String>>(path: P, message: S) -> Self {
        Self::IdentityError {
            path: path.as_ref().display().to_string(),
            message: message.into(),
        }
    }

    pub fn bootstrap<S: Into<String>>(message: S) -> Self {
        Self::BootstrapError {
            message: message.into(),
        }
    }

    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}

/// Result type for bridge startup operations
pub type BridgeResult<T> = Result<T, BridgeError>;
