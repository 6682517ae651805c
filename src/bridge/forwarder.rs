//! Delivery of inbound broker messages to a canister's `onMessage`

use crate::error::SyncError;
use crate::observability::metrics;
use crate::protocol::Address;
use crate::remote::RemoteService;
use std::sync::Arc;
use tracing::debug;

pub struct Forwarder {
    remote: Arc<dyn RemoteService>,
}

impl Forwarder {
    pub fn new(remote: Arc<dyn RemoteService>) -> Self {
        Self { remote }
    }

    /// Call `onMessage(topic, payload)` on the canister at `address`.
    ///
    /// Failures are returned, never raised, and touch no other state.
    pub async fn forward(
        &self,
        address: &Address,
        topic: &str,
        payload: &str,
    ) -> Result<(), SyncError> {
        match self.remote.on_message(address, topic, payload).await {
            Ok(()) => {
                debug!(%address, topic, "Forwarded message");
                metrics().message_forwarded(&address.to_string());
                Ok(())
            }
            Err(source) => {
                metrics().forward_failed(&address.to_string());
                Err(SyncError::Forward {
                    address: *address,
                    source,
                })
            }
        }
    }
}
