//! Settings cache with per-address fetch coalescing
//!
//! Each subscription owns a [`SettingsSlot`]. The first caller for an address
//! runs the fetch; concurrent callers wait on the same outcome. Both success
//! and failure are stored for the lifetime of the process.

use super::registry::Subscription;
use crate::observability::metrics;
use crate::protocol::{Address, Settings};
use crate::remote::{RemoteError, RemoteService};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// Outcome of a settings fetch, cached permanently
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsState {
    Resolved(Settings),
    Failed(RemoteError),
}

/// Point-in-time view of a slot, for diagnostics
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsStatus {
    /// No fetch has completed yet (possibly one is in flight)
    Pending,
    Resolved(Settings),
    Failed(String),
}

/// Result of [`SettingsCache::resolve`]
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub state: SettingsState,
    /// True only for the caller whose fetch populated the slot
    pub newly_resolved: bool,
}

impl Resolution {
    /// Settings that should start a pull schedule, exactly once per address
    pub fn schedulable(&self) -> Option<&Settings> {
        match &self.state {
            SettingsState::Resolved(settings) if self.newly_resolved && settings.pull_enabled() => {
                Some(settings)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SettingsSlot {
    cell: OnceCell<SettingsState>,
}

impl SettingsSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> SettingsStatus {
        match self.cell.get() {
            None => SettingsStatus::Pending,
            Some(SettingsState::Resolved(settings)) => SettingsStatus::Resolved(settings.clone()),
            Some(SettingsState::Failed(e)) => SettingsStatus::Failed(e.to_string()),
        }
    }

    /// Return the cached state or run `fetch` to populate it.
    ///
    /// At most one `fetch` runs at a time; if the running one is cancelled the
    /// next waiter takes over.
    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Resolution
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = SettingsState>,
    {
        let fetched_here = AtomicBool::new(false);
        let flag = &fetched_here;
        let state = self
            .cell
            .get_or_init(|| async move {
                flag.store(true, Ordering::Relaxed);
                fetch().await
            })
            .await
            .clone();

        Resolution {
            state,
            newly_resolved: fetched_here.load(Ordering::Relaxed),
        }
    }
}

/// Resolves settings through the remote service, one fetch per address
pub struct SettingsCache {
    remote: Arc<dyn RemoteService>,
}

impl SettingsCache {
    pub fn new(remote: Arc<dyn RemoteService>) -> Self {
        Self { remote }
    }

    pub async fn resolve(&self, subscription: &Subscription) -> Resolution {
        let address = *subscription.address();
        subscription
            .settings()
            .get_or_fetch(|| self.fetch(address))
            .await
    }

    async fn fetch(&self, address: Address) -> SettingsState {
        debug!(%address, "Fetching settings");
        let state = match self.remote.get_settings(&address).await {
            Ok(settings) => SettingsState::Resolved(settings),
            Err(e) => SettingsState::Failed(e),
        };
        metrics().settings_fetched(matches!(state, SettingsState::Resolved(_)));
        state
    }
}
