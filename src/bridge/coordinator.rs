//! Bridge coordinator: routes inbound broker messages to canisters
//!
//! For every inbound message the coordinator resolves the address, makes sure
//! the address's settings are known (registering its pull schedule the first
//! time they resolve), then forwards the message. Every failure is contained
//! to the message that caused it.

use super::forwarder::Forwarder;
use super::registry::SubscriptionRegistry;
use super::scheduler::{PullScheduler, TickOutcome};
use super::settings::{SettingsCache, SettingsState, SettingsStatus};
use crate::error::SyncError;
use crate::inbound_span;
use crate::observability::metrics;
use crate::protocol::{resolve_topic, Address, AddressError, InboundMessage, RepublishMapping};
use crate::remote::RemoteService;
use crate::transport::Transport;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    /// The topic did not name a valid address
    Dropped { reason: AddressError },
    Processed {
        address: Address,
        settings: SettingsStatus,
        /// This message's settings fetch started the address's pull schedule
        newly_scheduled: bool,
        forwarded: bool,
    },
}

pub struct Bridge<T: Transport> {
    registry: Arc<SubscriptionRegistry>,
    settings: SettingsCache,
    scheduler: PullScheduler<T>,
    forwarder: Forwarder,
}

impl<T: Transport + 'static> Bridge<T> {
    pub fn new(
        remote: Arc<dyn RemoteService>,
        transport: Arc<T>,
        mapping: RepublishMapping,
    ) -> Self {
        Self {
            registry: Arc::new(SubscriptionRegistry::new()),
            settings: SettingsCache::new(remote.clone()),
            scheduler: PullScheduler::new(remote.clone(), transport, mapping),
            forwarder: Forwarder::new(remote),
        }
    }

    pub fn scheduler(&self) -> &PullScheduler<T> {
        &self.scheduler
    }

    /// Handle one inbound message end to end. Never fails.
    pub async fn handle_message(&self, message: InboundMessage) -> MessageOutcome {
        metrics().message_received();
        let span = inbound_span!(topic = %message.topic);
        self.process(message).instrument(span).await
    }

    async fn process(&self, message: InboundMessage) -> MessageOutcome {
        let resolved = match resolve_topic(&message.topic, &message.payload) {
            Ok(resolved) => resolved,
            Err(reason) => {
                let error = SyncError::Parse {
                    topic: message.topic.clone(),
                    source: reason.clone(),
                };
                warn!(error = %error, kind = error.kind(), "Dropping message");
                metrics().parse_failed();
                return MessageOutcome::Dropped { reason };
            }
        };
        let address = resolved.address;
        let subscription = self.registry.get_or_create(&address);

        let resolution = self.settings.resolve(&subscription).await;
        let mut newly_scheduled = false;
        match (&resolution.state, resolution.newly_resolved) {
            (SettingsState::Resolved(settings), _) => {
                if let Some(settings) = resolution.schedulable() {
                    newly_scheduled = self.scheduler.register(&subscription, settings);
                } else if resolution.newly_resolved {
                    debug!(%address, interval = settings.interval, "Pulling disabled for address");
                }
            }
            (SettingsState::Failed(source), true) => {
                let error = SyncError::Fetch {
                    address,
                    source: source.clone(),
                };
                warn!(error = %error, kind = error.kind(), "Settings unavailable, address will not be pulled");
            }
            (SettingsState::Failed(source), false) => {
                let error = SyncError::CachedFetchFailure {
                    address,
                    reason: source.to_string(),
                };
                debug!(error = %error, "Forwarding without settings");
            }
        }

        // Forwarding does not depend on the settings outcome
        let payload = String::from_utf8_lossy(&resolved.payload);
        let forwarded = match self
            .forwarder
            .forward(&address, &resolved.topic, &payload)
            .await
        {
            Ok(()) => true,
            Err(error) => {
                warn!(error = %error, kind = error.kind(), "Forward failed");
                false
            }
        };

        MessageOutcome::Processed {
            address,
            settings: subscription.settings().status(),
            newly_scheduled,
            forwarded,
        }
    }

    /// Consume inbound messages until the channel closes or shutdown is signalled.
    ///
    /// Messages are handled concurrently, one task each. Handlers still
    /// running when the loop stops are awaited before returning.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Bridge coordinator running");
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Bridge coordinator stopping");
                        break;
                    }
                }

                received = inbound.recv() => match received {
                    Some(message) => {
                        let bridge = self.clone();
                        handlers.spawn(async move {
                            bridge.handle_message(message).await;
                        });
                    }
                    None => {
                        info!("Inbound channel closed");
                        break;
                    }
                },

                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    Self::reap(joined);
                }
            }
        }

        inbound.close();
        while let Some(joined) = handlers.join_next().await {
            Self::reap(joined);
        }
        debug!("All inbound handlers finished");
    }

    fn reap(joined: Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            if e.is_panic() {
                error!("Inbound handler panicked: {}", e);
            }
        }
    }

    /// Cancel all pull timers. Inbound handling is stopped through `run`'s
    /// shutdown signal.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown(&self.registry).await;
    }

    /// Run one pull for a known address right away
    pub async fn pull_now(&self, address: &Address) -> Option<TickOutcome> {
        let subscription = self.registry.get(address)?;
        Some(self.scheduler.tick(&subscription).await)
    }

    pub fn cursor(&self, address: &Address) -> Option<u64> {
        self.registry.get(address).map(|s| s.cursor().get())
    }

    pub fn is_scheduled(&self, address: &Address) -> bool {
        self.registry
            .get(address)
            .is_some_and(|s| s.is_scheduled())
    }

    pub fn settings_status(&self, address: &Address) -> Option<SettingsStatus> {
        self.registry.get(address).map(|s| s.settings().status())
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }
}
