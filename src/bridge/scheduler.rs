//! Per-address recurring pulls
//!
//! Every address whose settings resolve with a non-zero interval gets one
//! ticker task. Each tick pulls a single page starting at the address's
//! cursor, republishes the returned messages and advances the cursor.
//!
//! Ticks never overlap for an address: if the previous pull is still running
//! the tick is skipped. A failed pull leaves the cursor alone and the next
//! natural tick tries again.

use super::registry::{Subscription, SubscriptionRegistry};
use crate::error::SyncError;
use crate::observability::metrics;
use crate::protocol::{Address, Message, RepublishMapping, Settings};
use crate::pull_span;
use crate::remote::RemoteService;
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

/// Longest period a ticker will wait between pulls. Larger intervals are
/// clamped so the first deadline stays representable.
pub const MAX_PULL_PERIOD: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// What happens after a failed pull
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullFailurePolicy {
    /// Keep the timer running; the next tick retries from the same cursor.
    /// No backoff, no jitter.
    #[default]
    RetryOnNextTick,
}

/// What happens when a tick fires while the previous pull is still running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlapPolicy {
    #[default]
    Skip,
}

/// Result of one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Pulled { count: u64, next_index: u64 },
    Failed,
    Skipped,
}

/// Handle to a running ticker, stored in the subscription's timer slot
#[derive(Debug)]
pub struct PullHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
    period: Duration,
}

impl PullHandle {
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Stop the ticker without waiting for it to exit
    fn signal(&self) {
        let _ = self.cancel.send(true);
        self.task.abort();
    }

    async fn join(self) {
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!("Pull ticker panicked: {}", e);
            }
        }
    }
}

/// Clears the in-flight flag when the pull finishes or is abandoned
struct InFlightGuard {
    subscription: Arc<Subscription>,
}

impl InFlightGuard {
    fn try_acquire(subscription: &Arc<Subscription>) -> Option<Self> {
        subscription.try_begin_pull().then(|| Self {
            subscription: subscription.clone(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.subscription.end_pull();
    }
}

/// State shared by all ticker tasks
struct PullContext<T: Transport> {
    remote: Arc<dyn RemoteService>,
    transport: Arc<T>,
    mapping: RepublishMapping,
    failure_policy: PullFailurePolicy,
    closed: AtomicBool,
}

impl<T: Transport + 'static> PullContext<T> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn pull(&self, subscription: &Subscription) -> TickOutcome {
        let address = *subscription.address();
        let from_index = subscription.cursor().get();
        let span = pull_span!(address = %address, from_index);

        async {
            metrics().pull_started();
            let started = std::time::Instant::now();

            let page = match self.remote.get_messages(&address, from_index).await {
                Ok(page) => page,
                Err(source) => {
                    let error = SyncError::Pull {
                        address,
                        from_index,
                        source,
                    };
                    match self.failure_policy {
                        PullFailurePolicy::RetryOnNextTick => {
                            warn!(error = %error, kind = error.kind(), "Pull failed, retrying on next tick");
                        }
                    }
                    metrics().pull_failed(&address.to_string(), started.elapsed());
                    return TickOutcome::Failed;
                }
            };

            let count = page.data.len() as u64;
            let next_index = subscription.cursor().advance(count);

            for message in &page.data {
                self.republish(&address, message).await;
            }

            debug!(count, next_index, total = page.total, "Pull complete");
            metrics().pull_completed(&address.to_string(), count, started.elapsed());
            TickOutcome::Pulled { count, next_index }
        }
        .instrument(span)
        .await
    }

    /// Publish failures are logged and counted; the cursor stays advanced
    async fn republish(&self, address: &Address, message: &Message) {
        let publication = match self.mapping.map(address, message) {
            Ok(publication) => publication,
            Err(e) => {
                warn!(index = message.index, error = %e, "Failed to encode pulled message");
                metrics().republish_failed();
                return;
            }
        };

        match self
            .transport
            .publish(&publication.topic, publication.payload, false)
            .await
        {
            Ok(()) => metrics().message_republished(),
            Err(e) => {
                let error = SyncError::Publish {
                    topic: publication.topic,
                    message: e.to_string(),
                };
                warn!(error = %error, index = message.index, "Republish failed");
                metrics().republish_failed();
            }
        }
    }

    /// Run one guarded pull inline
    async fn tick(&self, subscription: &Arc<Subscription>) -> TickOutcome {
        match InFlightGuard::try_acquire(subscription) {
            Some(_guard) => self.pull(subscription).await,
            None => Self::skip(subscription),
        }
    }

    fn skip(subscription: &Subscription) -> TickOutcome {
        debug!(address = %subscription.address(), "Previous pull still running, skipping tick");
        metrics().pull_skipped();
        TickOutcome::Skipped
    }
}

async fn run_ticker<T: Transport + 'static>(
    context: Arc<PullContext<T>>,
    subscription: Arc<Subscription>,
    start: Instant,
    period: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut pulls = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                if context.is_closed() {
                    break;
                }
                match InFlightGuard::try_acquire(&subscription) {
                    Some(guard) => {
                        let context = context.clone();
                        let subscription = subscription.clone();
                        pulls.spawn(async move {
                            let _guard = guard;
                            context.pull(&subscription).await;
                        });
                    }
                    None => {
                        PullContext::<T>::skip(&subscription);
                    }
                }
            }

            Some(joined) = pulls.join_next(), if !pulls.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!(address = %subscription.address(), "Pull task panicked: {}", e);
                    }
                }
            }
        }
    }

    // Abandon any in-flight pull; dropping it releases the in-flight flag
    pulls.abort_all();
    while pulls.join_next().await.is_some() {}
    debug!(address = %subscription.address(), "Pull ticker stopped");
}

/// Owns every address's recurring pull
pub struct PullScheduler<T: Transport> {
    context: Arc<PullContext<T>>,
    overlap_policy: OverlapPolicy,
}

impl<T: Transport + 'static> PullScheduler<T> {
    pub fn new(
        remote: Arc<dyn RemoteService>,
        transport: Arc<T>,
        mapping: RepublishMapping,
    ) -> Self {
        Self {
            context: Arc::new(PullContext {
                remote,
                transport,
                mapping,
                failure_policy: PullFailurePolicy::default(),
                closed: AtomicBool::new(false),
            }),
            overlap_policy: OverlapPolicy::default(),
        }
    }

    pub fn failure_policy(&self) -> PullFailurePolicy {
        self.context.failure_policy
    }

    pub fn overlap_policy(&self) -> OverlapPolicy {
        self.overlap_policy
    }

    pub fn mapping(&self) -> &RepublishMapping {
        &self.context.mapping
    }

    /// Start the recurring pull for a subscription.
    ///
    /// Returns false without side effects when pulling is disabled
    /// (`interval == 0`), the address is already scheduled, or shutdown has
    /// begun. Must be called from within a tokio runtime.
    pub fn register(&self, subscription: &Arc<Subscription>, settings: &Settings) -> bool {
        if !settings.pull_enabled() {
            return false;
        }

        let Ok(mut slot) = subscription.timer().lock() else {
            return false;
        };
        if slot.is_some() || self.context.is_closed() {
            return false;
        }

        let period = Duration::from_secs(settings.interval).min(MAX_PULL_PERIOD);
        let Some(start) = Instant::now().checked_add(period) else {
            warn!(
                address = %subscription.address(),
                interval_secs = settings.interval,
                "Pull interval out of range, not scheduling"
            );
            return false;
        };
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run_ticker(
            self.context.clone(),
            subscription.clone(),
            start,
            period,
            cancel_rx,
        ));

        *slot = Some(PullHandle {
            cancel: cancel_tx,
            task,
            period,
        });
        metrics().schedule_started();
        info!(
            address = %subscription.address(),
            interval_secs = settings.interval,
            "Scheduled recurring pull"
        );
        true
    }

    /// Run one pull now, honouring the overlap guard
    pub async fn tick(&self, subscription: &Arc<Subscription>) -> TickOutcome {
        self.context.tick(subscription).await
    }

    pub fn is_closed(&self) -> bool {
        self.context.is_closed()
    }

    /// Cancel every ticker. No tick fires once this has started and no new
    /// schedule is accepted afterwards.
    pub async fn shutdown(&self, registry: &SubscriptionRegistry) {
        self.context.closed.store(true, Ordering::SeqCst);

        // Signal every ticker before waiting on any of them
        let handles: Vec<PullHandle> = registry
            .all()
            .iter()
            .filter_map(|subscription| {
                subscription
                    .timer()
                    .lock()
                    .ok()
                    .and_then(|mut slot| slot.take())
            })
            .collect();
        for handle in &handles {
            handle.signal();
        }

        let cancelled = handles.len();
        for handle in handles {
            handle.join().await;
            metrics().schedule_stopped();
        }

        info!(cancelled, "Pull scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PagedResult;
    use crate::testing::mocks::{MockRemoteService, MockTransport};

    fn address() -> Address {
        "bkyz2-fmaaa-aaaaa-qaaaq-cai".parse().unwrap()
    }

    fn message(index: u64) -> Message {
        Message {
            index,
            topic: "/sensor1".to_string(),
            message: format!("{{\"n\":{index}}}"),
            timestamp: 1_700_000_000 + index,
        }
    }

    fn page(skip: u64, indices: std::ops::Range<u64>) -> PagedResult {
        let data: Vec<_> = indices.map(message).collect();
        PagedResult {
            skip,
            limit: 100,
            total: skip + data.len() as u64,
            data,
        }
    }

    fn scheduler(remote: Arc<MockRemoteService>, transport: Arc<MockTransport>) -> PullScheduler<MockTransport> {
        PullScheduler::new(remote, transport, RepublishMapping::new("out"))
    }

    #[tokio::test]
    async fn test_tick_advances_cursor_and_republishes() {
        let remote = Arc::new(MockRemoteService::new());
        remote.push_page(address(), Ok(page(0, 0..2)));
        let transport = Arc::new(MockTransport::new("test"));
        let scheduler = scheduler(remote.clone(), transport.clone());
        let subscription = Arc::new(Subscription::new(address()));

        let outcome = scheduler.tick(&subscription).await;

        assert_eq!(outcome, TickOutcome::Pulled { count: 2, next_index: 2 });
        assert_eq!(subscription.cursor().get(), 2);
        assert_eq!(remote.get_messages_calls(&address()), vec![0]);

        let published = transport.published().await;
        assert_eq!(published.len(), 2);
        let (source, first) = scheduler.mapping().unmap(&published[0]).unwrap();
        assert_eq!(source, address());
        assert_eq!(first, message(0));
    }

    #[tokio::test]
    async fn test_failed_tick_leaves_cursor() {
        let remote = Arc::new(MockRemoteService::new());
        remote.push_page(address(), Ok(page(0, 0..3)));
        remote.push_page(address(), Err(crate::remote::RemoteError::Transport("down".into())));
        remote.push_page(address(), Ok(page(3, 3..4)));
        let transport = Arc::new(MockTransport::new("test"));
        let scheduler = scheduler(remote.clone(), transport);
        let subscription = Arc::new(Subscription::new(address()));

        scheduler.tick(&subscription).await;
        assert_eq!(scheduler.tick(&subscription).await, TickOutcome::Failed);
        assert_eq!(subscription.cursor().get(), 3);
        scheduler.tick(&subscription).await;

        assert_eq!(subscription.cursor().get(), 4);
        assert_eq!(remote.get_messages_calls(&address()), vec![0, 3, 3]);
        assert!(!subscription.is_pulling());
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_cursor_advanced() {
        let remote = Arc::new(MockRemoteService::new());
        remote.push_page(address(), Ok(page(0, 0..2)));
        let transport = Arc::new(MockTransport::new("test"));
        transport.set_fail_publish(true);
        let scheduler = scheduler(remote, transport.clone());
        let subscription = Arc::new(Subscription::new(address()));

        scheduler.tick(&subscription).await;

        assert_eq!(subscription.cursor().get(), 2);
        assert!(transport.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_register_rejects_zero_interval_and_duplicates() {
        let remote = Arc::new(MockRemoteService::new());
        let transport = Arc::new(MockTransport::new("test"));
        let scheduler = scheduler(remote, transport);
        let subscription = Arc::new(Subscription::new(address()));

        let disabled = Settings { interval: 0, owner: address() };
        assert!(!scheduler.register(&subscription, &disabled));
        assert!(!subscription.is_scheduled());

        let enabled = Settings { interval: 5, owner: address() };
        assert!(scheduler.register(&subscription, &enabled));
        assert!(!scheduler.register(&subscription, &enabled));
        assert!(subscription.is_scheduled());

        let registry = SubscriptionRegistry::new();
        let registered = registry.get_or_create(&address());
        assert!(scheduler.register(&registered, &enabled));
        scheduler.shutdown(&registry).await;
        assert!(!registered.is_scheduled());
        assert!(!scheduler.register(&registered, &enabled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_clamps_huge_interval() {
        let remote = Arc::new(MockRemoteService::new());
        let transport = Arc::new(MockTransport::new("test"));
        let scheduler = scheduler(remote.clone(), transport);
        let registry = SubscriptionRegistry::new();
        let subscription = registry.get_or_create(&address());

        let settings = Settings { interval: u64::MAX, owner: address() };
        assert!(scheduler.register(&subscription, &settings));

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        {
            let slot = subscription.timer().lock().unwrap();
            let handle = slot.as_ref().unwrap();
            assert_eq!(handle.period(), MAX_PULL_PERIOD);
            assert!(!handle.task.is_finished());
        }

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(remote.get_messages_calls(&address()).is_empty());

        scheduler.shutdown(&registry).await;
        assert!(!subscription.is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_scheduler_tickers_stop_at_next_tick() {
        let first: Address = "bkyz2-fmaaa-aaaaa-qaaaq-cai".parse().unwrap();
        let second: Address = "ryjl3-tyaaa-aaaaa-aaaba-cai".parse().unwrap();
        let remote = Arc::new(MockRemoteService::new());
        let transport = Arc::new(MockTransport::new("test"));
        let scheduler = scheduler(remote.clone(), transport);
        let registry = SubscriptionRegistry::new();
        let enabled = Settings { interval: 1, owner: first };

        let subscriptions = [registry.get_or_create(&first), registry.get_or_create(&second)];
        for subscription in &subscriptions {
            assert!(scheduler.register(subscription, &enabled));
        }

        // Closed but not yet cancelled: the window while shutdown walks the registry
        scheduler.context.closed.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5500)).await;

        assert_eq!(remote.total_calls(), 0);
        for subscription in &subscriptions {
            let slot = subscription.timer().lock().unwrap();
            assert!(slot.as_ref().unwrap().task.is_finished());
        }

        scheduler.shutdown(&registry).await;
        assert!(subscriptions.iter().all(|s| !s.is_scheduled()));
    }
}
