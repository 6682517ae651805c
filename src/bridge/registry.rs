//! Subscription registry: one entry per canister address
//!
//! The registry lock only guards lookup and insertion. All per-address
//! coordination happens on the [`Subscription`] itself, so work on different
//! addresses never contends.

use super::cursor::Cursor;
use super::scheduler::PullHandle;
use super::settings::SettingsSlot;
use crate::protocol::Address;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Everything the bridge tracks for one address
#[derive(Debug)]
pub struct Subscription {
    address: Address,
    settings: SettingsSlot,
    cursor: Cursor,
    pull_in_flight: AtomicBool,
    timer: Mutex<Option<PullHandle>>,
}

impl Subscription {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            settings: SettingsSlot::new(),
            cursor: Cursor::new(),
            pull_in_flight: AtomicBool::new(false),
            timer: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn settings(&self) -> &SettingsSlot {
        &self.settings
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn is_scheduled(&self) -> bool {
        self.timer.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    pub fn is_pulling(&self) -> bool {
        self.pull_in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn timer(&self) -> &Mutex<Option<PullHandle>> {
        &self.timer
    }

    /// Claim the in-flight flag; false if a pull is already running
    pub(crate) fn try_begin_pull(&self) -> bool {
        self.pull_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_pull(&self) {
        self.pull_in_flight.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: RwLock<HashMap<Address, Arc<Subscription>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing subscription for `address`, or a fresh one. Idempotent.
    pub fn get_or_create(&self, address: &Address) -> Arc<Subscription> {
        if let Some(existing) = self.get(address) {
            return existing;
        }

        // A poisoned lock only means another thread panicked mid-insert; the map is still valid
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscriptions
            .entry(*address)
            .or_insert_with(|| Arc::new(Subscription::new(*address)))
            .clone()
    }

    pub fn get(&self, address: &Address) -> Option<Arc<Subscription>> {
        self.subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(address)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.subscriptions
            .read()
            .map(|subscriptions| subscriptions.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all subscriptions
    pub fn all(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(text: &str) -> Address {
        text.parse().unwrap()
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let a = address("bkyz2-fmaaa-aaaaa-qaaaq-cai");

        let first = registry.get_or_create(&a);
        let second = registry.get_or_create(&a);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_distinct_addresses_get_distinct_subscriptions() {
        let registry = SubscriptionRegistry::new();
        registry.get_or_create(&address("bkyz2-fmaaa-aaaaa-qaaaq-cai"));
        registry.get_or_create(&address("ryjl3-tyaaa-aaaaa-aaaba-cai"));

        assert_eq!(registry.len(), 2);
        assert!(registry.get(&address("aaaaa-aa")).is_none());
    }

    #[test]
    fn test_concurrent_creation_yields_one_subscription() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let a = address("bkyz2-fmaaa-aaaaa-qaaaq-cai");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.get_or_create(&a))
            })
            .collect();
        let subscriptions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(registry.len(), 1);
        assert!(subscriptions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_in_flight_flag() {
        let subscription = Subscription::new(address("aaaaa-aa"));
        assert!(subscription.try_begin_pull());
        assert!(subscription.is_pulling());
        assert!(!subscription.try_begin_pull());

        subscription.end_pull();
        assert!(!subscription.is_pulling());
        assert!(subscription.try_begin_pull());
    }
}
