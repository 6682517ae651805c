//! Mock implementations for testing
//!
//! Provides a mock broker `Transport` and a scriptable `RemoteService` so the
//! synchronization engine can be exercised without a broker or a replica.

use crate::error::BridgeError;
use crate::protocol::{Address, BrokerPublication, InboundMessage, PagedResult, Settings};
use crate::remote::{RemoteError, RemoteService};
use crate::transport::{mqtt::ConnectionState, Transport};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Mock transport for testing
///
/// Non-retained publications (republished canister messages) and retained
/// ones (presence) are recorded separately.
#[derive(Debug, Default)]
pub struct MockTransport {
    pub id: String,
    pub published: Arc<Mutex<Vec<BrokerPublication>>>,
    pub retained: Arc<Mutex<Vec<BrokerPublication>>>,
    pub subscriptions: Arc<Mutex<Vec<String>>>,
    pub should_fail: bool,
    fail_publish: AtomicBool,
    connected: AtomicBool,
    disconnects: AtomicUsize,
    sender: Arc<Mutex<Option<mpsc::Sender<InboundMessage>>>>,
}

impl MockTransport {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Transport whose `connect` always fails
    pub fn with_failure() -> Self {
        Self {
            id: "failing".to_string(),
            should_fail: true,
            ..Default::default()
        }
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<BrokerPublication> {
        self.published.lock().await.clone()
    }

    pub async fn retained(&self) -> Vec<BrokerPublication> {
        self.retained.lock().await.clone()
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().await.clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Deliver a message as if it arrived from the broker.
    /// Returns false when no sender is installed or the receiver is gone.
    pub async fn inject(&self, message: InboundMessage) -> bool {
        let sender = self.sender.lock().await.clone();
        match sender {
            Some(sender) => sender.send(message).await.is_ok(),
            None => false,
        }
    }

    pub async fn clear_history(&self) {
        self.published.lock().await.clear();
        self.retained.lock().await.clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = BridgeError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        if self.should_fail {
            return Err(BridgeError::internal_error("Mock connection failure"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), Self::Error> {
        self.subscriptions.lock().await.push(pattern.to_string());
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), Self::Error> {
        if self.should_fail || self.fail_publish.load(Ordering::SeqCst) {
            return Err(BridgeError::internal_error("Mock publish failure"));
        }

        let publication = BrokerPublication {
            topic: topic.to_string(),
            payload,
        };
        if retain {
            self.retained.lock().await.push(publication);
        } else {
            self.published.lock().await.push(publication);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        if self.is_connected() {
            Some(ConnectionState::Connected)
        } else {
            Some(ConnectionState::Disconnected(
                "Mock disconnection".to_string(),
            ))
        }
    }

    fn is_permanently_disconnected(&self) -> bool {
        false
    }

    async fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        *self.sender.lock().await = Some(sender);
    }
}

#[derive(Debug, Default)]
struct RemoteScript {
    settings: HashMap<Address, Result<Settings, RemoteError>>,
    settings_calls: HashMap<Address, usize>,
    pages: HashMap<Address, VecDeque<Result<PagedResult, RemoteError>>>,
    get_messages_calls: HashMap<Address, Vec<u64>>,
    on_message_calls: HashMap<Address, Vec<(String, String)>>,
    on_message_failures: HashMap<Address, RemoteError>,
    settings_delay: Option<Duration>,
    pull_delay: Option<Duration>,
}

/// Scriptable remote service
///
/// Unscripted addresses resolve to settings with pulling disabled, and an
/// exhausted page queue answers with an empty page at the requested index.
#[derive(Debug, Default)]
pub struct MockRemoteService {
    script: std::sync::Mutex<RemoteScript>,
}

impl MockRemoteService {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, RemoteScript> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_settings(&self, address: Address, settings: Result<Settings, RemoteError>) {
        self.script().settings.insert(address, settings);
    }

    /// Delay every `getSettings` reply, to hold a fetch in flight
    pub fn set_settings_delay(&self, delay: Duration) {
        self.script().settings_delay = Some(delay);
    }

    /// Delay every `getMessages` reply, to hold a pull in flight
    pub fn set_pull_delay(&self, delay: Duration) {
        self.script().pull_delay = Some(delay);
    }

    /// Queue the reply for the next `getMessages` call on `address`
    pub fn push_page(&self, address: Address, page: Result<PagedResult, RemoteError>) {
        self.script()
            .pages
            .entry(address)
            .or_default()
            .push_back(page);
    }

    pub fn fail_on_message(&self, address: Address, error: RemoteError) {
        self.script().on_message_failures.insert(address, error);
    }

    pub fn get_settings_count(&self, address: &Address) -> usize {
        self.script()
            .settings_calls
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    /// `fromIndex` of every `getMessages` call on `address`, in order
    pub fn get_messages_calls(&self, address: &Address) -> Vec<u64> {
        self.script()
            .get_messages_calls
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    /// `(topic, payload)` of every `onMessage` call on `address`, in order
    pub fn on_message_calls(&self, address: &Address) -> Vec<(String, String)> {
        self.script()
            .on_message_calls
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        let script = self.script();
        script.settings_calls.values().sum::<usize>()
            + script.get_messages_calls.values().map(Vec::len).sum::<usize>()
            + script.on_message_calls.values().map(Vec::len).sum::<usize>()
    }
}

#[async_trait]
impl RemoteService for MockRemoteService {
    async fn get_settings(&self, address: &Address) -> Result<Settings, RemoteError> {
        let (reply, delay) = {
            let mut script = self.script();
            *script.settings_calls.entry(*address).or_default() += 1;
            let reply = script.settings.get(address).cloned().unwrap_or(Ok(Settings {
                interval: 0,
                owner: *address,
            }));
            (reply, script.settings_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        reply
    }

    async fn get_messages(
        &self,
        address: &Address,
        from_index: u64,
    ) -> Result<PagedResult, RemoteError> {
        let (reply, delay) = {
            let mut script = self.script();
            script
                .get_messages_calls
                .entry(*address)
                .or_default()
                .push(from_index);
            let reply = script
                .pages
                .get_mut(address)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(PagedResult {
                    skip: from_index,
                    limit: 100,
                    total: from_index,
                    data: Vec::new(),
                }));
            (reply, script.pull_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        reply
    }

    async fn on_message(
        &self,
        address: &Address,
        topic: &str,
        payload: &str,
    ) -> Result<(), RemoteError> {
        let mut script = self.script();
        script
            .on_message_calls
            .entry(*address)
            .or_default()
            .push((topic.to_string(), payload.to_string()));
        match script.on_message_failures.get(address) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}
