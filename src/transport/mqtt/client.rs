//! Impure I/O operations for MQTT client
//!
//! This module handles all impure I/O operations including network communication,
//! async coordination, and integration with the rumqttc client.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, InboundRouter, MessageHandler, PUBLISH_QOS};
use crate::config::MqttSection;
use crate::protocol::InboundMessage;
use crate::transport::Transport;
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::PublishProperties;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the rumqttc request queue
const REQUEST_CAPACITY: usize = 64;

/// MQTT transport for the bridge
///
/// Owns the broker session, a reconnection supervisor, and the list of
/// subscriptions that are replayed after every reconnect.
pub struct MqttClient {
    bridge_id: String,
    config: MqttSection,
    presence_topic: Option<String>,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: Option<EventLoop>,
    event_loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    state_tx: Option<watch::Sender<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    reconnect_config: ReconnectConfig,
    subscribed_topics: Arc<Mutex<Vec<String>>>,
    router: Arc<Mutex<InboundRouter>>,
    connect_time: Option<Instant>,
    last_message_time: Arc<std::sync::Mutex<Option<Instant>>>,
    reconnect_count: Arc<AtomicU32>,
}

impl MqttClient {
    pub async fn new(
        bridge_id: &str,
        config: MqttSection,
        presence_topic: Option<&str>,
        forward_retained: bool,
    ) -> Result<Self, MqttError> {
        let (client, event_loop) = Self::create_connection(bridge_id, &config, presence_topic)?;

        Ok(MqttClient {
            bridge_id: bridge_id.to_string(),
            config,
            presence_topic: presence_topic.map(str::to_string),
            client: Arc::new(Mutex::new(client)),
            event_loop: Some(event_loop),
            event_loop_handle: std::sync::Mutex::new(None),
            state_rx: None,
            state_tx: None,
            shutdown_tx: None,
            reconnect_config: ReconnectConfig::default(),
            subscribed_topics: Arc::new(Mutex::new(Vec::new())),
            router: Arc::new(Mutex::new(InboundRouter::new(forward_retained))),
            connect_time: None,
            last_message_time: Arc::new(std::sync::Mutex::new(None)),
            reconnect_count: Arc::new(AtomicU32::new(0)),
        })
    }

    /// Override the reconnection policy; only effective before `connect`
    pub fn with_reconnect_config(mut self, reconnect_config: ReconnectConfig) -> Self {
        self.reconnect_config = reconnect_config;
        self
    }

    fn create_connection(
        bridge_id: &str,
        config: &MqttSection,
        presence_topic: Option<&str>,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(bridge_id, config, presence_topic)?;
        Ok(AsyncClient::new(mqtt_options, REQUEST_CAPACITY))
    }

    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels = watch::channel(ConnectionState::Connecting);
        let shutdown_channels = watch::channel(false);
        (state_channels, shutdown_channels)
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
                match *state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(reason.clone()));
                    }
                    ConnectionState::PermanentlyDisconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => continue,
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Connect to the broker and start the reconnection supervisor.
    ///
    /// Returns only once the broker acknowledged the session.
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        let event_loop = self.event_loop.take().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Event loop already started".to_string())
        })?;

        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            Self::setup_connection_channels();
        self.state_rx = Some(state_rx.clone());
        self.state_tx = Some(state_tx.clone());
        self.shutdown_tx = Some(shutdown_tx);

        let supervisor = Supervisor {
            bridge_id: self.bridge_id.clone(),
            config: self.config.clone(),
            presence_topic: self.presence_topic.clone(),
            client: self.client.clone(),
            state_tx,
            shutdown_rx,
            reconnect_config: self.reconnect_config.clone(),
            subscribed_topics: self.subscribed_topics.clone(),
            router: self.router.clone(),
            last_message_time: self.last_message_time.clone(),
            reconnect_count: self.reconnect_count.clone(),
            reconnect_attempts: 0,
        };

        let handle = tokio::spawn(supervisor.run(event_loop));
        if let Ok(mut slot) = self.event_loop_handle.lock() {
            *slot = Some(handle);
        }

        let connection_timeout =
            HealthMonitor::calculate_connection_timeout(&self.reconnect_config);
        Self::wait_for_connection_confirmation(state_rx, connection_timeout).await?;

        self.connect_time = Some(Instant::now());
        Ok(())
    }

    /// Stop the supervisor and close the broker session
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
            debug!("Sent shutdown signal to reconnection supervisor");
        }

        if self.state_rx.is_some() {
            let client = self.client.lock().await;
            client
                .disconnect()
                .await
                .map_err(|e| MqttError::ConnectionFailed(Box::new(e)))?;
        }

        if let Some(state_tx) = &self.state_tx {
            let _ = state_tx.send(ConnectionState::Disconnected(
                "Client disconnected".to_string(),
            ));
        }

        let handle = self
            .event_loop_handle
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => debug!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!("Event loop task ended with error: {}", e);
                }
                Err(_) => warn!("Event loop task didn't shut down gracefully, dropping it"),
                _ => {}
            }
        }

        info!("MQTT client disconnected");
        Ok(())
    }

    /// Current connection state, None before `connect`
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            Some(ConnectionState::PermanentlyDisconnected(_))
        )
    }

    pub fn get_health_metrics(&self) -> HealthMetrics {
        let last_message_time = self.last_message_time.lock().ok().and_then(|guard| *guard);
        HealthMonitor::calculate_health_metrics(
            self.connect_time,
            last_message_time,
            self.reconnect_count.load(Ordering::Relaxed),
        )
    }

    fn check_connection_state(&self) -> Result<(), MqttError> {
        let state_rx = self.state_rx.as_ref().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Client not connected".to_string())
        })?;

        let current_state = state_rx.borrow().clone();
        if !HealthMonitor::can_publish(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }

        Ok(())
    }

    /// Subscribe to a topic filter and remember it for resubscription
    pub async fn subscribe(&self, pattern: &str) -> Result<(), MqttError> {
        self.check_connection_state()?;

        info!("Subscribing to topic filter: {}", pattern);
        {
            let client = self.client.lock().await;
            client
                .subscribe(pattern, QoS::AtLeastOnce)
                .await
                .map_err(|e| {
                    MqttError::SubscriptionFailed(
                        format!("Failed to subscribe to {pattern}: {e}").into(),
                    )
                })?;
        }

        let mut topics = self.subscribed_topics.lock().await;
        if !topics.iter().any(|t| t == pattern) {
            topics.push(pattern.to_string());
        }
        Ok(())
    }

    /// Publish a payload at QoS 1
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), MqttError> {
        self.check_connection_state()?;

        let client = self.client.lock().await;
        client
            .publish_with_properties(topic, PUBLISH_QOS, retain, payload, PublishProperties::default())
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;

        debug!(topic, retain, "Published to broker");
        Ok(())
    }

    pub async fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        let mut router = self.router.lock().await;
        router.set_sender(sender);
    }
}

/// State owned by the spawned event loop task
struct Supervisor {
    bridge_id: String,
    config: MqttSection,
    presence_topic: Option<String>,
    client: Arc<Mutex<AsyncClient>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    reconnect_config: ReconnectConfig,
    subscribed_topics: Arc<Mutex<Vec<String>>>,
    router: Arc<Mutex<InboundRouter>>,
    last_message_time: Arc<std::sync::Mutex<Option<Instant>>>,
    reconnect_count: Arc<AtomicU32>,
    reconnect_attempts: u32,
}

impl Supervisor {
    async fn run(mut self, event_loop: EventLoop) {
        info!(bridge_id = %self.bridge_id, "Starting MQTT event loop");
        let mut current_event_loop = event_loop;
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping reconnection supervisor");
                        break;
                    }
                }

                event_result = current_event_loop.poll() => {
                    let keep_running = match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            self.process_event_route(route, &mut current_event_loop).await
                        }
                        Err(e) => {
                            let new_state = HealthMonitor::determine_next_state(
                                ConnectionEvent::NetworkError(e.to_string()),
                            );
                            let _ = self.state_tx.send(new_state);
                            self.reconnect(&mut current_event_loop).await
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }
        info!(bridge_id = %self.bridge_id, "MQTT event loop stopped");
    }

    /// Returns false when the loop should stop
    async fn process_event_route(
        &mut self,
        route: EventRoute,
        current_event_loop: &mut EventLoop,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                let new_state = HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived);
                let _ = self.state_tx.send(new_state);
                self.reconnect_attempts = 0;
                self.resubscribe_to_topics().await;
                true
            }
            EventRoute::MessageReceived(message) => {
                debug!(target: "mqtt_transport", "Received MQTT message on topic: {}", message.topic);
                if let Ok(mut last) = self.last_message_time.lock() {
                    *last = Some(Instant::now());
                }
                let router = self.router.lock().await;
                if let Err(e) = router.route(message).await {
                    error!("Failed to hand message to bridge: {}", e);
                }
                true
            }
            EventRoute::Disconnected => {
                let new_state =
                    HealthMonitor::determine_next_state(ConnectionEvent::DisconnectedByBroker);
                let _ = self.state_tx.send(new_state);
                self.reconnect(current_event_loop).await
            }
            EventRoute::SubscriptionConfirmed { packet_id } => {
                debug!(target: "mqtt_transport", "Subscription confirmed: packet {}", packet_id);
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn resubscribe_to_topics(&self) {
        let topics = self.subscribed_topics.lock().await.clone();
        let client = self.client.lock().await;
        for topic in &topics {
            if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                error!("Failed to re-subscribe to {}: {}", topic, e);
            } else {
                debug!(target: "mqtt_transport", "Re-subscribed to: {}", topic);
            }
        }
    }

    /// Sleep for `delay_ms` unless shutdown is requested first
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Returns false when the loop should stop
    async fn reconnect(&mut self, current_event_loop: &mut EventLoop) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.reconnect_config,
            *self.shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                self.reconnect_count.fetch_add(1, Ordering::Relaxed);
                let new_state =
                    HealthMonitor::determine_next_state(ConnectionEvent::ReconnectionStarted(attempt));
                let _ = self.state_tx.send(new_state);

                let max_display = self
                    .reconnect_config
                    .max_attempts
                    .map_or("unlimited".to_string(), |max| max.to_string());
                info!(
                    "Attempting reconnection {}/{} after {}ms delay",
                    attempt, max_display, delay_ms
                );

                if !Self::interruptible_sleep(self.shutdown_rx.clone(), delay_ms).await {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }

                match MqttClient::create_connection(
                    &self.bridge_id,
                    &self.config,
                    self.presence_topic.as_deref(),
                ) {
                    Ok((new_client, new_event_loop)) => {
                        *current_event_loop = new_event_loop;
                        *self.client.lock().await = new_client;
                        debug!("Swapped in new broker connection");
                    }
                    Err(e) => error!("Failed to create new connection: {}", e),
                }
                true
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "Max reconnection attempts ({}) exceeded",
                    self.reconnect_attempts
                );
                let new_state =
                    HealthMonitor::determine_next_state(ConnectionEvent::PermanentFailure(reason));
                let _ = self.state_tx.send(new_state);
                false
            }
        }
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), Self::Error> {
        MqttClient::subscribe(self, pattern).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), Self::Error> {
        MqttClient::publish(self, topic, payload, retain).await
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        MqttClient::connection_state(self)
    }

    fn is_permanently_disconnected(&self) -> bool {
        MqttClient::is_permanently_disconnected(self)
    }

    async fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        MqttClient::set_message_sender(self, sender).await
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        // Async disconnect is not possible here; only stop the background task
        if let Ok(mut slot) = self.event_loop_handle.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> MqttSection {
        MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            keep_alive_secs: 60,
        }
    }

    #[test]
    fn test_setup_connection_channels() {
        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            MqttClient::setup_connection_channels();

        assert_eq!(*state_rx.borrow(), ConnectionState::Connecting);
        assert!(!(*shutdown_rx.borrow()));

        state_tx.send(ConnectionState::Connected).unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);

        shutdown_tx.send(true).unwrap();
        assert!(*shutdown_rx.borrow());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_success() {
        let ((state_tx, state_rx), (_, _)) = MqttClient::setup_connection_channels();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Connected);
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(500))
                .await;
        assert!(result.is_ok(), "Should successfully wait for connection");
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_timeout() {
        let ((state_tx, state_rx), (_, _)) = MqttClient::setup_connection_channels();

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(10)).await;
        drop(state_tx);

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("ConnAck"), "got: {err_msg}");
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_disconnected() {
        let ((state_tx, state_rx), (_, _)) = MqttClient::setup_connection_channels();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Disconnected("Test disconnect".to_string()));
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(500))
                .await;
        assert!(result.unwrap_err().to_string().contains("Test disconnect"));
    }

    #[tokio::test]
    async fn test_interruptible_sleep() {
        let ((_, _), (_, shutdown_rx)) = MqttClient::setup_connection_channels();
        assert!(Supervisor::interruptible_sleep(shutdown_rx, 10).await);

        let ((_, _), (shutdown_tx, shutdown_rx)) = MqttClient::setup_connection_channels();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = shutdown_tx.send(true);
        });
        assert!(!Supervisor::interruptible_sleep(shutdown_rx, 1_000).await);
    }

    #[tokio::test]
    async fn test_connection_state_before_connect() {
        let client = MqttClient::new("bridge-state", test_config(), None, false)
            .await
            .unwrap();

        assert!(client.connection_state().is_none());
        assert!(!client.is_permanently_disconnected());
        assert!(!Transport::is_connected(&client));

        let metrics = client.get_health_metrics();
        assert_eq!(metrics.uptime, None);
        assert_eq!(metrics.reconnect_count, 0);
    }

    #[tokio::test]
    async fn test_operations_fail_without_connection() {
        let client = MqttClient::new("bridge-publish", test_config(), Some("presence"), false)
            .await
            .unwrap();

        assert!(client.publish("out/x", b"{}".to_vec(), false).await.is_err());
        assert!(client.subscribe("/#").await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let client = MqttClient::new("bridge-disc", test_config(), None, false)
            .await
            .unwrap();
        assert!(client.disconnect().await.is_ok());
    }
}
