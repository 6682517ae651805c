//! Pure connection state management for MQTT client
//!
//! This module contains pure functions for connection state management
//! and broker option construction.

use crate::config::MqttSection;
use crate::protocol::{PresenceMessage, PresenceStatus};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Permanently disconnected - max reconnection attempts exceeded
    PermanentlyDisconnected(String),
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay used after the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![100, 250, 500, 1000, 2500],
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Total time spent across all attempts, None when retries are unlimited
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Delay before the given (1-based) attempt
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Serialization error")]
    SerializationError(#[source] serde_json::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

/// Broker identity and credentials resolved from configuration
#[derive(Debug, Clone, Default)]
pub struct BrokerCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BrokerCredentials {
    pub fn from_env(config: &MqttSection) -> Self {
        let read = |name: &Option<String>| name.as_ref().and_then(|n| std::env::var(n).ok());
        Self {
            username: read(&config.username_env),
            password: read(&config.password_env),
        }
    }
}

/// Build broker options from configuration.
///
/// When `presence_topic` is given, an offline presence record is registered
/// as the last will.
pub fn configure_mqtt_options(
    bridge_id: &str,
    config: &MqttSection,
    presence_topic: Option<&str>,
) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let tls = url.scheme() == "mqtts";
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    // Unique per connection attempt so a stale session never kicks the new one
    let client_id = format!("bridge-{bridge_id}-{}", uuid::Uuid::new_v4().simple());
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    let credentials = BrokerCredentials::from_env(config);
    if let Some(username) = credentials.username {
        mqtt_options.set_credentials(username, credentials.password.unwrap_or_default());
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    if let Some(topic) = presence_topic {
        let offline = PresenceMessage::new(bridge_id, PresenceStatus::Offline);
        let payload = serde_json::to_vec(&offline).map_err(MqttError::SerializationError)?;
        let will = LastWill::new(topic, payload, QoS::AtLeastOnce, true, None);
        mqtt_options.set_last_will(will);
    }

    Ok(mqtt_options)
}
