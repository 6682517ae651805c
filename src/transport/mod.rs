//! Broker transport layer
//!
//! This module provides the broker abstraction the bridge publishes and
//! subscribes through, plus the MQTT implementation.

use crate::protocol::InboundMessage;

pub mod mqtt;

/// Transport trait for broker communication
///
/// Only `connect` needs exclusive access; everything after that works through
/// a shared reference so the coordinator and pull tasks can hold the transport
/// behind an `Arc`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect to the broker
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Disconnect from the broker
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Subscribe to a topic filter; the subscription survives reconnects
    async fn subscribe(&self, pattern: &str) -> Result<(), Self::Error>;

    /// Publish a payload to a topic
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool)
    -> Result<(), Self::Error>;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Get current connection state
    fn connection_state(&self) -> Option<crate::transport::mqtt::ConnectionState>;

    /// Check if the connection is permanently disconnected
    fn is_permanently_disconnected(&self) -> bool;

    /// Set the channel that receives inbound broker messages
    async fn set_message_sender(&self, sender: tokio::sync::mpsc::Sender<InboundMessage>);
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttClient;
