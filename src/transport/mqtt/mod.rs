//! MQTT client implementation for the bridge
//!
//! The module separates pure decision logic from I/O:
//!
//! - [`connection`] - Connection state, reconnect policy and broker options
//! - [`message_handler`] - Event routing and inbound hand-off
//! - [`health_monitor`] - Reconnection decisions and health metrics
//! - [`client`] - Impure I/O operations and coordination
//!
//! # Usage
//!
//! ```rust,no_run
//! use canister_bridge::transport::mqtt::MqttClient;
//! use canister_bridge::config::MqttSection;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     username_env: None,
//!     password_env: None,
//!     keep_alive_secs: 60,
//! };
//!
//! let mut client = MqttClient::new("my-bridge", config, Some("presence"), false).await?;
//! client.connect().await?;
//! client.subscribe("/#").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{BrokerCredentials, ConnectionState, MqttError, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, InboundRouter, MessageHandler};
