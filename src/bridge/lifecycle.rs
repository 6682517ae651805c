//! Bridge lifecycle: startup and graceful shutdown
//!
//! Startup connects the broker, wires the inbound channel, subscribes to the
//! configured pattern, announces presence and starts the coordinator.
//! Shutdown stops inbound handling, cancels every pull timer, waits for
//! in-flight handlers, retracts presence and disconnects.

use super::coordinator::Bridge;
use crate::config::{BridgeConfig, ConfigError};
use crate::lifecycle_span;
use crate::observability::{metrics, HealthServer};
use crate::protocol::{PresenceMessage, PresenceStatus, RepublishMapping};
use crate::remote::RemoteService;
use crate::transport::Transport;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

/// Parts that exist only while the bridge is running
struct Running<T: Transport> {
    bridge: Arc<Bridge<T>>,
    transport: Arc<T>,
    shutdown_tx: watch::Sender<bool>,
    run_handle: JoinHandle<()>,
}

pub struct BridgeLifecycle<T>
where
    T: Transport + 'static,
{
    config: BridgeConfig,
    remote: Arc<dyn RemoteService>,
    transport: Option<T>,
    running: Option<Running<T>>,
    health_server: Option<Arc<HealthServer>>,
}

impl<T> BridgeLifecycle<T>
where
    T: Transport + 'static,
{
    pub fn new(config: BridgeConfig, transport: T, remote: Arc<dyn RemoteService>) -> Self {
        Self {
            config,
            remote,
            transport: Some(transport),
            running: None,
            health_server: None,
        }
    }

    pub fn set_health_server(&mut self, health_server: Arc<HealthServer>) {
        self.health_server = Some(health_server);
    }

    pub fn bridge_id(&self) -> &str {
        &self.config.bridge.id
    }

    /// The coordinator, once started
    pub fn bridge(&self) -> Option<&Arc<Bridge<T>>> {
        self.running.as_ref().map(|running| &running.bridge)
    }

    /// The shared transport, once started
    pub fn transport(&self) -> Option<&Arc<T>> {
        self.running.as_ref().map(|running| &running.transport)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        match (&self.running, &self.transport) {
            (Some(running), _) => running.transport.is_permanently_disconnected(),
            (None, Some(transport)) => transport.is_permanently_disconnected(),
            (None, None) => false,
        }
    }

    fn presence_payload(&self, status: PresenceStatus) -> Option<(String, Vec<u8>)> {
        let topic = self.config.presence_topic()?;
        let presence = PresenceMessage::new(self.config.bridge.id.clone(), status);
        match serde_json::to_vec(&presence) {
            Ok(payload) => Some((topic.to_string(), payload)),
            Err(e) => {
                warn!("Failed to encode presence: {}", e);
                None
            }
        }
    }

    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        let span = lifecycle_span!(bridge_id = %self.config.bridge.id);
        self.start_inner().instrument(span).await
    }

    async fn start_inner(&mut self) -> Result<(), LifecycleError> {
        info!("Starting bridge");
        metrics().set_bridge_state("starting");

        let Some(mut transport) = self.transport.take() else {
            return Err(LifecycleError::InitializationError(
                "Bridge already started".to_string(),
            ));
        };

        if let Err(e) = transport.connect().await {
            metrics().set_bridge_state("failed");
            return Err(LifecycleError::TransportError(Box::new(e)));
        }
        info!("Broker transport connected");

        // Sender must be in place before the subscription delivers anything
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.bridge.channel_capacity);
        transport.set_message_sender(inbound_tx).await;

        transport
            .subscribe(&self.config.bridge.subscribe_pattern)
            .await
            .map_err(|e| LifecycleError::TransportError(Box::new(e)))?;
        info!(
            pattern = %self.config.bridge.subscribe_pattern,
            "Subscribed to inbound topics"
        );

        if let Some((topic, payload)) = self.presence_payload(PresenceStatus::Online) {
            transport
                .publish(&topic, payload, true)
                .await
                .map_err(|e| LifecycleError::TransportError(Box::new(e)))?;
            info!(topic = %topic, "Published online presence");
        }

        let transport = Arc::new(transport);
        let bridge = Arc::new(Bridge::new(
            self.remote.clone(),
            transport.clone(),
            RepublishMapping::new(self.config.bridge.outbound_prefix.clone()),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run_handle = tokio::spawn(bridge.clone().run(inbound_rx, shutdown_rx));

        if let Some(health) = &self.health_server {
            health.set_mqtt_connected(transport.is_connected());
        }
        metrics().set_bridge_state("running");

        self.running = Some(Running {
            bridge,
            transport,
            shutdown_tx,
            run_handle,
        });
        info!("Bridge started");
        Ok(())
    }

    /// Stop the bridge. Safe to call when not started.
    pub async fn shutdown(&mut self) -> Result<(), LifecycleError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        let span = lifecycle_span!(bridge_id = %self.config.bridge.id);

        async {
            info!("Shutting down bridge");
            metrics().set_bridge_state("stopping");

            let _ = running.shutdown_tx.send(true);
            running.bridge.shutdown().await;

            if let Err(e) = running.run_handle.await {
                if !e.is_cancelled() {
                    error!("Coordinator shutdown error: {}", e);
                }
            }

            if let Some((topic, payload)) = self.presence_payload(PresenceStatus::Offline) {
                if let Err(e) = running.transport.publish(&topic, payload, true).await {
                    warn!(topic = %topic, "Failed to publish offline presence: {}", e);
                }
            }

            if let Err(e) = running.transport.disconnect().await {
                warn!("Broker disconnect failed: {}", e);
            }
            if let Some(health) = &self.health_server {
                health.set_mqtt_connected(false);
            }

            metrics().set_bridge_state("stopped");
            info!("Bridge shutdown complete");
        }
        .instrument(span)
        .await;

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Configuration error")]
    ConfigurationError(#[source] ConfigError),
    #[error("Transport error")]
    TransportError(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Initialization error: {0}")]
    InitializationError(String),
}

impl From<ConfigError> for LifecycleError {
    fn from(err: ConfigError) -> Self {
        LifecycleError::ConfigurationError(err)
    }
}
