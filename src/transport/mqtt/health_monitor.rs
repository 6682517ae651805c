//! Pure reconnection and connection-state logic for the MQTT client

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether (and when) to attempt the next reconnection
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// How long `connect` waits for the first ConnAck
    pub fn calculate_connection_timeout(config: &ReconnectConfig) -> Duration {
        match config.calculate_max_total_time() {
            Some(max_total_time) => Duration::from_millis(max_total_time + 30_000),
            None => Duration::from_secs(60),
        }
    }

    /// Next connection state after an event
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => {
                info!("Connected to MQTT broker");
                ConnectionState::Connected
            }
            ConnectionEvent::DisconnectedByBroker => {
                info!("MQTT broker closed the connection");
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => {
                error!("MQTT event loop error: {}", error);
                ConnectionState::Disconnected(error)
            }
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::PermanentFailure(reason) => {
                error!("Permanent broker connection failure: {}", reason);
                ConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    /// Publishing and subscribing both require an acknowledged connection
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    pub fn calculate_health_metrics(
        connect_time: Option<Instant>,
        last_message_time: Option<Instant>,
        reconnect_count: u32,
    ) -> HealthMetrics {
        let now = Instant::now();
        HealthMetrics {
            uptime: connect_time.map(|t| now.duration_since(t)),
            time_since_last_message: last_message_time.map(|t| now.duration_since(t)),
            reconnect_count,
        }
    }
}

/// Reconnection decision
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Events driving connection state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    PermanentFailure(String),
}

/// Connection health snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct HealthMetrics {
    pub uptime: Option<Duration>,
    pub time_since_last_message: Option<Duration>,
    pub reconnect_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_attempt_reconnection() {
        let config = ReconnectConfig {
            max_attempts: Some(2),
            backoff_pattern: vec![10, 20],
            sustained_delay: 30,
        };

        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 10
            }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(2, &config, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config, true),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_unlimited_reconnection_never_aborts() {
        let config = ReconnectConfig::default();
        let decision = HealthMonitor::should_attempt_reconnection(10_000, &config, false);
        assert!(matches!(decision, ReconnectionDecision::Proceed { .. }));
    }

    #[test]
    fn test_calculate_connection_timeout() {
        assert_eq!(
            HealthMonitor::calculate_connection_timeout(&ReconnectConfig::default()),
            Duration::from_secs(60)
        );

        let limited = ReconnectConfig {
            max_attempts: Some(1),
            backoff_pattern: vec![1000],
            sustained_delay: 1000,
        };
        assert_eq!(
            HealthMonitor::calculate_connection_timeout(&limited),
            Duration::from_millis(31_000)
        );
    }

    #[test]
    fn test_determine_next_state() {
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived),
            ConnectionState::Connected
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ReconnectionStarted(3)),
            ConnectionState::Reconnecting(3)
        );
        assert!(matches!(
            HealthMonitor::determine_next_state(ConnectionEvent::PermanentFailure("x".into())),
            ConnectionState::PermanentlyDisconnected(_)
        ));
    }

    #[test]
    fn test_can_publish() {
        assert!(HealthMonitor::can_publish(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Connecting));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Reconnecting(1)));
    }

    #[test]
    fn test_health_metrics_without_connection() {
        let metrics = HealthMonitor::calculate_health_metrics(None, None, 0);
        assert_eq!(metrics.uptime, None);
        assert_eq!(metrics.reconnect_count, 0);
    }
}
