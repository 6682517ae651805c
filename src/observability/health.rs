//! Health check HTTP server
//!
//! Exposes liveness, readiness and metrics endpoints for operators and
//! container orchestration.

use crate::observability::metrics::metrics;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use warp::http::StatusCode;
use warp::Filter;

/// Seconds without forward or pull activity before the bridge reports stale
const ACTIVITY_STALENESS_THRESHOLD_SECONDS: u64 = 900;

/// HTTP health check server
pub struct HealthServer {
    bridge_id: String,
    port: u16,
    mqtt_connected: Arc<AtomicBool>,
    last_activity: Arc<AtomicU64>,
    additional_checks: Arc<RwLock<HashMap<String, HealthCheck>>>,
}

impl HealthServer {
    pub fn new(bridge_id: String, port: u16) -> Self {
        Self {
            bridge_id,
            port,
            mqtt_connected: Arc::new(AtomicBool::new(false)),
            last_activity: Arc::new(AtomicU64::new(0)),
            additional_checks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    /// Record a successful forward or pull
    pub fn record_activity(&self) {
        self.record_activity_at(current_timestamp());
    }

    /// Record activity observed at `timestamp` (unix seconds); never moves backwards
    pub fn record_activity_at(&self, timestamp: u64) {
        self.last_activity.fetch_max(timestamp, Ordering::Relaxed);
    }

    pub async fn add_health_check(&self, name: String, check: HealthCheck) {
        self.additional_checks.write().await.insert(name, check);
    }

    pub async fn remove_health_check(&self, name: &str) {
        self.additional_checks.write().await.remove(name);
    }

    /// Serve until the task is dropped
    pub async fn start(self: Arc<Self>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let health_server = self.clone();
        let ready_server = self.clone();

        // GET /health
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = health_server.clone();
            async move {
                let status = server.get_health_status().await;
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            }
        });

        // GET /metrics
        let metrics_route = warp::path("metrics")
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        // GET /ready
        let ready_route = warp::path("ready").and(warp::get()).map(move || {
            let ready = ready_server.mqtt_connected.load(Ordering::Relaxed);
            let response = ReadinessResponse {
                ready,
                timestamp: current_timestamp(),
            };
            let code = if ready {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            warp::reply::with_status(warp::reply::json(&response), code)
        });

        // GET /live
        let live_route = warp::path("live").and(warp::get()).map(|| {
            warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            })
        });

        // GET /
        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints: HashMap<&str, &str> = [
                ("/health", "Overall health status with detailed checks"),
                ("/metrics", "Forwarding, pull and broker statistics"),
                ("/ready", "Readiness probe"),
                ("/live", "Liveness probe"),
            ]
            .into_iter()
            .collect();
            warp::reply::json(&endpoints)
        });

        let routes = health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route);

        tracing::info!("Starting health server on port {}", self.port);
        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;

        Ok(())
    }

    async fn get_health_status(&self) -> HealthStatus {
        let mut checks = HashMap::new();
        checks.insert("mqtt".to_string(), self.check_mqtt_health());
        checks.insert("sync_activity".to_string(), self.check_activity_health());

        for (name, check) in self.additional_checks.read().await.iter() {
            checks.insert(name.clone(), check.clone());
        }

        let overall_healthy = checks.values().all(|check| check.status == "healthy");
        let snapshot = metrics().get_metrics();

        HealthStatus {
            status: if overall_healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: current_timestamp(),
            bridge_id: self.bridge_id.clone(),
            uptime_seconds: snapshot.lifecycle.uptime_seconds,
            active_schedules: snapshot.pulls.active_schedules,
            checks,
        }
    }

    fn check_mqtt_health(&self) -> HealthCheck {
        let connected = self.mqtt_connected.load(Ordering::Relaxed);
        HealthCheck {
            status: if connected { "healthy" } else { "unhealthy" }.to_string(),
            message: Some(
                if connected {
                    "Broker connection established"
                } else {
                    "Broker connection failed or disconnected"
                }
                .to_string(),
            ),
            last_check: current_timestamp(),
        }
    }

    fn check_activity_health(&self) -> HealthCheck {
        let now = current_timestamp();
        let last = self.last_activity.load(Ordering::Relaxed);

        let (status, message) = if last == 0 {
            ("healthy", "No traffic yet".to_string())
        } else if now.saturating_sub(last) > ACTIVITY_STALENESS_THRESHOLD_SECONDS {
            (
                "stale",
                format!("No sync activity for {} seconds", now - last),
            )
        } else {
            ("healthy", "Recent sync activity".to_string())
        };

        HealthCheck {
            status: status.to_string(),
            message: Some(message),
            last_check: now,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    bridge_id: String,
    uptime_seconds: u64,
    active_schedules: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
