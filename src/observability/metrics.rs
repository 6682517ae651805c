//! Thread-safe metrics collection
//!
//! Atomic counters for the hot paths (inbound forwarding, pull cycles, broker
//! traffic) and mutex-protected collections for timings and per-address stats.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Timing samples kept per series
const MAX_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

pub struct MetricsCollector {
    // Inbound path
    messages_received: AtomicU64,
    messages_forwarded: AtomicU64,
    forward_failures: AtomicU64,
    parse_failures: AtomicU64,
    settings_fetches: AtomicU64,
    settings_fetch_failures: AtomicU64,

    // Pull path
    pulls_started: AtomicU64,
    pulls_completed: AtomicU64,
    pulls_failed: AtomicU64,
    pulls_skipped: AtomicU64,
    messages_republished: AtomicU64,
    republish_failures: AtomicU64,
    active_schedules: AtomicU64,
    pull_times: Mutex<Vec<u64>>,

    // Broker connection
    mqtt_connected: AtomicBool,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connection_start_time: AtomicU64,

    address_stats: Mutex<HashMap<String, AddressStats>>,

    // Lifecycle
    bridge_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_forwarded: AtomicU64::new(0),
            forward_failures: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            settings_fetches: AtomicU64::new(0),
            settings_fetch_failures: AtomicU64::new(0),
            pulls_started: AtomicU64::new(0),
            pulls_completed: AtomicU64::new(0),
            pulls_failed: AtomicU64::new(0),
            pulls_skipped: AtomicU64::new(0),
            messages_republished: AtomicU64::new(0),
            republish_failures: AtomicU64::new(0),
            active_schedules: AtomicU64::new(0),
            pull_times: Mutex::new(Vec::new()),
            mqtt_connected: AtomicBool::new(false),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            address_stats: Mutex::new(HashMap::new()),
            bridge_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(current_timestamp()),
            state_transitions: AtomicU64::new(0),
        }
    }

    // Inbound path
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_forwarded(&self, address: &str) {
        self.messages_forwarded.fetch_add(1, Ordering::Relaxed);
        self.with_address(address, |stats| stats.forwarded += 1);
    }

    pub fn forward_failed(&self, address: &str) {
        self.forward_failures.fetch_add(1, Ordering::Relaxed);
        self.with_address(address, |stats| stats.failures += 1);
    }

    pub fn parse_failed(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn settings_fetched(&self, success: bool) {
        self.settings_fetches.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.settings_fetch_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    // Pull path
    pub fn pull_started(&self) {
        self.pulls_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pull_completed(&self, address: &str, republished: u64, duration: Duration) {
        self.pulls_completed.fetch_add(1, Ordering::Relaxed);
        self.record_pull_time(duration);
        self.with_address(address, |stats| stats.pulled += republished);
    }

    pub fn pull_failed(&self, address: &str, duration: Duration) {
        self.pulls_failed.fetch_add(1, Ordering::Relaxed);
        self.record_pull_time(duration);
        self.with_address(address, |stats| stats.failures += 1);
    }

    pub fn pull_skipped(&self) {
        self.pulls_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_republished(&self) {
        self.messages_republished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn republish_failed(&self) {
        self.republish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn schedule_started(&self) {
        self.active_schedules.fetch_add(1, Ordering::Relaxed);
    }

    pub fn schedule_stopped(&self) {
        let _ = self
            .active_schedules
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    fn record_pull_time(&self, duration: Duration) {
        if let Ok(mut times) = self.pull_times.lock() {
            times.push(duration.as_millis() as u64);
            if times.len() > MAX_SAMPLES {
                times.remove(0);
            }
        }
    }

    fn with_address(&self, address: &str, update: impl FnOnce(&mut AddressStats)) {
        if let Ok(mut stats) = self.address_stats.lock() {
            let entry = stats.entry(address.to_string()).or_default();
            update(entry);
            entry.last_activity = current_timestamp();
        }
    }

    /// Most recent per-address activity (unix seconds), 0 if none
    pub fn latest_activity(&self) -> u64 {
        self.address_stats
            .lock()
            .map(|stats| stats.values().map(|s| s.last_activity).max().unwrap_or(0))
            .unwrap_or(0)
    }

    // Broker connection
    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    // Lifecycle
    pub fn set_bridge_state(&self, state: &str) {
        if let Ok(mut current_state) = self.bridge_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    pub fn bridge_state(&self) -> String {
        self.bridge_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.messages_received,
            &self.messages_forwarded,
            &self.forward_failures,
            &self.parse_failures,
            &self.settings_fetches,
            &self.settings_fetch_failures,
            &self.pulls_started,
            &self.pulls_completed,
            &self.pulls_failed,
            &self.pulls_skipped,
            &self.messages_republished,
            &self.republish_failures,
            &self.active_schedules,
            &self.connections_established,
            &self.connection_failures,
            &self.connection_start_time,
            &self.state_transitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);

        if let Ok(mut times) = self.pull_times.lock() {
            times.clear();
        }
        if let Ok(mut stats) = self.address_stats.lock() {
            stats.clear();
        }
        if let Ok(mut state) = self.bridge_state.lock() {
            *state = "initializing".to_string();
        }
    }

    fn pull_time_statistics(&self) -> (f64, f64, f64) {
        let Ok(times) = self.pull_times.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        let mut sorted = times.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
    }

    fn connection_duration(&self, now: u64) -> u64 {
        let start = self.connection_start_time.load(Ordering::Relaxed);
        if self.mqtt_connected.load(Ordering::Relaxed) && start > 0 {
            now.saturating_sub(start)
        } else {
            0
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_pull_time_ms, pull_time_p50_ms, pull_time_p95_ms) = self.pull_time_statistics();
        let addresses = self
            .address_stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default();

        MetricsSnapshot {
            inbound: InboundMetrics {
                messages_received: self.messages_received.load(Ordering::Relaxed),
                messages_forwarded: self.messages_forwarded.load(Ordering::Relaxed),
                forward_failures: self.forward_failures.load(Ordering::Relaxed),
                parse_failures: self.parse_failures.load(Ordering::Relaxed),
                settings_fetches: self.settings_fetches.load(Ordering::Relaxed),
                settings_fetch_failures: self.settings_fetch_failures.load(Ordering::Relaxed),
            },
            pulls: PullMetrics {
                pulls_started: self.pulls_started.load(Ordering::Relaxed),
                pulls_completed: self.pulls_completed.load(Ordering::Relaxed),
                pulls_failed: self.pulls_failed.load(Ordering::Relaxed),
                pulls_skipped: self.pulls_skipped.load(Ordering::Relaxed),
                messages_republished: self.messages_republished.load(Ordering::Relaxed),
                republish_failures: self.republish_failures.load(Ordering::Relaxed),
                active_schedules: self.active_schedules.load(Ordering::Relaxed),
                avg_pull_time_ms,
                pull_time_p50_ms,
                pull_time_p95_ms,
            },
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connection_duration_seconds: self.connection_duration(now),
            },
            addresses,
            lifecycle: LifecycleMetrics {
                current_state: self.bridge_state(),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AddressStats {
    pub forwarded: u64,
    pub pulled: u64,
    pub failures: u64,
    pub last_activity: u64,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub inbound: InboundMetrics,
    pub pulls: PullMetrics,
    pub mqtt: MqttMetrics,
    pub addresses: HashMap<String, AddressStats>,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct InboundMetrics {
    pub messages_received: u64,
    pub messages_forwarded: u64,
    pub forward_failures: u64,
    pub parse_failures: u64,
    pub settings_fetches: u64,
    pub settings_fetch_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct PullMetrics {
    pub pulls_started: u64,
    pub pulls_completed: u64,
    pub pulls_failed: u64,
    pub pulls_skipped: u64,
    pub messages_republished: u64,
    pub republish_failures: u64,
    pub active_schedules: u64,
    pub avg_pull_time_ms: f64,
    pub pull_time_p50_ms: f64,
    pub pull_time_p95_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = sorted_data[index.floor() as usize] as f64;
    let upper = sorted_data[index.ceil() as usize] as f64;
    lower + (upper - lower) * index.fract()
}
