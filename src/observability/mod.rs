//! Observability: structured logging, metrics and health endpoints

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{HealthCheck, HealthServer};
pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

pub use logging::{inbound_span, lifecycle_span, pull_span};
