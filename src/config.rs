//! Configuration system for the canister bridge
//!
//! Configuration is read from a TOML file with four sections: `[bridge]`,
//! `[mqtt]`, `[remote]` and the optional `[health]`. Secrets are never stored
//! in the file; broker credentials are named by environment variable and the
//! signing identity is referenced by path.

use crate::protocol::{topic_matches_filter, validate_publish_topic, validate_topic_filter};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

/// Main bridge configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    pub bridge: BridgeSection,
    pub mqtt: MqttSection,
    pub remote: RemoteSection,
    /// Health server (optional)
    pub health: Option<HealthSection>,
}

/// Bridge section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeSection {
    /// Bridge identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    /// Broker filter for inbound device traffic
    #[serde(default = "default_subscribe_pattern")]
    pub subscribe_pattern: String,
    /// Topic prefix for messages pulled from canisters
    #[serde(default = "default_outbound_prefix")]
    pub outbound_prefix: String,
    /// Presence topic, empty string disables presence
    #[serde(default = "default_presence_topic")]
    pub presence_topic: String,
    /// Forward retained messages to canisters (default: false)
    #[serde(default)]
    pub forward_retained: bool,
    /// Capacity of the inbound message queue
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// MQTT section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Keep alive in seconds (default: 60)
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

/// Remote canister endpoint section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteSection {
    /// Replica or boundary node URL
    pub url: String,
    /// PEM file holding the Ed25519 signing identity
    pub identity_pem: PathBuf,
    /// Fetch the root key before the first call. Unset means "only for loopback hosts".
    pub fetch_root_key: Option<bool>,
    /// Deadline for a single canister call, unset means no deadline
    pub request_timeout_secs: Option<u64>,
}

/// Health server section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    pub port: u16,
}

fn default_subscribe_pattern() -> String {
    "/#".to_string()
}

fn default_outbound_prefix() -> String {
    "out".to_string()
}

fn default_presence_topic() -> String {
    "presence".to_string()
}

fn default_channel_capacity() -> usize {
    100
}

fn default_keep_alive() -> u64 {
    60
}

impl BridgeSection {
    /// Presence topic, if presence announcements are enabled
    pub fn presence_topic(&self) -> Option<&str> {
        if self.presence_topic.is_empty() {
            None
        } else {
            Some(self.presence_topic.as_str())
        }
    }
}

impl RemoteSection {
    /// Whether the one-time trust bootstrap must run before any canister call.
    pub fn needs_trust_bootstrap(&self) -> bool {
        if let Some(explicit) = self.fetch_root_key {
            return explicit;
        }

        Url::parse(&self.url)
            .ok()
            .and_then(|url| url.host_str().map(is_loopback_host))
            .unwrap_or(false)
    }

    pub fn request_timeout(&self) -> Option<std::time::Duration> {
        self.request_timeout_secs.map(std::time::Duration::from_secs)
    }
}

fn is_loopback_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "[::1]" | "::1")
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid bridge ID format: {0}")]
    InvalidBridgeId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_bridge_id(&self.bridge.id)?;
        self.validate_topics()?;
        self.validate_urls()?;

        if self.bridge.channel_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "bridge.channel_capacity must be greater than 0".to_string(),
            ));
        }

        if let Some(health) = &self.health {
            if health.port == 0 {
                return Err(ConfigError::InvalidConfig(
                    "health.port must be non-zero".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn validate_topics(&self) -> Result<(), ConfigError> {
        let pattern = &self.bridge.subscribe_pattern;
        validate_topic_filter(pattern)
            .map_err(|e| ConfigError::InvalidConfig(format!("bridge.subscribe_pattern: {e}")))?;

        let prefix = self.bridge.outbound_prefix.trim_end_matches('/');
        validate_publish_topic(prefix)
            .map_err(|e| ConfigError::InvalidConfig(format!("bridge.outbound_prefix: {e}")))?;

        // Republished topics are "<prefix>/<address>" or deeper
        let republished = [
            format!("{prefix}/aaaaa-aa"),
            format!("{prefix}/aaaaa-aa/sensor1"),
        ];
        if republished
            .iter()
            .any(|topic| topic_matches_filter(pattern, topic))
        {
            return Err(ConfigError::InvalidConfig(format!(
                "bridge.outbound_prefix '{prefix}' is matched by subscribe_pattern '{pattern}'; republished messages would loop back"
            )));
        }

        if let Some(presence) = self.bridge.presence_topic() {
            validate_publish_topic(presence)
                .map_err(|e| ConfigError::InvalidConfig(format!("bridge.presence_topic: {e}")))?;
        }

        Ok(())
    }

    fn validate_urls(&self) -> Result<(), ConfigError> {
        let broker = Url::parse(&self.mqtt.broker_url).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "mqtt.broker_url '{}': {e}",
                self.mqtt.broker_url
            ))
        })?;
        if !matches!(broker.scheme(), "mqtt" | "mqtts" | "tcp") {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.broker_url scheme '{}' is not one of mqtt, mqtts, tcp",
                broker.scheme()
            )));
        }

        let remote = Url::parse(&self.remote.url).map_err(|e| {
            ConfigError::InvalidConfig(format!("remote.url '{}': {e}", self.remote.url))
        })?;
        if !matches!(remote.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidConfig(format!(
                "remote.url scheme '{}' is not one of http, https",
                remote.scheme()
            )));
        }

        Ok(())
    }

    /// Helper to read an optional environment variable named in config
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[bridge]
id = "test-bridge"

[mqtt]
broker_url = "mqtt://localhost:1883"

[remote]
url = "http://127.0.0.1:4943/"
identity_pem = "identity.pem"
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

/// Validate bridge ID format
fn validate_bridge_id(bridge_id: &str) -> Result<(), ConfigError> {
    let valid_chars = bridge_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if bridge_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidBridgeId(format!(
            "Bridge ID '{bridge_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
[mqtt]
broker_url = "mqtt://localhost:1883"

[remote]
url = "http://127.0.0.1:4943/"
identity_pem = "identity.pem"
"#;

    fn with_bridge(bridge: &str) -> String {
        format!("[bridge]\n{bridge}\n{BASE}")
    }

    #[test]
    fn test_defaults_applied() {
        let config = BridgeConfig::test_config();
        assert_eq!(config.bridge.id, "test-bridge");
        assert_eq!(config.bridge.subscribe_pattern, "/#");
        assert_eq!(config.bridge.outbound_prefix, "out");
        assert_eq!(config.bridge.presence_topic(), Some("presence"));
        assert!(!config.bridge.forward_retained);
        assert_eq!(config.bridge.channel_capacity, 100);
        assert_eq!(config.mqtt.keep_alive_secs, 60);
        assert_eq!(config.remote.fetch_root_key, None);
        assert!(config.health.is_none());
    }

    #[test]
    fn test_invalid_bridge_id() {
        assert!(validate_bridge_id("invalid@bridge").is_err());
        assert!(validate_bridge_id("").is_err());
        assert!(validate_bridge_id("bridge-1_a.b").is_ok());
    }

    #[test]
    fn test_loopback_prefix_rejected() {
        let toml = with_bridge("id = \"b\"\noutbound_prefix = \"/out\"");
        let result = BridgeConfig::from_toml_str(&toml);
        assert!(
            matches!(result, Err(ConfigError::InvalidConfig(ref m)) if m.contains("loop back")),
            "got {result:?}"
        );

        let toml = with_bridge("id = \"b\"\nsubscribe_pattern = \"#\"");
        assert!(BridgeConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_single_level_loopback_rejected() {
        // "<prefix>/<address>" is what a root message topic republishes to
        let toml = with_bridge("id = \"b\"\nsubscribe_pattern = \"out/+\"");
        let result = BridgeConfig::from_toml_str(&toml);
        assert!(
            matches!(result, Err(ConfigError::InvalidConfig(ref m)) if m.contains("loop back")),
            "got {result:?}"
        );

        let toml = with_bridge("id = \"b\"\nsubscribe_pattern = \"out/+/+\"");
        assert!(BridgeConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_narrow_pattern_allows_any_prefix() {
        let toml = with_bridge("id = \"b\"\nsubscribe_pattern = \"/+/in/#\"\noutbound_prefix = \"/out\"");
        assert!(BridgeConfig::from_toml_str(&toml).is_ok());
    }

    #[test]
    fn test_presence_can_be_disabled() {
        let toml = with_bridge("id = \"b\"\npresence_topic = \"\"");
        let config = BridgeConfig::from_toml_str(&toml).unwrap();
        assert_eq!(config.bridge.presence_topic(), None);
    }

    #[test]
    fn test_trust_bootstrap_follows_host() {
        let mut remote = BridgeConfig::test_config().remote;
        assert!(remote.needs_trust_bootstrap());

        remote.url = "https://icp-api.io".to_string();
        assert!(!remote.needs_trust_bootstrap());

        remote.fetch_root_key = Some(true);
        assert!(remote.needs_trust_bootstrap());

        remote.url = "http://localhost:4943".to_string();
        remote.fetch_root_key = Some(false);
        assert!(!remote.needs_trust_bootstrap());
    }

    #[test]
    fn test_rejects_bad_urls() {
        let toml = r#"
[bridge]
id = "b"

[mqtt]
broker_url = "http://localhost:1883"

[remote]
url = "http://127.0.0.1:4943/"
identity_pem = "identity.pem"
"#;
        assert!(BridgeConfig::from_toml_str(toml).is_err());

        let toml = r#"
[bridge]
id = "b"

[mqtt]
broker_url = "mqtt://localhost:1883"

[remote]
url = "not a url"
identity_pem = "identity.pem"
"#;
        assert!(BridgeConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_zero_health_port_rejected() {
        let toml = format!("{}\n[health]\nport = 0\n", with_bridge("id = \"b\""));
        assert!(BridgeConfig::from_toml_str(&toml).is_err());
    }
}
