//! Test helpers and utilities for integration tests

use canister_bridge::config::{BridgeConfig, BridgeSection, MqttSection, RemoteSection};
use canister_bridge::protocol::{Address, InboundMessage, Message, PagedResult, Settings};
use std::path::PathBuf;

#[allow(dead_code)]
pub const SENSOR_CANISTER: &str = "bkyz2-fmaaa-aaaaa-qaaaq-cai";
#[allow(dead_code)]
pub const LEDGER_CANISTER: &str = "ryjl3-tyaaa-aaaaa-aaaba-cai";

/// Create a test configuration for integration tests
#[allow(dead_code)]
pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        bridge: BridgeSection {
            id: "test-bridge".to_string(),
            subscribe_pattern: "/#".to_string(),
            outbound_prefix: "out".to_string(),
            presence_topic: "presence".to_string(),
            forward_retained: false,
            channel_capacity: 16,
        },
        mqtt: MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            keep_alive_secs: 60,
        },
        remote: RemoteSection {
            url: "http://127.0.0.1:4943/".to_string(),
            identity_pem: PathBuf::from("identity.pem"),
            fetch_root_key: None,
            request_timeout_secs: None,
        },
        health: None,
    }
}

#[allow(dead_code)]
pub fn address(text: &str) -> Address {
    text.parse().expect("valid principal text")
}

#[allow(dead_code)]
pub fn settings(address: Address, interval: u64) -> Settings {
    Settings {
        interval,
        owner: address,
    }
}

#[allow(dead_code)]
pub fn inbound(address: &str, path: &str, payload: &str) -> InboundMessage {
    InboundMessage::new(format!("/{address}{path}"), payload.as_bytes().to_vec())
}

/// A page holding messages `indices`, as a canister would return from `skip`
#[allow(dead_code)]
pub fn page(skip: u64, indices: std::ops::Range<u64>) -> PagedResult {
    let data: Vec<Message> = indices
        .map(|index| Message {
            index,
            topic: "/alerts".to_string(),
            message: format!("event-{index}"),
            timestamp: 1_700_000_000 + index,
        })
        .collect();
    PagedResult {
        skip,
        limit: 100,
        total: skip + data.len() as u64,
        data,
    }
}
