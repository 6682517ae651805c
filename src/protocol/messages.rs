//! Message types exchanged with canisters and the broker
//!
//! `Settings`, `Message` and `PagedResult` mirror the records returned by a
//! canister's `getSettings` and `getMessages` methods. `RepublishMapping`
//! defines how a pulled `Message` becomes a broker publication.

use super::address::Address;
use super::topics::canonicalize_topic;
use candid::CandidType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-canister bridge settings, fetched once and cached for the process lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Pull interval in seconds, `0` disables pulling
    pub interval: u64,
    /// Principal that owns the canister
    pub owner: Address,
}

impl Settings {
    pub fn pull_enabled(&self) -> bool {
        self.interval > 0
    }
}

/// A message stored in a canister's outbound log.
#[derive(Debug, Clone, PartialEq, Eq, CandidType, Serialize, Deserialize)]
pub struct Message {
    pub index: u64,
    pub topic: String,
    pub message: String,
    pub timestamp: u64,
}

/// One page of a canister's outbound log starting at `skip`.
#[derive(Debug, Clone, PartialEq, Eq, CandidType, Serialize, Deserialize)]
pub struct PagedResult {
    pub skip: u64,
    pub limit: u64,
    pub total: u64,
    pub data: Vec<Message>,
}

/// A message received from the broker, before address resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }
}

/// A topic/payload pair ready to be handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerPublication {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Maps pulled canister messages onto broker topics.
///
/// Topic: `<prefix>/<address><canonical message topic>` (the message topic is
/// omitted when it canonicalizes to `/`). Payload: the full `Message` as JSON.
/// Distinct `(address, message)` pairs always yield distinct publications.
#[derive(Debug, Clone, PartialEq)]
pub struct RepublishMapping {
    prefix: String,
}

impl RepublishMapping {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Topic a message from `address` is republished under.
    pub fn topic_for(&self, address: &Address, message_topic: &str) -> String {
        let suffix = canonicalize_topic(message_topic);
        if suffix == "/" {
            format!("{}/{}", self.prefix, address)
        } else {
            format!("{}/{}{}", self.prefix, address, suffix)
        }
    }

    pub fn map(
        &self,
        address: &Address,
        message: &Message,
    ) -> Result<BrokerPublication, serde_json::Error> {
        Ok(BrokerPublication {
            topic: self.topic_for(address, &message.topic),
            payload: serde_json::to_vec(message)?,
        })
    }

    /// Recover the source address and message from a publication produced by `map`.
    pub fn unmap(&self, publication: &BrokerPublication) -> Option<(Address, Message)> {
        let rest = publication
            .topic
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('/')?;
        let address_text = rest.split('/').next()?;
        let address = address_text.parse().ok()?;
        let message: Message = serde_json::from_slice(&publication.payload).ok()?;

        if self.topic_for(&address, &message.topic) != publication.topic {
            return None;
        }

        Some((address, message))
    }
}

/// Bridge presence record published on connect and as the last will.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceMessage {
    pub bridge_id: String,
    pub status: PresenceStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceMessage {
    pub fn new(bridge_id: impl Into<String>, status: PresenceStatus) -> Self {
        Self {
            bridge_id: bridge_id.into(),
            status,
            timestamp: Utc::now(),
        }
    }
}
