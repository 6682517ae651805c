//! Canister addresses and inbound topic resolution
//!
//! Inbound topics follow the convention `/<address>/<path...>`: the first
//! segment after the root names the canister that receives the message.
//! Anything after it is opaque to the bridge.

use super::topics::canonicalize_topic;
use candid::Principal;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier of a remote canister, in canonical principal text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(Principal);

impl Address {
    pub fn principal(&self) -> &Principal {
        &self.0
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if text.is_empty() {
            return Err(AddressError::MissingAddress);
        }

        Principal::from_text(text)
            .map(Address)
            .map_err(|e| AddressError::InvalidAddress {
                segment: text.to_string(),
                reason: e.to_string(),
            })
    }
}

impl From<Principal> for Address {
    fn from(principal: Principal) -> Self {
        Address(principal)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_text())
    }
}

/// Address resolution failures. The message carrying the topic is dropped.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AddressError {
    #[error("Topic has no address segment")]
    MissingAddress,
    #[error("Invalid address '{segment}': {reason}")]
    InvalidAddress { segment: String, reason: String },
}

/// A topic that was successfully routed to a canister.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTopic {
    /// Target canister
    pub address: Address,
    /// Canonical remainder after the address segment, `""` when absent
    pub path: String,
    /// The topic exactly as received from the broker
    pub topic: String,
    /// Raw payload bytes as received
    pub payload: Vec<u8>,
}

/// Resolve an inbound topic into its target address and sub-path.
pub fn resolve_topic(topic: &str, payload: &[u8]) -> Result<ResolvedTopic, AddressError> {
    let canonical = canonicalize_topic(topic);
    let mut segments = canonical.trim_start_matches('/').splitn(2, '/');

    let address = match segments.next() {
        Some(segment) if !segment.is_empty() => segment.parse::<Address>()?,
        _ => return Err(AddressError::MissingAddress),
    };

    let path = segments
        .next()
        .map(|rest| format!("/{rest}"))
        .unwrap_or_default();

    Ok(ResolvedTopic {
        address,
        path,
        topic: topic.to_string(),
        payload: payload.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LOCAL_CANISTER: &str = "bkyz2-fmaaa-aaaaa-qaaaq-cai";
    const LEDGER: &str = "ryjl3-tyaaa-aaaaa-aaaba-cai";
    const VALID: [&str; 4] = [LOCAL_CANISTER, LEDGER, "aaaaa-aa", "2vxsx-fae"];

    #[test]
    fn test_resolves_address_and_path() {
        let resolved = resolve_topic("/bkyz2-fmaaa-aaaaa-qaaaq-cai/sensor1", br#"{"t":1}"#).unwrap();

        assert_eq!(resolved.address.to_string(), LOCAL_CANISTER);
        assert_eq!(resolved.path, "/sensor1");
        assert_eq!(resolved.topic, "/bkyz2-fmaaa-aaaaa-qaaaq-cai/sensor1");
        assert_eq!(resolved.payload, br#"{"t":1}"#.to_vec());
    }

    #[test]
    fn test_resolves_address_without_path() {
        let resolved = resolve_topic("/ryjl3-tyaaa-aaaaa-aaaba-cai", b"").unwrap();
        assert_eq!(resolved.address.to_string(), LEDGER);
        assert_eq!(resolved.path, "");
    }

    #[test]
    fn test_resolves_deep_path_and_keeps_raw_topic() {
        let raw = "//aaaaa-aa//floor/2//temp/";
        let resolved = resolve_topic(raw, b"21.5").unwrap();
        assert_eq!(resolved.address.to_string(), "aaaaa-aa");
        assert_eq!(resolved.path, "/floor/2/temp");
        assert_eq!(resolved.topic, raw);
    }

    #[test]
    fn test_rejects_missing_address() {
        assert_eq!(resolve_topic("", b""), Err(AddressError::MissingAddress));
        assert_eq!(resolve_topic("/", b""), Err(AddressError::MissingAddress));
        assert_eq!(resolve_topic("///", b""), Err(AddressError::MissingAddress));
    }

    #[test]
    fn test_rejects_malformed_addresses() {
        for topic in [
            "/presence",
            "/response",
            "/addr1/sensor1",
            "/bkyz2-fmaaa-aaaaa-qaaaq-caa/sensor",
            "/bkyz2fmaaaaaaaaqaaaqcai/sensor",
        ] {
            let result = resolve_topic(topic, b"{}");
            assert!(
                matches!(result, Err(AddressError::InvalidAddress { .. })),
                "expected InvalidAddress for {topic}, got {result:?}"
            );
        }
    }

    #[test]
    fn test_address_round_trips_through_text() {
        for text in VALID {
            let address: Address = text.parse().unwrap();
            assert_eq!(address.to_string(), text);
        }
    }

    proptest! {
        #[test]
        fn valid_address_is_always_resolved(
            index in 0usize..4,
            rest in "(/[a-zA-Z0-9_.-]{1,12}){0,4}",
        ) {
            let topic = format!("/{}{}", VALID[index], rest);
            let resolved = resolve_topic(&topic, b"x").unwrap();
            prop_assert_eq!(resolved.address.to_string(), VALID[index]);
            prop_assert_eq!(resolved.path, rest);
        }

        #[test]
        fn lowercase_words_without_dashes_are_rejected(word in "[g-z]{6,20}") {
            let topic = format!("/{word}/x");
            prop_assert!(resolve_topic(&topic, b"").is_err());
        }
    }
}
