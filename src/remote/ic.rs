//! `RemoteService` implementation backed by `ic-agent`

use super::{RemoteError, RemoteService};
use crate::config::RemoteSection;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{Address, PagedResult, Settings};
use async_trait::async_trait;
use candid::{CandidType, Decode, Deserialize, Encode, Principal};
use ic_agent::{Agent, Identity};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Settings record as encoded by the canister
#[derive(Debug, Clone, CandidType, Deserialize)]
struct SettingsRecord {
    owner: Principal,
    interval: u64,
}

impl From<SettingsRecord> for Settings {
    fn from(record: SettingsRecord) -> Self {
        Settings {
            interval: record.interval,
            owner: Address::from(record.owner),
        }
    }
}

/// Canister client signing calls with a loaded identity
pub struct IcServiceClient {
    agent: Agent,
    timeout: Option<Duration>,
}

impl IcServiceClient {
    /// Build the agent and run the trust bootstrap when the endpoint requires it.
    ///
    /// Must complete before any call is issued; failures here are fatal.
    pub async fn connect<I>(remote: &RemoteSection, identity: I) -> BridgeResult<Self>
    where
        I: Identity + 'static,
    {
        let agent = Agent::builder()
            .with_url(remote.url.clone())
            .with_identity(identity)
            .build()
            .map_err(|e| BridgeError::RemoteError(RemoteError::Transport(e.to_string())))?;

        if remote.needs_trust_bootstrap() {
            info!(url = %remote.url, "Fetching root key for non-production endpoint");
            agent
                .fetch_root_key()
                .await
                .map_err(|e| BridgeError::bootstrap(e.to_string()))?;
        }

        Ok(Self {
            agent,
            timeout: remote.request_timeout(),
        })
    }

    async fn with_deadline<F>(&self, call: F) -> Result<Vec<u8>, RemoteError>
    where
        F: Future<Output = Result<Vec<u8>, ic_agent::AgentError>>,
    {
        let reply = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| RemoteError::Timeout(limit.as_secs()))?,
            None => call.await,
        };
        reply.map_err(|e| RemoteError::Transport(e.to_string()))
    }

    async fn query(
        &self,
        address: &Address,
        method: &str,
        arg: Vec<u8>,
    ) -> Result<Vec<u8>, RemoteError> {
        debug!(canister = %address, method, "Canister query");
        let call = self
            .agent
            .query(address.principal(), method)
            .with_arg(arg)
            .call();
        self.with_deadline(call).await
    }

    async fn update(
        &self,
        address: &Address,
        method: &str,
        arg: Vec<u8>,
    ) -> Result<Vec<u8>, RemoteError> {
        debug!(canister = %address, method, "Canister update");
        let call = self
            .agent
            .update(address.principal(), method)
            .with_arg(arg)
            .call_and_wait();
        self.with_deadline(call).await
    }
}

fn codec_error(e: candid::Error) -> RemoteError {
    RemoteError::Codec(e.to_string())
}

#[async_trait]
impl RemoteService for IcServiceClient {
    async fn get_settings(&self, address: &Address) -> Result<Settings, RemoteError> {
        let arg = Encode!().map_err(codec_error)?;
        let reply = self.query(address, "getSettings", arg).await?;

        match Decode!(&reply, Result<SettingsRecord, String>).map_err(codec_error)? {
            Ok(record) => Ok(record.into()),
            Err(message) => Err(RemoteError::Rejected(message)),
        }
    }

    async fn get_messages(
        &self,
        address: &Address,
        from_index: u64,
    ) -> Result<PagedResult, RemoteError> {
        let arg = Encode!(&from_index).map_err(codec_error)?;
        let reply = self.query(address, "getMessages", arg).await?;

        match Decode!(&reply, Result<PagedResult, String>).map_err(codec_error)? {
            Ok(page) => Ok(page),
            Err(message) => Err(RemoteError::Rejected(message)),
        }
    }

    async fn on_message(
        &self,
        address: &Address,
        topic: &str,
        payload: &str,
    ) -> Result<(), RemoteError> {
        let arg = Encode!(&topic, &payload).map_err(codec_error)?;
        let reply = self.update(address, "onMessage", arg).await?;

        match Decode!(&reply, Result<(), String>).map_err(codec_error)? {
            Ok(()) => Ok(()),
            Err(message) => Err(RemoteError::Rejected(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_reply_decodes() {
        let owner = Principal::from_text("2vxsx-fae").unwrap();
        let reply: Result<SettingsRecord, String> = Ok(SettingsRecord { owner, interval: 5 });
        let bytes = Encode!(&reply).unwrap();

        let decoded = Decode!(&bytes, Result<SettingsRecord, String>).unwrap();
        let settings: Settings = decoded.unwrap().into();
        assert_eq!(settings.interval, 5);
        assert_eq!(settings.owner.to_string(), "2vxsx-fae");
    }

    #[test]
    fn test_error_variant_decodes() {
        let reply: Result<PagedResult, String> = Err("not authorized".to_string());
        let bytes = Encode!(&reply).unwrap();

        let decoded = Decode!(&bytes, Result<PagedResult, String>).unwrap();
        assert_eq!(decoded, Err("not authorized".to_string()));
    }
}
