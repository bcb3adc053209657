//! Collaborators the delivery core talks to but does not own.

use std::{collections::HashMap, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use shared::{
    domain::{AccessKey, RecipientDevice, SealedSenderAccess, ServiceId, ThreadId},
    protocol::ChallengeBody,
};

use crate::encryptor::DeviceMessage;

/// Current membership of a conversation as the thread store sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub thread_id: ThreadId,
    pub members: Vec<ServiceId>,
    /// Present for groups; carried inside sealed group envelopes.
    pub group_id: Option<Vec<u8>>,
    pub sender_key_capable: bool,
}

impl ThreadSnapshot {
    pub fn is_member(&self, service_id: &ServiceId) -> bool {
        self.members.contains(service_id)
    }
}

#[async_trait]
pub trait ThreadResolver: Send + Sync {
    async fn thread(&self, thread_id: &ThreadId) -> Result<Option<ThreadSnapshot>>;
    async fn is_blocked(&self, service_id: &ServiceId) -> Result<bool>;
    async fn sealed_sender_access(&self, service_id: &ServiceId) -> Result<SealedSenderAccess>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub retry_after: Option<Duration>,
}

impl RelayResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::with_status(200, body)
    }

    pub fn with_status(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|err| anyhow!("invalid relay body for status {}: {err}", self.status))
    }
}

/// One recipient's messages, one per device, submitted together.
#[derive(Debug, Clone)]
pub struct DeviceMessageSubmission {
    pub destination: ServiceId,
    pub messages: Vec<DeviceMessage>,
    pub timestamp: u64,
    pub online: bool,
    pub urgent: bool,
    /// Present when the messages are sealed.
    pub access_key: Option<AccessKey>,
}

#[derive(Debug, Clone)]
pub struct MultiRecipientSubmission {
    pub payload: Vec<u8>,
    pub timestamp: u64,
    pub online: bool,
    pub urgent: bool,
    pub access_key: AccessKey,
}

/// Transport failures come back as `Err`; every relay answer, good or bad, as `Ok`.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn submit_device_messages(
        &self,
        submission: &DeviceMessageSubmission,
    ) -> Result<RelayResponse>;
    async fn submit_multi_recipient_message(
        &self,
        submission: &MultiRecipientSubmission,
    ) -> Result<RelayResponse>;
    async fn fetch_prekey_bundle(
        &self,
        device: &RecipientDevice,
        access_key: Option<&AccessKey>,
    ) -> Result<RelayResponse>;
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// Numbers the directory does not know are simply absent from the result.
    async fn look_up(&self, phone_numbers: &[String]) -> Result<HashMap<String, ServiceId>>;
}

#[async_trait]
pub trait ChallengeResolver: Send + Sync {
    /// Returns true when the challenge was satisfied without user interaction.
    async fn try_to_handle_silently(
        &self,
        challenge: &ChallengeBody,
        retry_after: Option<Duration>,
    ) -> Result<bool>;
}

pub struct MissingDirectory;

#[async_trait]
impl Directory for MissingDirectory {
    async fn look_up(&self, _phone_numbers: &[String]) -> Result<HashMap<String, ServiceId>> {
        Err(anyhow!("directory lookup is unavailable"))
    }
}

pub struct MissingChallengeResolver;

#[async_trait]
impl ChallengeResolver for MissingChallengeResolver {
    async fn try_to_handle_silently(
        &self,
        _challenge: &ChallengeBody,
        _retry_after: Option<Duration>,
    ) -> Result<bool> {
        Ok(false)
    }
}
