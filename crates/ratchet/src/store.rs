use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::domain::{DistributionId, RecipientDevice, RegistrationId, ServiceId};

use crate::{
    keys::{IdentityKey, IdentityKeyPair},
    sender_keys::SenderKeyRecord,
    session::SessionRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Trusted,
    /// Key changed and the user has not approved it yet.
    Pending,
}

impl TrustLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            TrustLevel::Trusted => "trusted",
            TrustLevel::Pending => "pending",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "trusted" => Some(TrustLevel::Trusted),
            "pending" => Some(TrustLevel::Pending),
            _ => None,
        }
    }
}

/// Persistence the protocol needs. Callers serialize access per device.
#[async_trait]
pub trait ProtocolStore: Send + Sync {
    async fn local_identity(&self) -> Result<IdentityKeyPair>;
    async fn local_registration_id(&self) -> Result<RegistrationId>;

    /// Archived sessions are not returned.
    async fn load_session(&self, address: &RecipientDevice) -> Result<Option<SessionRecord>>;
    async fn store_session(&self, address: &RecipientDevice, record: &SessionRecord) -> Result<()>;
    async fn archive_session(&self, address: &RecipientDevice) -> Result<()>;

    async fn load_identity(&self, service_id: &ServiceId)
        -> Result<Option<(IdentityKey, TrustLevel)>>;
    async fn save_identity(
        &self,
        service_id: &ServiceId,
        identity: &IdentityKey,
        trust: TrustLevel,
    ) -> Result<()>;

    async fn load_sender_key(
        &self,
        sender: &RecipientDevice,
        distribution_id: DistributionId,
    ) -> Result<Option<SenderKeyRecord>>;
    async fn store_sender_key(
        &self,
        sender: &RecipientDevice,
        distribution_id: DistributionId,
        record: &SenderKeyRecord,
    ) -> Result<()>;
}
