use serde::{Deserialize, Serialize};

use crate::domain::ServiceId;

/// Envelope type discriminants understood by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Ciphertext,
    PrekeyBundle,
    UnidentifiedSender,
    PlaintextContent,
}

impl EnvelopeType {
    pub fn as_u8(self) -> u8 {
        match self {
            EnvelopeType::Ciphertext => 1,
            EnvelopeType::PrekeyBundle => 3,
            EnvelopeType::UnidentifiedSender => 6,
            EnvelopeType::PlaintextContent => 8,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(EnvelopeType::Ciphertext),
            3 => Some(EnvelopeType::PrekeyBundle),
            6 => Some(EnvelopeType::UnidentifiedSender),
            8 => Some(EnvelopeType::PlaintextContent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingDeviceMessage {
    #[serde(rename = "type")]
    pub message_type: u8,
    pub destination_device_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_registration_id: Option<u32>,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessageList {
    pub messages: Vec<OutgoingDeviceMessage>,
    pub timestamp: u64,
    pub online: bool,
    pub urgent: bool,
}

/// 409 body for a single-recipient send.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MismatchedDevices {
    #[serde(default)]
    pub missing_devices: Vec<u32>,
    #[serde(default)]
    pub extra_devices: Vec<u32>,
}

/// 410 body for a single-recipient send.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StaleDevices {
    #[serde(default)]
    pub stale_devices: Vec<u32>,
}

/// One element of the 409 list returned by a multi-recipient send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountMismatchedDevices {
    pub uuid: ServiceId,
    pub devices: MismatchedDevices,
}

/// One element of the 410 list returned by a multi-recipient send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountStaleDevices {
    pub uuid: ServiceId,
    pub devices: StaleDevices,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MultiRecipientSendResponse {
    #[serde(default)]
    pub uuids404: Vec<ServiceId>,
}

/// 428 body: the relay wants proof the sender is not a spammer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChallengeBody {
    pub token: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyEntity {
    pub key_id: u32,
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyEntity {
    pub key_id: u32,
    pub public_key: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyDeviceResponse {
    pub device_id: u32,
    pub registration_id: u32,
    pub signed_pre_key: SignedPreKeyEntity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_key: Option<PreKeyEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pq_pre_key: Option<SignedPreKeyEntity>,
}

/// Body of `GET /v2/keys/{service_id}/{device_id}`. Keys are standard base64.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyResponse {
    pub identity_key: String,
    pub devices: Vec<PreKeyDeviceResponse>,
}
