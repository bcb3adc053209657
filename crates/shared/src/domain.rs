use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

macro_rules! string_id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(MessageId);

string_id_newtype!(ServiceId);
string_id_newtype!(ThreadId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub const PRIMARY: DeviceId = DeviceId(1);

    pub fn is_valid(self) -> bool {
        self.0 >= 1
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Largest registration id the multi-recipient format can carry (14 bits).
pub const MAX_MULTI_RECIPIENT_REGISTRATION_ID: u32 = 0x3FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistrationId(pub u32);

impl RegistrationId {
    pub fn is_valid_for_multi_recipient(self) -> bool {
        (1..=MAX_MULTI_RECIPIENT_REGISTRATION_ID).contains(&self.0)
    }
}

/// One device of one recipient account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecipientDevice {
    pub service_id: ServiceId,
    pub device_id: DeviceId,
}

impl RecipientDevice {
    pub fn new(service_id: ServiceId, device_id: DeviceId) -> Self {
        Self {
            service_id,
            device_id,
        }
    }
}

impl fmt::Display for RecipientDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service_id, self.device_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DistributionId(pub Uuid);

impl DistributionId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for DistributionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a message names one of its recipients before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RecipientRef {
    Service(ServiceId),
    PhoneNumber(String),
}

impl RecipientRef {
    /// Stable key used for the per-recipient delivery rows.
    pub fn key(&self) -> String {
        match self {
            RecipientRef::Service(service_id) => service_id.0.clone(),
            RecipientRef::PhoneNumber(e164) => format!("e164:{e164}"),
        }
    }
}

impl From<ServiceId> for RecipientRef {
    fn from(value: ServiceId) -> Self {
        RecipientRef::Service(value)
    }
}

impl fmt::Display for RecipientRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Skipped,
    FailedTerminal,
    FailedRetryable,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Skipped => "skipped",
            DeliveryStatus::FailedTerminal => "failed_terminal",
            DeliveryStatus::FailedRetryable => "failed_retryable",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(DeliveryStatus::Pending),
            "sent" => Some(DeliveryStatus::Sent),
            "skipped" => Some(DeliveryStatus::Skipped),
            "failed_terminal" => Some(DeliveryStatus::FailedTerminal),
            "failed_retryable" => Some(DeliveryStatus::FailedRetryable),
            _ => None,
        }
    }

    /// A settled recipient is never sent to again for the same message.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Sent | DeliveryStatus::Skipped | DeliveryStatus::FailedTerminal
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMode {
    Pairwise,
    SenderKey,
    PlaintextWrapper,
}

impl EncryptionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            EncryptionMode::Pairwise => "pairwise",
            EncryptionMode::SenderKey => "sender_key",
            EncryptionMode::PlaintextWrapper => "plaintext_wrapper",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pairwise" => Some(EncryptionMode::Pairwise),
            "sender_key" => Some(EncryptionMode::SenderKey),
            "plaintext_wrapper" => Some(EncryptionMode::PlaintextWrapper),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentHint {
    Default,
    Resendable,
    Implicit,
}

/// What kind of content an outgoing message carries. Drives recipient policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Reaction,
    ReadReceipt,
    DeliveryReceipt,
    Typing,
    SyncTranscript,
    CallControl,
    ResendRequest,
    SenderKeyDistribution,
}

impl ContentKind {
    /// Whether an empty recipient set is an error for this kind.
    pub fn requires_recipients(self) -> bool {
        matches!(self, ContentKind::Text | ContentKind::Reaction)
    }

    pub fn targets_self(self) -> bool {
        matches!(self, ContentKind::SyncTranscript | ContentKind::CallControl)
    }

    /// Resend requests bypass the ratchet and are wrapped as plaintext content.
    pub fn is_plaintext_wrapper(self) -> bool {
        matches!(self, ContentKind::ResendRequest)
    }

    pub fn is_urgent(self) -> bool {
        !matches!(
            self,
            ContentKind::ReadReceipt | ContentKind::DeliveryReceipt | ContentKind::Typing
        )
    }

    pub fn is_online_only(self) -> bool {
        matches!(self, ContentKind::Typing)
    }

    pub fn content_hint(self) -> ContentHint {
        match self {
            ContentKind::Text | ContentKind::Reaction | ContentKind::SyncTranscript => {
                ContentHint::Resendable
            }
            ContentKind::ReadReceipt
            | ContentKind::DeliveryReceipt
            | ContentKind::Typing
            | ContentKind::SenderKeyDistribution => ContentHint::Implicit,
            ContentKind::CallControl | ContentKind::ResendRequest => ContentHint::Default,
        }
    }
}

pub const ACCESS_KEY_LEN: usize = 16;

/// Unidentified-delivery access key derived from a recipient's profile key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessKey(pub [u8; ACCESS_KEY_LEN]);

impl AccessKey {
    pub const UNRESTRICTED: AccessKey = AccessKey([0u8; ACCESS_KEY_LEN]);

    /// XOR of all recipients' keys, as the relay expects for multi-recipient sends.
    pub fn composite<'a>(keys: impl IntoIterator<Item = &'a AccessKey>) -> AccessKey {
        let mut out = [0u8; ACCESS_KEY_LEN];
        for key in keys {
            for (dst, src) in out.iter_mut().zip(key.0.iter()) {
                *dst ^= src;
            }
        }
        AccessKey(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SealedSenderAccess {
    Disabled,
    Enabled(AccessKey),
    Unrestricted,
}

impl SealedSenderAccess {
    pub fn access_key(self) -> Option<AccessKey> {
        match self {
            SealedSenderAccess::Disabled => None,
            SealedSenderAccess::Enabled(key) => Some(key),
            SealedSenderAccess::Unrestricted => Some(AccessKey::UNRESTRICTED),
        }
    }
}
