use std::time::Duration;

use ratchet::ProtocolError;
use shared::domain::{DeviceId, RecipientDevice, ServiceId};
use thiserror::Error;

/// Everything a send can fail with, per device, per recipient or for the whole message.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("sealed sender access rejected for {service_id}")]
    SealedSenderAuth { service_id: ServiceId },
    #[error("relay challenge pending")]
    ChallengePending { retry_after: Option<Duration> },
    #[error("device list mismatch for {service_id}: missing {missing:?}, extra {extra:?}")]
    MismatchedDevices {
        service_id: ServiceId,
        missing: Vec<DeviceId>,
        extra: Vec<DeviceId>,
    },
    #[error("stale sessions for {service_id}: {stale:?}")]
    StaleDevices {
        service_id: ServiceId,
        stale: Vec<DeviceId>,
    },
    #[error("{0} is not registered")]
    Unregistered(ServiceId),
    #[error("device {0} does not exist")]
    MissingDevice(RecipientDevice),
    #[error("identity of {0} changed and is not trusted")]
    UntrustedIdentity(ServiceId),
    #[error("invalid prekey signature from {service_id}")]
    InvalidSignature { service_id: ServiceId, terminal: bool },
    #[error("{0} is blocked")]
    Blocked(ServiceId),
    #[error("prekey fetch rate limited")]
    PrekeyRateLimited { retry_after: Option<Duration> },
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("group ciphertext of {size} bytes exceeds {limit}")]
    OversizedCiphertext { size: usize, limit: usize },
    #[error("group send access rejected")]
    GroupAuthInvalid,
    #[error("group send named an unknown account")]
    GroupUnknownAccount,
    #[error("no valid recipients")]
    NoValidRecipients,
    #[error("no session for {0}")]
    NoSession(RecipientDevice),
    #[error("application version expired")]
    AppExpired,
    #[error("local device is no longer registered")]
    Deregistered,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("local state unavailable: {0:#}")]
    Local(#[from] anyhow::Error),
}

impl From<ProtocolError> for SendError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UntrustedIdentity { service_id, .. } => {
                SendError::UntrustedIdentity(service_id)
            }
            ProtocolError::InvalidSignature(device) => SendError::InvalidSignature {
                service_id: device.service_id,
                terminal: false,
            },
            ProtocolError::NoSession(device) => SendError::NoSession(device),
            ProtocolError::Store(err) => SendError::Local(err),
            other => SendError::Internal(other.to_string()),
        }
    }
}
