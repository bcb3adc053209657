use shared::domain::{RecipientDevice, ServiceId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("identity key for {service_id} is not trusted")]
    UntrustedIdentity {
        service_id: ServiceId,
        identity: crate::keys::IdentityKey,
    },
    #[error("prekey signature did not verify for {0}")]
    InvalidSignature(RecipientDevice),
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("no session for {0}")]
    NoSession(RecipientDevice),
    #[error("no sender key for distribution {0}")]
    NoSenderKey(uuid::Uuid),
    #[error("registration id {0} cannot be addressed in a multi-recipient message")]
    InvalidRegistrationId(u32),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("encryption failed")]
    Encryption,
    #[error("decryption failed")]
    Decryption,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
