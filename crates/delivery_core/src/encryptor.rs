use std::{collections::HashMap, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ratchet::{
    CiphertextKind, ProtocolStore, SealedSenderRecipient, SenderCertificate, SessionRecord,
    UnidentifiedSenderContent,
};
use shared::{
    domain::{
        ContentHint, ContentKind, DeviceId, DistributionId, RecipientDevice, RegistrationId,
    },
    protocol::{EnvelopeType, OutgoingDeviceMessage},
};
use storage::Storage;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::{error::SendError, LocalAccount};

/// One async mutex per device so ratchet read-modify-write never interleaves.
#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<RecipientDevice, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub async fn lock(&self, device: &RecipientDevice) -> OwnedMutexGuard<()> {
        let lock = {
            let mut guard = self.locks.lock().await;
            guard.entry(device.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptRequest {
    pub kind: ContentKind,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSenderParams {
    pub certificate: SenderCertificate,
    pub content_hint: ContentHint,
    pub group_id: Option<Vec<u8>>,
}

/// Ready-to-submit ciphertext for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMessage {
    pub envelope_type: EnvelopeType,
    pub destination_device_id: DeviceId,
    /// Read from the session at encrypt time.
    pub destination_registration_id: Option<RegistrationId>,
    pub content: Vec<u8>,
}

impl DeviceMessage {
    pub fn to_outgoing(&self) -> OutgoingDeviceMessage {
        OutgoingDeviceMessage {
            message_type: self.envelope_type.as_u8(),
            destination_device_id: self.destination_device_id.0,
            destination_registration_id: self.destination_registration_id.map(|id| id.0),
            content: STANDARD.encode(&self.content),
        }
    }
}

pub struct DeviceMessageEncryptor {
    storage: Storage,
    locks: Arc<SessionLocks>,
    local: LocalAccount,
    max_group_ciphertext_bytes: usize,
}

impl DeviceMessageEncryptor {
    pub fn new(
        storage: Storage,
        locks: Arc<SessionLocks>,
        local: LocalAccount,
        max_group_ciphertext_bytes: usize,
    ) -> Self {
        Self {
            storage,
            locks,
            local,
            max_group_ciphertext_bytes,
        }
    }

    async fn valid_session(&self, device: &RecipientDevice) -> Result<Option<SessionRecord>, SendError> {
        Ok(self
            .storage
            .load_session(device)
            .await?
            .filter(SessionRecord::is_valid))
    }

    /// Encrypts for one device. Without a valid session this fails immediately, except
    /// for plaintext-wrapper content which never touches the ratchet and is never sealed.
    pub async fn encrypt(
        &self,
        request: &EncryptRequest,
        device: &RecipientDevice,
        sealed: Option<&SealedSenderParams>,
    ) -> Result<DeviceMessage, SendError> {
        let _guard = self.locks.lock(device).await;
        let session = self.valid_session(device).await?;

        if request.kind.is_plaintext_wrapper() {
            let wrapped = ratchet::wrap_plaintext_content(&request.content);
            debug!(%device, "wrapping plaintext content");
            return Ok(DeviceMessage {
                envelope_type: EnvelopeType::PlaintextContent,
                destination_device_id: device.device_id,
                destination_registration_id: session
                    .as_ref()
                    .map(SessionRecord::remote_registration_id),
                content: wrapped.serialized,
            });
        }

        let session = session.ok_or_else(|| SendError::NoSession(device.clone()))?;
        let registration_id = session.remote_registration_id();
        let ciphertext = ratchet::encrypt(&self.storage, device, &request.content).await?;

        let message = match sealed {
            Some(params) => {
                let content = UnidentifiedSenderContent {
                    message_type: ciphertext.kind.as_u8(),
                    sender_certificate: params.certificate.clone(),
                    contents: ciphertext.serialized,
                    content_hint: params.content_hint,
                    group_id: params.group_id.clone(),
                };
                DeviceMessage {
                    envelope_type: EnvelopeType::UnidentifiedSender,
                    destination_device_id: device.device_id,
                    destination_registration_id: Some(registration_id),
                    content: ratchet::sealed_sender_encrypt(session.remote_identity(), &content)?,
                }
            }
            None => DeviceMessage {
                envelope_type: match ciphertext.kind {
                    CiphertextKind::PreKey => EnvelopeType::PrekeyBundle,
                    CiphertextKind::Plaintext => EnvelopeType::PlaintextContent,
                    CiphertextKind::Whisper | CiphertextKind::SenderKey => EnvelopeType::Ciphertext,
                },
                destination_device_id: device.device_id,
                destination_registration_id: Some(registration_id),
                content: ciphertext.serialized,
            },
        };
        debug!(%device, envelope = ?message.envelope_type, "encrypted device message");
        Ok(message)
    }

    /// Builds the sealed multi-recipient payload for a sender-key send.
    ///
    /// Every device must already hold a session. The size ceiling is enforced here so an
    /// oversized message never reaches the relay.
    pub async fn encrypt_for_group(
        &self,
        distribution_id: DistributionId,
        devices: &[RecipientDevice],
        content: &[u8],
        sealed: &SealedSenderParams,
    ) -> Result<Vec<u8>, SendError> {
        let local = self.local.address();
        let group_ciphertext = {
            let _guard = self.locks.lock(&local).await;
            ratchet::group_encrypt(&self.storage, &local, distribution_id, content).await?
        };

        let mut recipients = Vec::with_capacity(devices.len());
        for device in devices {
            let _guard = self.locks.lock(device).await;
            let session = self
                .valid_session(device)
                .await?
                .ok_or_else(|| SendError::NoSession(device.clone()))?;
            recipients.push(SealedSenderRecipient {
                device: device.clone(),
                registration_id: session.remote_registration_id(),
                identity: *session.remote_identity(),
            });
        }

        let payload = ratchet::sealed_sender_multi_recipient_encrypt(
            &recipients,
            &UnidentifiedSenderContent {
                message_type: CiphertextKind::SenderKey.as_u8(),
                sender_certificate: sealed.certificate.clone(),
                contents: group_ciphertext,
                content_hint: sealed.content_hint,
                group_id: sealed.group_id.clone(),
            },
        )?;
        if payload.len() > self.max_group_ciphertext_bytes {
            return Err(SendError::OversizedCiphertext {
                size: payload.len(),
                limit: self.max_group_ciphertext_bytes,
            });
        }
        Ok(payload)
    }
}

#[cfg(test)]
#[path = "tests/encryptor_tests.rs"]
mod tests;
