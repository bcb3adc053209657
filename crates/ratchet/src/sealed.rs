use std::collections::BTreeMap;

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use shared::domain::{ContentHint, DeviceId, RecipientDevice, RegistrationId, ServiceId};
use zeroize::Zeroize;

use crate::{
    error::{ProtocolError, Result},
    keys::{hkdf_expand, AgreementKeyPair, IdentityKey, IdentityKeyPair, KEY_LEN},
    session_cipher::{open, seal},
};

const SEALED_VERSION: u8 = 1;
const SEALED_INFO: &[u8] = b"delivery-sealed-sender";
const MULTI_RECIPIENT_INFO: &[u8] = b"delivery-sealed-sender-multi";

/// Server-issued proof of the sender's identity, carried inside sealed envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderCertificate {
    pub sender: ServiceId,
    pub sender_device: DeviceId,
    pub sender_identity: IdentityKey,
    pub expires_at_ms: i64,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnidentifiedSenderContent {
    pub message_type: u8,
    pub sender_certificate: SenderCertificate,
    pub contents: Vec<u8>,
    pub content_hint: ContentHint,
    pub group_id: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedEnvelope {
    version: u8,
    ephemeral_public: [u8; KEY_LEN],
    ciphertext: Vec<u8>,
}

fn envelope_keys(
    shared_secret: &[u8; KEY_LEN],
    ephemeral_public: &[u8; KEY_LEN],
    info: &[u8],
) -> Result<([u8; KEY_LEN], [u8; 12])> {
    let key = hkdf_expand(Some(ephemeral_public.as_slice()), shared_secret, info)?;
    let nonce = hkdf_expand(Some(ephemeral_public.as_slice()), shared_secret, b"nonce")?;
    Ok((key, nonce))
}

/// Hides the sender from the relay. Only the holder of `destination`'s identity can open it.
pub fn sealed_sender_encrypt(
    destination: &IdentityKey,
    content: &UnidentifiedSenderContent,
) -> Result<Vec<u8>> {
    let ephemeral = AgreementKeyPair::generate();
    let ephemeral_public = ephemeral.public_key();
    let mut shared_secret = ephemeral.agree(&destination.agreement);
    let (mut key, nonce) = envelope_keys(&shared_secret, &ephemeral_public, SEALED_INFO)?;
    let ciphertext = seal(&key, &nonce, &serde_json::to_vec(content)?)?;
    shared_secret.zeroize();
    key.zeroize();

    Ok(serde_json::to_vec(&SealedEnvelope {
        version: SEALED_VERSION,
        ephemeral_public,
        ciphertext,
    })?)
}

pub fn sealed_sender_decrypt(
    identity: &IdentityKeyPair,
    serialized: &[u8],
) -> Result<UnidentifiedSenderContent> {
    let envelope: SealedEnvelope = serde_json::from_slice(serialized)?;
    if envelope.version != SEALED_VERSION {
        return Err(ProtocolError::InvalidMessage(format!(
            "unsupported sealed sender version {}",
            envelope.version
        )));
    }
    let shared_secret = identity.agree(&envelope.ephemeral_public);
    let (key, nonce) = envelope_keys(&shared_secret, &envelope.ephemeral_public, SEALED_INFO)?;
    let plaintext = open(&key, &nonce, &envelope.ciphertext)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

/// One destination device of a multi-recipient message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSenderRecipient {
    pub device: RecipientDevice,
    pub registration_id: RegistrationId,
    pub identity: IdentityKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiRecipientDevice {
    pub device_id: DeviceId,
    pub registration_id: RegistrationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiRecipientEntry {
    pub service_id: ServiceId,
    pub devices: Vec<MultiRecipientDevice>,
    pub ephemeral_public: [u8; KEY_LEN],
    pub wrapped_key: Vec<u8>,
}

/// One shared body plus a wrapped content key per recipient account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiRecipientMessage {
    pub version: u8,
    pub recipients: Vec<MultiRecipientEntry>,
    pub body_nonce: [u8; 12],
    pub body: Vec<u8>,
}

impl MultiRecipientMessage {
    pub fn parse(serialized: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(serialized)?)
    }

    pub fn recipient_devices(&self) -> impl Iterator<Item = RecipientDevice> + '_ {
        self.recipients.iter().flat_map(|entry| {
            entry
                .devices
                .iter()
                .map(|device| RecipientDevice::new(entry.service_id.clone(), device.device_id))
        })
    }
}

pub fn sealed_sender_multi_recipient_encrypt(
    recipients: &[SealedSenderRecipient],
    content: &UnidentifiedSenderContent,
) -> Result<Vec<u8>> {
    let mut content_key = [0u8; KEY_LEN];
    let mut body_nonce = [0u8; 12];
    OsRng.fill_bytes(&mut content_key);
    OsRng.fill_bytes(&mut body_nonce);
    let body = seal(&content_key, &body_nonce, &serde_json::to_vec(content)?)?;

    let mut by_account: BTreeMap<&ServiceId, (IdentityKey, Vec<MultiRecipientDevice>)> =
        BTreeMap::new();
    for recipient in recipients {
        if !recipient.registration_id.is_valid_for_multi_recipient() {
            return Err(ProtocolError::InvalidRegistrationId(
                recipient.registration_id.0,
            ));
        }
        by_account
            .entry(&recipient.device.service_id)
            .or_insert_with(|| (recipient.identity, Vec::new()))
            .1
            .push(MultiRecipientDevice {
                device_id: recipient.device.device_id,
                registration_id: recipient.registration_id,
            });
    }

    let mut entries = Vec::with_capacity(by_account.len());
    for (service_id, (identity, devices)) in by_account {
        let ephemeral = AgreementKeyPair::generate();
        let ephemeral_public = ephemeral.public_key();
        let mut shared_secret = ephemeral.agree(&identity.agreement);
        let (mut key, nonce) =
            envelope_keys(&shared_secret, &ephemeral_public, MULTI_RECIPIENT_INFO)?;
        let wrapped_key = seal(&key, &nonce, &content_key)?;
        shared_secret.zeroize();
        key.zeroize();
        entries.push(MultiRecipientEntry {
            service_id: service_id.clone(),
            devices,
            ephemeral_public,
            wrapped_key,
        });
    }
    content_key.zeroize();

    Ok(serde_json::to_vec(&MultiRecipientMessage {
        version: SEALED_VERSION,
        recipients: entries,
        body_nonce,
        body,
    })?)
}

/// Opens the copy addressed to `service_id`, as the relay would deliver it.
pub fn sealed_sender_multi_recipient_decrypt(
    identity: &IdentityKeyPair,
    service_id: &ServiceId,
    serialized: &[u8],
) -> Result<UnidentifiedSenderContent> {
    let message = MultiRecipientMessage::parse(serialized)?;
    let entry = message
        .recipients
        .iter()
        .find(|entry| &entry.service_id == service_id)
        .ok_or_else(|| {
            ProtocolError::InvalidMessage(format!("{service_id} is not a recipient"))
        })?;
    let shared_secret = identity.agree(&entry.ephemeral_public);
    let (key, nonce) = envelope_keys(&shared_secret, &entry.ephemeral_public, MULTI_RECIPIENT_INFO)?;
    let content_key: [u8; KEY_LEN] = open(&key, &nonce, &entry.wrapped_key)?
        .as_slice()
        .try_into()
        .map_err(|_| ProtocolError::Decryption)?;
    let plaintext = open(&content_key, &message.body_nonce, &message.body)?;
    Ok(serde_json::from_slice(&plaintext)?)
}
