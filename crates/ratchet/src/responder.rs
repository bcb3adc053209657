use std::collections::HashMap;

use shared::domain::{DeviceId, RegistrationId};

use crate::{
    bundle::{OneTimePreKey, PreKeyBundle, SignedPreKey},
    error::{ProtocolError, Result},
    keys::{hkdf_expand, AgreementKeyPair, IdentityKey, IdentityKeyPair, KEY_LEN},
    session::derive_message_keys,
    session_cipher::{agreement_material, open, CiphertextKind, PreKeyMessage, WhisperMessage},
};

/// Largest gap a single message may skip over.
const MAX_SKIPPED_MESSAGES: u32 = 2_000;

/// Key material a receiving device publishes and later uses to accept sessions.
pub struct DeviceKeys {
    pub identity: IdentityKeyPair,
    pub registration_id: RegistrationId,
    pub device_id: DeviceId,
    signed_prekey_id: u32,
    signed_prekey: AgreementKeyPair,
    signed_prekey_signature: Vec<u8>,
    one_time_prekeys: HashMap<u32, AgreementKeyPair>,
    pq_prekey: Option<SignedPreKey>,
}

impl DeviceKeys {
    pub fn generate(registration_id: RegistrationId, device_id: DeviceId) -> Self {
        Self::with_identity(IdentityKeyPair::generate(), registration_id, device_id)
    }

    /// Another device of an account that already has an identity.
    pub fn with_identity(
        identity: IdentityKeyPair,
        registration_id: RegistrationId,
        device_id: DeviceId,
    ) -> Self {
        let signed_prekey = AgreementKeyPair::generate();
        let signed_prekey_signature = identity.sign(&signed_prekey.public_key());
        Self {
            identity,
            registration_id,
            device_id,
            signed_prekey_id: 1,
            signed_prekey,
            signed_prekey_signature,
            one_time_prekeys: HashMap::new(),
            pq_prekey: None,
        }
    }

    pub fn add_one_time_prekey(&mut self, id: u32) -> OneTimePreKey {
        let pair = AgreementKeyPair::generate();
        let prekey = OneTimePreKey {
            id,
            public_key: pair.public_key(),
        };
        self.one_time_prekeys.insert(id, pair);
        prekey
    }

    pub fn set_pq_prekey(&mut self, id: u32) -> SignedPreKey {
        let public_key = AgreementKeyPair::generate().public_key();
        let prekey = SignedPreKey {
            id,
            public_key,
            signature: self.identity.sign(&public_key),
        };
        self.pq_prekey = Some(prekey.clone());
        prekey
    }

    pub fn identity_key(&self) -> IdentityKey {
        self.identity.public_key()
    }

    pub fn signed_prekey(&self) -> SignedPreKey {
        SignedPreKey {
            id: self.signed_prekey_id,
            public_key: self.signed_prekey.public_key(),
            signature: self.signed_prekey_signature.clone(),
        }
    }

    /// Bundle in the richest shape this device can offer.
    pub fn bundle(&self) -> PreKeyBundle {
        let mut bundle = PreKeyBundle::new(
            self.registration_id,
            self.device_id,
            self.identity_key(),
            self.signed_prekey(),
        );
        if let Some((id, pair)) = self.one_time_prekeys.iter().min_by_key(|(id, _)| **id) {
            bundle = bundle.with_one_time_prekey(OneTimePreKey {
                id: *id,
                public_key: pair.public_key(),
            });
        }
        if let Some(pq) = &self.pq_prekey {
            bundle = bundle.with_pq_prekey(pq.clone());
        }
        bundle
    }

    /// Accepts the first prekey message from a new sender, consuming its one-time prekey.
    pub fn accept(&mut self, serialized: &[u8]) -> Result<(ReceivingSession, Vec<u8>)> {
        let message: PreKeyMessage = serde_json::from_slice(serialized)?;
        if message.signed_prekey_id != self.signed_prekey_id {
            return Err(ProtocolError::InvalidMessage(format!(
                "unknown signed prekey {}",
                message.signed_prekey_id
            )));
        }

        let dh1 = self.signed_prekey.agree(&message.identity_key.agreement);
        let dh2 = self.identity.agree(&message.base_key);
        let dh3 = self.signed_prekey.agree(&message.base_key);
        let dh4 = match message.one_time_prekey_id {
            Some(id) => {
                let pair = self.one_time_prekeys.remove(&id).ok_or_else(|| {
                    ProtocolError::InvalidMessage(format!("unknown one-time prekey {id}"))
                })?;
                Some(pair.agree(&message.base_key))
            }
            None => None,
        };
        let pq_public = match message.pq_prekey_id {
            Some(id) => match &self.pq_prekey {
                Some(pq) if pq.id == id => Some(pq.public_key),
                _ => {
                    return Err(ProtocolError::InvalidMessage(format!(
                        "unknown post-quantum prekey {id}"
                    )))
                }
            },
            None => None,
        };
        let (_root_key, chain_key) =
            agreement_material(dh1, dh2, dh3, dh4, pq_public.as_ref())?;

        let mut session = ReceivingSession {
            remote_identity: message.identity_key,
            remote_registration_id: message.registration_id,
            base_key: message.base_key,
            chain_key,
            next_index: 0,
        };
        let plaintext = session.decrypt_whisper(&message.message)?;
        Ok((session, plaintext))
    }
}

/// Receiving half of a session. Counters only move forward; gaps left by messages that
/// were never delivered are skipped, earlier counters are rejected.
#[derive(Clone)]
pub struct ReceivingSession {
    pub remote_identity: IdentityKey,
    pub remote_registration_id: RegistrationId,
    base_key: [u8; KEY_LEN],
    chain_key: [u8; KEY_LEN],
    next_index: u32,
}

impl ReceivingSession {
    pub fn decrypt(&mut self, kind: CiphertextKind, serialized: &[u8]) -> Result<Vec<u8>> {
        match kind {
            CiphertextKind::Whisper => {
                let message: WhisperMessage = serde_json::from_slice(serialized)?;
                self.decrypt_whisper(&message)
            }
            CiphertextKind::PreKey => {
                let message: PreKeyMessage = serde_json::from_slice(serialized)?;
                if message.base_key != self.base_key {
                    return Err(ProtocolError::InvalidMessage(
                        "prekey message belongs to a different session".into(),
                    ));
                }
                self.decrypt_whisper(&message.message)
            }
            other => Err(ProtocolError::InvalidMessage(format!(
                "{other:?} is not a session message"
            ))),
        }
    }

    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    fn decrypt_whisper(&mut self, message: &WhisperMessage) -> Result<Vec<u8>> {
        if message.counter < self.next_index
            || message.counter - self.next_index > MAX_SKIPPED_MESSAGES
        {
            return Err(ProtocolError::InvalidMessage(format!(
                "counter {} out of range, next is {}",
                message.counter, self.next_index
            )));
        }
        let mut chain_key = self.chain_key;
        for _ in self.next_index..message.counter {
            chain_key = hkdf_expand(None, &chain_key, b"chain-key")?;
        }
        let keys = derive_message_keys(&chain_key, message.counter)?;
        let plaintext = open(&keys.key, &keys.nonce, &message.ciphertext)?;
        self.chain_key = hkdf_expand(None, &chain_key, b"chain-key")?;
        self.next_index = message.counter + 1;
        Ok(plaintext)
    }
}
