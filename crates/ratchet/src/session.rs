use serde::{Deserialize, Serialize};
use shared::domain::RegistrationId;

use crate::{
    error::Result,
    keys::{hkdf_expand, IdentityKey, KEY_LEN},
};

pub const SESSION_VERSION: u8 = 4;

/// Prekey identifiers echoed in every outgoing message until the remote side answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPreKey {
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
    pub pq_prekey_id: Option<u32>,
    pub base_key: [u8; KEY_LEN],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    version: u8,
    local_registration_id: RegistrationId,
    remote_registration_id: RegistrationId,
    remote_identity: IdentityKey,
    root_key: [u8; KEY_LEN],
    sending_chain_key: [u8; KEY_LEN],
    sending_index: u32,
    pending_prekey: Option<PendingPreKey>,
}

pub(crate) struct MessageKeys {
    pub key: [u8; KEY_LEN],
    pub nonce: [u8; 12],
    pub index: u32,
}

impl SessionRecord {
    pub(crate) fn new_initiated(
        local_registration_id: RegistrationId,
        remote_registration_id: RegistrationId,
        remote_identity: IdentityKey,
        root_key: [u8; KEY_LEN],
        chain_key: [u8; KEY_LEN],
        pending_prekey: PendingPreKey,
    ) -> Self {
        Self {
            version: SESSION_VERSION,
            local_registration_id,
            remote_registration_id,
            remote_identity,
            root_key,
            sending_chain_key: chain_key,
            sending_index: 0,
            pending_prekey: Some(pending_prekey),
        }
    }

    /// A record written by an older protocol version cannot be used to encrypt.
    pub fn is_valid(&self) -> bool {
        self.version == SESSION_VERSION
    }

    pub fn remote_registration_id(&self) -> RegistrationId {
        self.remote_registration_id
    }

    pub fn local_registration_id(&self) -> RegistrationId {
        self.local_registration_id
    }

    pub fn remote_identity(&self) -> &IdentityKey {
        &self.remote_identity
    }

    pub fn pending_prekey(&self) -> Option<&PendingPreKey> {
        self.pending_prekey.as_ref()
    }

    pub fn sending_index(&self) -> u32 {
        self.sending_index
    }

    /// Called once the remote device has answered; later messages are plain whisper messages.
    pub fn mark_acknowledged(&mut self) {
        self.pending_prekey = None;
    }

    pub(crate) fn next_message_keys(&mut self) -> Result<MessageKeys> {
        let keys = derive_message_keys(&self.sending_chain_key, self.sending_index)?;
        self.sending_chain_key = hkdf_expand(None, &self.sending_chain_key, b"chain-key")?;
        self.sending_index += 1;
        Ok(keys)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub(crate) fn derive_message_keys(chain_key: &[u8; KEY_LEN], index: u32) -> Result<MessageKeys> {
    Ok(MessageKeys {
        key: hkdf_expand(None, chain_key, b"message-key")?,
        nonce: hkdf_expand(None, chain_key, b"message-nonce")?,
        index,
    })
}
