use serde::{Deserialize, Serialize};
use shared::domain::{DeviceId, RegistrationId};

use crate::keys::{IdentityKey, KEY_LEN};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    pub id: u32,
    pub public_key: [u8; KEY_LEN],
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey {
    pub id: u32,
    pub public_key: [u8; KEY_LEN],
}

/// Everything needed to start a session with a device that has never answered us.
///
/// Three shapes exist: signed prekey only, plus a one-time prekey, and plus a
/// post-quantum prekey as well. A bundle is consumed by exactly one session creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub registration_id: RegistrationId,
    pub device_id: DeviceId,
    pub identity_key: IdentityKey,
    pub signed_prekey: SignedPreKey,
    pub one_time_prekey: Option<OneTimePreKey>,
    pub pq_prekey: Option<SignedPreKey>,
}

impl PreKeyBundle {
    pub fn new(
        registration_id: RegistrationId,
        device_id: DeviceId,
        identity_key: IdentityKey,
        signed_prekey: SignedPreKey,
    ) -> Self {
        Self {
            registration_id,
            device_id,
            identity_key,
            signed_prekey,
            one_time_prekey: None,
            pq_prekey: None,
        }
    }

    pub fn with_one_time_prekey(mut self, prekey: OneTimePreKey) -> Self {
        self.one_time_prekey = Some(prekey);
        self
    }

    pub fn with_pq_prekey(mut self, prekey: SignedPreKey) -> Self {
        self.pq_prekey = Some(prekey);
        self
    }
}
