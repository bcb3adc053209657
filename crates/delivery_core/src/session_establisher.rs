use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ratchet::{
    IdentityKey, OneTimePreKey, PreKeyBundle, ProtocolError, ProtocolStore, SessionRecord,
    SignedPreKey, TrustLevel,
};
use shared::{
    domain::{AccessKey, DeviceId, RecipientDevice, RegistrationId, ServiceId},
    protocol::{
        ChallengeBody, PreKeyDeviceResponse, PreKeyEntity, PreKeyResponse, SignedPreKeyEntity,
    },
};
use storage::Storage;
use tracing::{debug, info, warn};

use crate::{
    caches::NegativeCaches,
    classify::{error_for_response, RequestKind},
    encryptor::SessionLocks,
    error::SendError,
    transport::{ChallengeResolver, Relay, RelayResponse},
};

pub struct PrekeyFetcher {
    relay: Arc<dyn Relay>,
    challenges: Arc<dyn ChallengeResolver>,
}

impl PrekeyFetcher {
    pub fn new(relay: Arc<dyn Relay>, challenges: Arc<dyn ChallengeResolver>) -> Self {
        Self { relay, challenges }
    }

    async fn request(
        &self,
        device: &RecipientDevice,
        access_key: Option<&AccessKey>,
    ) -> Result<RelayResponse, SendError> {
        self.relay
            .fetch_prekey_bundle(device, access_key)
            .await
            .map_err(|err| SendError::Network(format!("{err:#}")))
    }

    /// Fetches the prekeys of one device. A rejected access key is retried once without it.
    pub async fn fetch(
        &self,
        device: &RecipientDevice,
        access_key: Option<&AccessKey>,
    ) -> Result<PreKeyResponse, SendError> {
        let mut response = self.request(device, access_key).await?;
        if response.status == 401 && access_key.is_some() {
            debug!(%device, "prekey fetch access key rejected; retrying unsealed");
            response = self.request(device, None).await?;
            if response.status == 401 {
                return Err(SendError::Deregistered);
            }
        }

        match error_for_response(RequestKind::PrekeyFetch { device }, &response) {
            None => response
                .json::<PreKeyResponse>()
                .map_err(|err| SendError::Internal(format!("{err:#}"))),
            Some(SendError::ChallengePending { retry_after }) => {
                match response.json::<ChallengeBody>() {
                    Ok(challenge) => {
                        let handled = self
                            .challenges
                            .try_to_handle_silently(&challenge, retry_after)
                            .await
                            .unwrap_or_else(|err| {
                                warn!(%device, "challenge resolver failed: {err:#}");
                                false
                            });
                        debug!(%device, handled, "prekey fetch challenged");
                    }
                    Err(err) => warn!(%device, "unreadable challenge body: {err:#}"),
                }
                Err(SendError::ChallengePending { retry_after })
            }
            Some(SendError::SealedSenderAuth { .. }) => Err(SendError::Deregistered),
            Some(err) => Err(err),
        }
    }
}

fn decode_key(raw: &str, what: &str) -> Result<[u8; 32], SendError> {
    let bytes = STANDARD
        .decode(raw)
        .map_err(|err| SendError::Internal(format!("invalid base64 in {what}: {err}")))?;
    bytes
        .try_into()
        .map_err(|_| SendError::Internal(format!("{what} has the wrong length")))
}

fn decode_signature(raw: &str) -> Result<Vec<u8>, SendError> {
    STANDARD
        .decode(raw)
        .map_err(|err| SendError::Internal(format!("invalid base64 in signature: {err}")))
}

fn decode_signed(entity: &SignedPreKeyEntity, what: &str) -> Result<SignedPreKey, SendError> {
    Ok(SignedPreKey {
        id: entity.key_id,
        public_key: decode_key(&entity.public_key, what)?,
        signature: decode_signature(&entity.signature)?,
    })
}

/// Builds the bundle for `device` from a prekey response, in whichever of the three
/// shapes the populated fields allow.
pub fn bundle_from_response(
    device: &RecipientDevice,
    response: &PreKeyResponse,
) -> Result<PreKeyBundle, SendError> {
    let identity_bytes = STANDARD
        .decode(&response.identity_key)
        .map_err(|err| SendError::Internal(format!("invalid base64 in identity key: {err}")))?;
    let identity_key = IdentityKey::from_bytes(&identity_bytes)?;
    let entry = response
        .devices
        .iter()
        .find(|entry| entry.device_id == device.device_id.0)
        .ok_or_else(|| SendError::MissingDevice(device.clone()))?;

    let mut bundle = PreKeyBundle::new(
        RegistrationId(entry.registration_id),
        DeviceId(entry.device_id),
        identity_key,
        decode_signed(&entry.signed_pre_key, "signed prekey")?,
    );
    if let Some(pre_key) = &entry.pre_key {
        bundle = bundle.with_one_time_prekey(OneTimePreKey {
            id: pre_key.key_id,
            public_key: decode_key(&pre_key.public_key, "one-time prekey")?,
        });
    }
    if let Some(pq) = &entry.pq_pre_key {
        bundle = bundle.with_pq_prekey(decode_signed(pq, "post-quantum prekey")?);
    }
    Ok(bundle)
}

/// Inverse of [`bundle_from_response`] for bundles that share one identity.
pub fn prekey_response(identity: &IdentityKey, bundles: &[PreKeyBundle]) -> PreKeyResponse {
    let signed = |prekey: &SignedPreKey| SignedPreKeyEntity {
        key_id: prekey.id,
        public_key: STANDARD.encode(prekey.public_key),
        signature: STANDARD.encode(&prekey.signature),
    };
    PreKeyResponse {
        identity_key: STANDARD.encode(identity.to_bytes()),
        devices: bundles
            .iter()
            .map(|bundle| PreKeyDeviceResponse {
                device_id: bundle.device_id.0,
                registration_id: bundle.registration_id.0,
                signed_pre_key: signed(&bundle.signed_prekey),
                pre_key: bundle.one_time_prekey.as_ref().map(|otpk| PreKeyEntity {
                    key_id: otpk.id,
                    public_key: STANDARD.encode(otpk.public_key),
                }),
                pq_pre_key: bundle.pq_prekey.as_ref().map(signed),
            })
            .collect(),
    }
}

/// Makes sure a valid session exists before anything is encrypted for a device.
pub struct SessionEstablisher {
    storage: Storage,
    fetcher: PrekeyFetcher,
    caches: Arc<NegativeCaches>,
    locks: Arc<SessionLocks>,
}

impl SessionEstablisher {
    pub fn new(
        storage: Storage,
        fetcher: PrekeyFetcher,
        caches: Arc<NegativeCaches>,
        locks: Arc<SessionLocks>,
    ) -> Self {
        Self {
            storage,
            fetcher,
            caches,
            locks,
        }
    }

    async fn has_valid_session(&self, device: &RecipientDevice) -> Result<bool, SendError> {
        Ok(self
            .storage
            .load_session(device)
            .await?
            .is_some_and(|session: SessionRecord| session.is_valid()))
    }

    pub async fn ensure_session(
        &self,
        device: &RecipientDevice,
        access_key: Option<&AccessKey>,
    ) -> Result<(), SendError> {
        let _guard = self.locks.lock(device).await;
        if self.has_valid_session(device).await? {
            return Ok(());
        }

        let service_id = &device.service_id;
        if self.caches.is_missing(device).await {
            return Err(SendError::MissingDevice(device.clone()));
        }
        if self.caches.is_untrusted(service_id).await {
            return Err(SendError::UntrustedIdentity(service_id.clone()));
        }
        if self.caches.invalid_signature_blocked(service_id).await {
            return Err(SendError::InvalidSignature {
                service_id: service_id.clone(),
                terminal: true,
            });
        }

        let response = match self.fetcher.fetch(device, access_key).await {
            Ok(response) => response,
            Err(SendError::MissingDevice(missing)) => {
                return Err(self.forget_device(missing).await?)
            }
            Err(err) => return Err(err),
        };
        let bundle = match bundle_from_response(device, &response) {
            Ok(bundle) => bundle,
            Err(SendError::MissingDevice(missing)) => {
                return Err(self.forget_device(missing).await?)
            }
            Err(err) => return Err(err),
        };

        match ratchet::process_prekey_bundle(&self.storage, device, &bundle).await {
            Ok(()) => {
                self.caches.clear_invalid_signature(service_id).await;
            }
            Err(ProtocolError::UntrustedIdentity { identity, .. }) => {
                warn!(%device, "identity changed; holding new key for approval");
                self.storage
                    .save_identity(service_id, &identity, TrustLevel::Pending)
                    .await?;
                self.caches.mark_untrusted(service_id).await;
                return Err(SendError::UntrustedIdentity(service_id.clone()));
            }
            Err(ProtocolError::InvalidSignature(_)) => {
                let terminal = self.caches.record_invalid_signature(service_id).await;
                warn!(%device, terminal, "prekey bundle failed signature check");
                return Err(SendError::InvalidSignature {
                    service_id: service_id.clone(),
                    terminal,
                });
            }
            Err(err) => return Err(err.into()),
        }

        if !self.has_valid_session(device).await? {
            return Err(SendError::Internal(format!(
                "session for {device} missing after processing its bundle"
            )));
        }
        info!(%device, "session established");
        Ok(())
    }

    /// The relay has no keys for this device. Linked devices leave the account's device list;
    /// the primary stays so the account itself is not forgotten.
    async fn forget_device(&self, missing: RecipientDevice) -> Result<SendError, SendError> {
        self.caches.mark_missing(&missing).await;
        if missing.device_id != DeviceId::PRIMARY {
            info!(device = %missing, "removing device the relay no longer knows");
            self.storage
                .apply_device_changes(&missing.service_id, &[], &[missing.device_id])
                .await?;
        }
        Ok(SendError::MissingDevice(missing))
    }

    /// The user accepted a changed identity; the next send may use it.
    pub async fn identity_approved(&self, service_id: &ServiceId) -> Result<bool, SendError> {
        let approved = self.storage.trust_identity(service_id).await?;
        self.caches.clear_untrusted(service_id).await;
        Ok(approved)
    }
}

#[cfg(test)]
#[path = "tests/session_establisher_tests.rs"]
mod tests;
