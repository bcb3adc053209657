use std::sync::Arc;

use ratchet::ProtocolStore;
use shared::{
    domain::{AccessKey, DeviceId, EncryptionMode, RecipientDevice, ServiceId},
    protocol::ChallengeBody,
};
use storage::Storage;
use tracing::{debug, info, warn};

use crate::{
    caches::NegativeCaches,
    classify::{classify, error_for_response, RequestKind},
    encryptor::{DeviceMessageEncryptor, EncryptRequest, SealedSenderParams, SessionLocks},
    error::SendError,
    session_establisher::SessionEstablisher,
    transport::{ChallengeResolver, DeviceMessageSubmission, Relay, RelayResponse},
    LocalAccount,
};

/// Sealed-sender material for one recipient.
#[derive(Debug, Clone)]
pub struct SealedAccess {
    pub params: SealedSenderParams,
    pub access_key: AccessKey,
}

#[derive(Debug, Clone)]
pub struct PairwiseSend {
    pub recipient: ServiceId,
    pub request: EncryptRequest,
    pub sealed: Option<SealedAccess>,
    pub timestamp: u64,
    pub online: bool,
    pub urgent: bool,
}

#[derive(Debug)]
pub struct PairwiseOutcome {
    pub mode: EncryptionMode,
    /// Devices the relay accepted, on success.
    pub result: Result<Vec<RecipientDevice>, SendError>,
    /// What this attempt learned about the account's registration.
    pub registered: Option<bool>,
}

/// Sends pairwise-encrypted copies to every device of one recipient, reconciling the
/// relay's device bookkeeping along the way.
pub struct FanoutSender {
    storage: Storage,
    relay: Arc<dyn Relay>,
    challenges: Arc<dyn ChallengeResolver>,
    establisher: Arc<SessionEstablisher>,
    encryptor: Arc<DeviceMessageEncryptor>,
    caches: Arc<NegativeCaches>,
    locks: Arc<SessionLocks>,
    local: LocalAccount,
    max_local_retries: u32,
}

impl FanoutSender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Storage,
        relay: Arc<dyn Relay>,
        challenges: Arc<dyn ChallengeResolver>,
        establisher: Arc<SessionEstablisher>,
        encryptor: Arc<DeviceMessageEncryptor>,
        caches: Arc<NegativeCaches>,
        locks: Arc<SessionLocks>,
        local: LocalAccount,
        max_local_retries: u32,
    ) -> Self {
        Self {
            storage,
            relay,
            challenges,
            establisher,
            encryptor,
            caches,
            locks,
            local,
            max_local_retries,
        }
    }

    /// Known devices of the recipient; the primary device when nothing is known yet.
    /// The local device never sends to itself.
    pub async fn target_devices(&self, service_id: &ServiceId) -> Result<Vec<DeviceId>, SendError> {
        let devices = self
            .storage
            .recipient_devices(service_id)
            .await?
            .unwrap_or_else(|| vec![DeviceId::PRIMARY]);
        Ok(devices
            .into_iter()
            .filter(|device_id| {
                !(service_id == &self.local.service_id && *device_id == self.local.device_id)
            })
            .collect())
    }

    /// Applies a device mismatch the relay reported for one account.
    pub async fn reconcile_devices(
        &self,
        service_id: &ServiceId,
        missing: &[DeviceId],
        extra: &[DeviceId],
    ) -> Result<(), SendError> {
        info!(%service_id, ?missing, ?extra, "reconciling device list");
        if self.storage.recipient_devices(service_id).await?.is_none() {
            // The relay corrected our guess, so the guess becomes the baseline.
            self.storage
                .set_recipient_devices(service_id, &[DeviceId::PRIMARY])
                .await?;
        }
        self.storage
            .apply_device_changes(service_id, missing, extra)
            .await?;
        for device_id in missing {
            self.caches
                .clear_missing(&RecipientDevice::new(service_id.clone(), *device_id))
                .await;
        }
        Ok(())
    }

    pub async fn send(&self, send: &PairwiseSend) -> PairwiseOutcome {
        let mode = if send.request.kind.is_plaintext_wrapper() {
            EncryptionMode::PlaintextWrapper
        } else {
            EncryptionMode::Pairwise
        };
        let result = self.send_with_retries(send).await;
        let registered = match &result {
            Ok(_) => Some(true),
            Err(SendError::Unregistered(_)) => Some(false),
            Err(_) => None,
        };
        PairwiseOutcome {
            mode,
            result,
            registered,
        }
    }

    async fn send_with_retries(
        &self,
        send: &PairwiseSend,
    ) -> Result<Vec<RecipientDevice>, SendError> {
        let service_id = &send.recipient;
        let mut sealed = send.sealed.clone();
        let mut last_error = None;

        for attempt in 1..=self.max_local_retries.max(1) {
            let error = match self.attempt(send, sealed.as_ref()).await {
                Ok(devices) => {
                    info!(%service_id, attempt, devices = devices.len(), "pairwise send accepted");
                    return Ok(devices);
                }
                Err(error) => error,
            };

            match &error {
                SendError::SealedSenderAuth { .. } if sealed.is_some() => {
                    debug!(%service_id, "access key rejected; retrying unsealed");
                    sealed = None;
                }
                SendError::MismatchedDevices { missing, extra, .. } => {
                    self.reconcile_devices(service_id, missing, extra).await?;
                }
                SendError::StaleDevices { stale, .. } => {
                    info!(%service_id, ?stale, "archiving stale sessions");
                    for device_id in stale {
                        let device = RecipientDevice::new(service_id.clone(), *device_id);
                        let _guard = self.locks.lock(&device).await;
                        self.storage.archive_session(&device).await?;
                    }
                }
                SendError::ChallengePending { .. } => return Err(error),
                other if classify(other).is_retryable() => {
                    debug!(%service_id, attempt, "retrying after {other}");
                }
                _ => return Err(error),
            }
            last_error = Some(error);
        }

        warn!(%service_id, "local retry budget exhausted");
        Err(last_error.unwrap_or_else(|| SendError::Internal("no send attempt was made".into())))
    }

    async fn attempt(
        &self,
        send: &PairwiseSend,
        sealed: Option<&SealedAccess>,
    ) -> Result<Vec<RecipientDevice>, SendError> {
        let service_id = &send.recipient;
        let access_key = sealed.map(|sealed| &sealed.access_key);
        let mut devices = Vec::new();
        let mut last_missing = None;

        for device_id in self.target_devices(service_id).await? {
            let device = RecipientDevice::new(service_id.clone(), device_id);
            if !send.request.kind.is_plaintext_wrapper() {
                match self.establisher.ensure_session(&device, access_key).await {
                    Ok(()) => {}
                    Err(SendError::MissingDevice(missing)) => {
                        debug!(device = %missing, "dropping missing device from this send");
                        last_missing = Some(missing);
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }
            devices.push(device);
        }

        if devices.is_empty() {
            // Every device is gone: the account is as good as unregistered.
            return Err(match last_missing {
                Some(_) => SendError::Unregistered(service_id.clone()),
                None => SendError::Internal(format!("no devices to send to for {service_id}")),
            });
        }

        let mut messages = Vec::with_capacity(devices.len());
        for device in &devices {
            messages.push(
                self.encryptor
                    .encrypt(&send.request, device, sealed.map(|sealed| &sealed.params))
                    .await?,
            );
        }

        let submission = DeviceMessageSubmission {
            destination: service_id.clone(),
            messages,
            timestamp: send.timestamp,
            online: send.online,
            urgent: send.urgent,
            access_key: access_key.copied(),
        };
        let response = self
            .relay
            .submit_device_messages(&submission)
            .await
            .map_err(|err| SendError::Network(format!("{err:#}")))?;

        match error_for_response(
            RequestKind::Pairwise {
                service_id,
                sealed: sealed.is_some(),
            },
            &response,
        ) {
            None => Ok(devices),
            Some(SendError::ChallengePending { retry_after }) => {
                Err(self.handle_challenge(&response, retry_after).await)
            }
            Some(err) => Err(err),
        }
    }

    /// A silently solved challenge becomes a plain retry; anything else stays pending.
    pub(crate) async fn handle_challenge(
        &self,
        response: &RelayResponse,
        retry_after: Option<std::time::Duration>,
    ) -> SendError {
        let handled = match response.json::<ChallengeBody>() {
            Ok(challenge) => self
                .challenges
                .try_to_handle_silently(&challenge, retry_after)
                .await
                .unwrap_or_else(|err| {
                    warn!("challenge resolver failed: {err:#}");
                    false
                }),
            Err(err) => {
                warn!("unreadable challenge body: {err:#}");
                false
            }
        };
        if handled {
            SendError::Network("challenge resolved; resubmitting".into())
        } else {
            SendError::ChallengePending { retry_after }
        }
    }
}

#[cfg(test)]
#[path = "tests/fanout_tests.rs"]
mod tests;
