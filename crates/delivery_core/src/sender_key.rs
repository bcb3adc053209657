//! Group (sender key) encryption: who may receive it, keeping the key distributed, and
//! the multi-recipient submission itself.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use futures::future::join_all;
use ratchet::{ProtocolStore, SessionRecord};
use shared::{
    domain::{
        AccessKey, ContentKind, DeviceId, DistributionId, RecipientDevice, RegistrationId,
        SealedSenderAccess, ServiceId,
    },
    protocol::{AccountMismatchedDevices, AccountStaleDevices, MultiRecipientSendResponse},
};
use storage::{SenderKeyState, Storage};
use tracing::{debug, info, warn};

use crate::{
    classify::{error_for_response, RequestKind},
    clock::Clock,
    encryptor::{DeviceMessageEncryptor, EncryptRequest, SealedSenderParams, SessionLocks},
    error::SendError,
    fanout::{FanoutSender, PairwiseSend, SealedAccess},
    transport::{MultiRecipientSubmission, Relay, ThreadSnapshot},
    LocalAccount,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateDevice {
    pub device: RecipientDevice,
    pub access: SealedSenderAccess,
    /// Remote registration id of the current session; `None` without a session.
    pub registration_id: Option<RegistrationId>,
}

#[derive(Debug, Clone)]
pub struct ClassifyInput<'a> {
    pub sender_key_enabled: bool,
    pub thread: &'a ThreadSnapshot,
    pub local_service_id: &'a ServiceId,
    pub state: Option<&'a SenderKeyState>,
    pub key_expired: bool,
    pub devices: Vec<CandidateDevice>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderKeyPartition {
    pub fanout: Vec<RecipientDevice>,
    pub sender_key_ready: Vec<RecipientDevice>,
    pub needs_distribution: Vec<RecipientDevice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Fanout,
    Ready,
    NeedsDistribution,
}

fn place(input: &ClassifyInput<'_>, candidate: &CandidateDevice) -> Placement {
    let service_id = &candidate.device.service_id;
    if !input.sender_key_enabled || !input.thread.sender_key_capable {
        return Placement::Fanout;
    }
    if !input.thread.is_member(service_id) {
        return Placement::Fanout;
    }
    if matches!(candidate.access, SealedSenderAccess::Disabled) {
        return Placement::Fanout;
    }
    if service_id == input.local_service_id {
        return Placement::Fanout;
    }
    let Some(registration_id) = candidate.registration_id else {
        return Placement::NeedsDistribution;
    };
    if !registration_id.is_valid_for_multi_recipient() {
        return Placement::Fanout;
    }
    match input.state {
        Some(state) if !input.key_expired && state.shared_with.contains(&candidate.device) => {
            Placement::Ready
        }
        _ => Placement::NeedsDistribution,
    }
}

/// Splits candidate devices; every distinct device lands in exactly one bucket.
pub fn classify(input: &ClassifyInput<'_>) -> SenderKeyPartition {
    let mut seen = BTreeSet::new();
    let mut partition = SenderKeyPartition::default();
    for candidate in &input.devices {
        if !seen.insert(candidate.device.clone()) {
            continue;
        }
        let bucket = match place(input, candidate) {
            Placement::Fanout => &mut partition.fanout,
            Placement::Ready => &mut partition.sender_key_ready,
            Placement::NeedsDistribution => &mut partition.needs_distribution,
        };
        bucket.push(candidate.device.clone());
    }
    partition
}

#[derive(Debug, Clone)]
pub struct GroupMember {
    pub service_id: ServiceId,
    pub access_key: AccessKey,
}

#[derive(Debug, Default)]
pub struct GroupOutcome {
    /// Recipients the group path settled, successfully or not.
    pub results: Vec<(ServiceId, Result<Vec<RecipientDevice>, SendError>)>,
    /// Recipients the batch handed back for pairwise delivery.
    pub fallback: Vec<ServiceId>,
}

impl GroupOutcome {
    fn settle_all(&mut self, members: Vec<GroupMember>, error: impl Fn() -> SendError) {
        for member in members {
            self.results.push((member.service_id, Err(error())));
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupSend<'a> {
    pub thread: &'a ThreadSnapshot,
    pub distribution_id: DistributionId,
    pub content: &'a [u8],
    pub sealed: &'a SealedSenderParams,
    pub timestamp: u64,
    pub online: bool,
    pub urgent: bool,
}

pub struct SenderKeyCoordinator {
    storage: Storage,
    relay: Arc<dyn Relay>,
    fanout: Arc<FanoutSender>,
    encryptor: Arc<DeviceMessageEncryptor>,
    locks: Arc<SessionLocks>,
    clock: Arc<dyn Clock>,
    local: LocalAccount,
    enabled: bool,
    max_age: chrono::Duration,
    max_local_retries: u32,
}

impl SenderKeyCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Storage,
        relay: Arc<dyn Relay>,
        fanout: Arc<FanoutSender>,
        encryptor: Arc<DeviceMessageEncryptor>,
        locks: Arc<SessionLocks>,
        clock: Arc<dyn Clock>,
        local: LocalAccount,
        enabled: bool,
        max_age: chrono::Duration,
        max_local_retries: u32,
    ) -> Self {
        Self {
            storage,
            relay,
            fanout,
            encryptor,
            locks,
            clock,
            local,
            enabled,
            max_age,
            max_local_retries,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_expired(&self, state: &SenderKeyState) -> bool {
        self.clock.now() - state.created_at >= self.max_age
    }

    /// Current distribution for the thread, rotated first when it has expired, when a
    /// device that held it has left, or when the local key record is gone.
    pub async fn prepare_state(&self, thread: &ThreadSnapshot) -> Result<SenderKeyState, SendError> {
        let local = self.local.address();
        if let Some(state) = self.storage.sender_key_state(&thread.thread_id).await? {
            let departed = state.shared_with.iter().find(|device| {
                device.service_id != self.local.service_id && !thread.is_member(&device.service_id)
            });
            let has_record = self
                .storage
                .load_sender_key(&local, state.distribution_id)
                .await?
                .is_some();
            let reason = if self.is_expired(&state) {
                Some("expired")
            } else if departed.is_some() {
                Some("member left")
            } else if !has_record {
                Some("local key missing")
            } else {
                None
            };
            match reason {
                None => return Ok(state),
                Some(reason) => {
                    info!(thread = %thread.thread_id, reason, "rotating sender key");
                }
            }
        }

        let distribution_id = DistributionId::new_random();
        let created_at = self.clock.now();
        self.storage
            .replace_sender_key_state(&thread.thread_id, distribution_id, created_at)
            .await?;
        {
            let _guard = self.locks.lock(&local).await;
            ratchet::create_sender_key_distribution_message(&self.storage, &local, distribution_id)
                .await?;
        }
        Ok(SenderKeyState {
            thread_id: thread.thread_id.clone(),
            distribution_id,
            created_at,
            shared_with: BTreeSet::new(),
        })
    }

    /// One candidate per known device of each recipient, with its session's registration id.
    pub async fn candidates(
        &self,
        recipients: &[(ServiceId, SealedSenderAccess)],
    ) -> Result<Vec<CandidateDevice>, SendError> {
        let mut candidates = Vec::new();
        for (service_id, access) in recipients {
            for device_id in self.fanout.target_devices(service_id).await? {
                let device = RecipientDevice::new(service_id.clone(), device_id);
                let registration_id = self
                    .storage
                    .load_session(&device)
                    .await?
                    .filter(SessionRecord::is_valid)
                    .map(|session| session.remote_registration_id());
                candidates.push(CandidateDevice {
                    device,
                    access: *access,
                    registration_id,
                });
            }
        }
        Ok(candidates)
    }

    /// Hands the current sender key to each member over pairwise sessions. Devices that
    /// accepted it are recorded as holders; a failure only affects that member.
    pub async fn distribute(
        &self,
        distribution_id: DistributionId,
        members: &[GroupMember],
        sealed: &SealedSenderParams,
        timestamp: u64,
    ) -> Result<Vec<(ServiceId, Result<(), SendError>)>, SendError> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let local = self.local.address();
        let message = {
            let _guard = self.locks.lock(&local).await;
            ratchet::create_sender_key_distribution_message(&self.storage, &local, distribution_id)
                .await?
        };
        let request = EncryptRequest {
            kind: ContentKind::SenderKeyDistribution,
            content: message.serialize()?,
        };
        let params = SealedSenderParams {
            content_hint: ContentKind::SenderKeyDistribution.content_hint(),
            ..sealed.clone()
        };

        let sends = members.iter().map(|member| {
            let send = PairwiseSend {
                recipient: member.service_id.clone(),
                request: request.clone(),
                sealed: Some(SealedAccess {
                    params: params.clone(),
                    access_key: member.access_key,
                }),
                timestamp,
                online: false,
                urgent: false,
            };
            async move { (send.recipient.clone(), self.fanout.send(&send).await) }
        });

        let mut results = Vec::with_capacity(members.len());
        for (service_id, outcome) in join_all(sends).await {
            let result = match outcome.result {
                Ok(devices) => {
                    self.storage
                        .mark_sender_key_shared(distribution_id, &devices)
                        .await?;
                    debug!(%service_id, devices = devices.len(), "sender key distributed");
                    Ok(())
                }
                Err(err) => {
                    warn!(%service_id, "sender key distribution failed: {err}");
                    Err(err)
                }
            };
            results.push((service_id, result));
        }
        Ok(results)
    }

    async fn member_devices(
        &self,
        members: &[GroupMember],
    ) -> Result<BTreeMap<ServiceId, Vec<RecipientDevice>>, SendError> {
        let mut devices = BTreeMap::new();
        for member in members {
            let ids: Vec<DeviceId> = self.fanout.target_devices(&member.service_id).await?;
            devices.insert(
                member.service_id.clone(),
                ids.into_iter()
                    .map(|device_id| RecipientDevice::new(member.service_id.clone(), device_id))
                    .collect(),
            );
        }
        Ok(devices)
    }

    /// Sends one multi-recipient message to every member, reconciling device lists and
    /// re-distributing the key between attempts.
    pub async fn send_group(
        &self,
        send: &GroupSend<'_>,
        members: Vec<GroupMember>,
    ) -> Result<GroupOutcome, SendError> {
        let mut outcome = GroupOutcome::default();
        let mut active = members;
        let mut last_error = None;

        for attempt in 1..=self.max_local_retries.max(1) {
            if active.is_empty() {
                return Ok(outcome);
            }

            let shared_with = self
                .storage
                .sender_key_state(&send.thread.thread_id)
                .await?
                .filter(|state| state.distribution_id == send.distribution_id)
                .map(|state| state.shared_with)
                .unwrap_or_default();
            let devices = self.member_devices(&active).await?;
            let unshared: Vec<GroupMember> = active
                .iter()
                .filter(|member| {
                    devices
                        .get(&member.service_id)
                        .is_some_and(|devices| devices.iter().any(|d| !shared_with.contains(d)))
                })
                .cloned()
                .collect();
            for (service_id, result) in self
                .distribute(send.distribution_id, &unshared, send.sealed, send.timestamp)
                .await?
            {
                if let Err(err) = result {
                    active.retain(|member| member.service_id != service_id);
                    outcome.results.push((service_id, Err(err)));
                }
            }
            if active.is_empty() {
                return Ok(outcome);
            }

            let mut devices = self.member_devices(&active).await?;
            let payload = loop {
                let all_devices: Vec<RecipientDevice> =
                    devices.values().flatten().cloned().collect();
                match self
                    .encryptor
                    .encrypt_for_group(send.distribution_id, &all_devices, send.content, send.sealed)
                    .await
                {
                    Ok(payload) => break payload,
                    // Only the member owning the sessionless device leaves the batch.
                    Err(SendError::NoSession(device)) => {
                        debug!(%device, "no session for group device, sending its account pairwise");
                        active.retain(|member| member.service_id != device.service_id);
                        devices.remove(&device.service_id);
                        outcome.fallback.push(device.service_id);
                        if active.is_empty() {
                            return Ok(outcome);
                        }
                    }
                    Err(err) => {
                        warn!(thread = %send.thread.thread_id, "group encrypt failed, falling back to pairwise: {err}");
                        outcome.fallback.extend(active.into_iter().map(|m| m.service_id));
                        return Ok(outcome);
                    }
                }
            };

            let submission = MultiRecipientSubmission {
                payload,
                timestamp: send.timestamp,
                online: send.online,
                urgent: send.urgent,
                access_key: AccessKey::composite(active.iter().map(|member| &member.access_key)),
            };
            let response = match self.relay.submit_multi_recipient_message(&submission).await {
                Ok(response) => response,
                Err(err) => {
                    debug!(attempt, "group submission failed: {err:#}");
                    last_error = Some(SendError::Network(format!("{err:#}")));
                    continue;
                }
            };

            match response.status {
                200..=299 => {
                    let body = if response.body.is_empty() {
                        MultiRecipientSendResponse::default()
                    } else {
                        response
                            .json::<MultiRecipientSendResponse>()
                            .map_err(|err| SendError::Internal(format!("{err:#}")))?
                    };
                    for member in active {
                        let result = if body.uuids404.contains(&member.service_id) {
                            Err(SendError::Unregistered(member.service_id.clone()))
                        } else {
                            Ok(devices.get(&member.service_id).cloned().unwrap_or_default())
                        };
                        outcome.results.push((member.service_id, result));
                    }
                    info!(thread = %send.thread.thread_id, attempt, "group send accepted");
                    return Ok(outcome);
                }
                409 => {
                    let entries: Vec<AccountMismatchedDevices> = response
                        .json()
                        .map_err(|err| SendError::Internal(format!("{err:#}")))?;
                    for entry in entries {
                        let missing: Vec<DeviceId> =
                            entry.devices.missing_devices.iter().copied().map(DeviceId).collect();
                        let extra: Vec<DeviceId> =
                            entry.devices.extra_devices.iter().copied().map(DeviceId).collect();
                        self.fanout
                            .reconcile_devices(&entry.uuid, &missing, &extra)
                            .await?;
                        let removed: Vec<RecipientDevice> = extra
                            .iter()
                            .map(|device_id| RecipientDevice::new(entry.uuid.clone(), *device_id))
                            .collect();
                        self.storage
                            .remove_sender_key_shared(send.distribution_id, &removed)
                            .await?;
                    }
                    last_error = Some(SendError::Internal("group device mismatch".into()));
                }
                410 => {
                    let entries: Vec<AccountStaleDevices> = response
                        .json()
                        .map_err(|err| SendError::Internal(format!("{err:#}")))?;
                    for entry in entries {
                        let stale: Vec<RecipientDevice> = entry
                            .devices
                            .stale_devices
                            .iter()
                            .map(|device_id| RecipientDevice::new(entry.uuid.clone(), DeviceId(*device_id)))
                            .collect();
                        info!(service_id = %entry.uuid, stale = stale.len(), "archiving stale group sessions");
                        for device in &stale {
                            let _guard = self.locks.lock(device).await;
                            self.storage.archive_session(device).await?;
                        }
                        self.storage
                            .remove_sender_key_shared(send.distribution_id, &stale)
                            .await?;
                    }
                    last_error = Some(SendError::Internal("group sessions stale".into()));
                }
                _ => match error_for_response(RequestKind::Group, &response) {
                    Some(SendError::GroupAuthInvalid | SendError::GroupUnknownAccount) => {
                        warn!(status = response.status, "group send rejected, falling back to pairwise");
                        outcome.fallback.extend(active.into_iter().map(|m| m.service_id));
                        return Ok(outcome);
                    }
                    Some(SendError::ChallengePending { retry_after }) => {
                        match self.fanout.handle_challenge(&response, retry_after).await {
                            SendError::ChallengePending { retry_after } => {
                                outcome.settle_all(active, || SendError::ChallengePending {
                                    retry_after,
                                });
                                return Ok(outcome);
                            }
                            resolved => last_error = Some(resolved),
                        }
                    }
                    Some(SendError::Network(reason)) => {
                        debug!(attempt, "group send failed: {reason}");
                        last_error = Some(SendError::Network(reason));
                    }
                    Some(SendError::RateLimited { retry_after }) => {
                        outcome.settle_all(active, || SendError::RateLimited { retry_after });
                        return Ok(outcome);
                    }
                    Some(SendError::AppExpired) => {
                        outcome.settle_all(active, || SendError::AppExpired);
                        return Ok(outcome);
                    }
                    Some(other) => {
                        let message = other.to_string();
                        outcome.settle_all(active, || SendError::Internal(message.clone()));
                        return Ok(outcome);
                    }
                    None => {
                        return Err(SendError::Internal(format!(
                            "unhandled group status {}",
                            response.status
                        )))
                    }
                },
            }
        }

        warn!(thread = %send.thread.thread_id, "group retry budget exhausted");
        let reason = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no group attempt was made".into());
        outcome.settle_all(active, || SendError::Network(reason.clone()));
        Ok(outcome)
    }
}

#[cfg(test)]
#[path = "tests/sender_key_tests.rs"]
mod tests;
