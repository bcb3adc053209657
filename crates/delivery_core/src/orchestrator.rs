use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use shared::domain::{
    ContentKind, DeliveryStatus, EncryptionMode, MessageId, RecipientDevice, RecipientRef,
    SealedSenderAccess, ServiceId, ThreadId,
};
use storage::{DeliveryCommit, DeviceDeliveryRow, RecipientStateRow, Storage};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    caches::NegativeCaches,
    classify::{classify, ErrorClass, RecipientKind},
    clock::Clock,
    config::DeliveryConfig,
    encryptor::{DeviceMessageEncryptor, EncryptRequest, SealedSenderParams, SessionLocks},
    error::SendError,
    fanout::{FanoutSender, PairwiseSend, SealedAccess},
    sender_key::{
        classify as partition_devices, ClassifyInput, GroupMember, GroupSend,
        SenderKeyCoordinator,
    },
    session_establisher::{PrekeyFetcher, SessionEstablisher},
    transport::{ChallengeResolver, Directory, Relay, ThreadResolver, ThreadSnapshot},
    LocalAccount,
};

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Row in the message store; `None` for messages that are never persisted.
    pub message_id: Option<MessageId>,
    pub thread_id: ThreadId,
    pub timestamp: DateTime<Utc>,
    pub kind: ContentKind,
    pub content: Vec<u8>,
    pub recipients: Vec<RecipientRef>,
}

#[derive(Clone)]
pub struct DeliveryDeps {
    pub storage: Storage,
    pub relay: Arc<dyn Relay>,
    pub threads: Arc<dyn ThreadResolver>,
    pub directory: Arc<dyn Directory>,
    pub challenges: Arc<dyn ChallengeResolver>,
    pub clock: Arc<dyn Clock>,
    pub config: DeliveryConfig,
    pub local: LocalAccount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientSummary {
    pub recipient_key: String,
    pub service_id: Option<ServiceId>,
    pub status: DeliveryStatus,
    pub mode: Option<EncryptionMode>,
    pub devices: Vec<RecipientDevice>,
    pub error: Option<ErrorClass>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    pub message_id: Option<MessageId>,
    pub recipients: Vec<RecipientSummary>,
    /// The message was deleted mid-send; nothing was recorded.
    pub abandoned: bool,
}

impl SendReport {
    pub fn recipient(&self, key: &str) -> Option<&RecipientSummary> {
        self.recipients.iter().find(|r| r.recipient_key == key)
    }
}

#[derive(Debug, Error)]
#[error("send failed: {error}")]
pub struct SendFailure {
    pub error: SendError,
    pub report: SendReport,
}

/// One recipient's slot for the current attempt. Owned by the orchestrator; send tasks
/// only see snapshots and answer with an [`AttemptReport`].
#[derive(Debug)]
struct RecipientAttempt {
    recipient_key: String,
    service_id: Option<ServiceId>,
    status: DeliveryStatus,
    mode: Option<EncryptionMode>,
    devices: Vec<RecipientDevice>,
    error: Option<SendError>,
    detail: Option<String>,
    registered: Option<bool>,
}

impl RecipientAttempt {
    fn pending(recipient_key: String, service_id: Option<ServiceId>) -> Self {
        Self {
            recipient_key,
            service_id,
            status: DeliveryStatus::Pending,
            mode: None,
            devices: Vec::new(),
            error: None,
            detail: None,
            registered: None,
        }
    }

    fn skip(&mut self, reason: &str) {
        self.status = DeliveryStatus::Skipped;
        self.detail = Some(reason.to_owned());
    }

    fn record(&mut self, mode: EncryptionMode, result: Result<Vec<RecipientDevice>, SendError>) {
        self.mode = Some(mode);
        match result {
            Ok(devices) => {
                self.status = DeliveryStatus::Sent;
                self.devices = devices;
                self.registered = Some(true);
            }
            Err(err) => self.fail(err),
        }
    }

    fn fail(&mut self, err: SendError) {
        self.status = status_for(&err);
        if matches!(err, SendError::Unregistered(_)) {
            self.registered = Some(false);
        }
        self.detail = Some(err.to_string());
        self.error = Some(err);
    }
}

#[derive(Debug)]
struct AttemptReport {
    slot: usize,
    mode: EncryptionMode,
    result: Result<Vec<RecipientDevice>, SendError>,
    registered: Option<bool>,
}

/// Status persisted for a recipient whose send ended with `error`.
pub fn status_for(error: &SendError) -> DeliveryStatus {
    match classify(error) {
        ErrorClass::TerminalPerRecipient(RecipientKind::Unregistered | RecipientKind::Blocked) => {
            DeliveryStatus::Skipped
        }
        ErrorClass::TerminalPerRecipient(_) | ErrorClass::Fatal(_) => {
            DeliveryStatus::FailedTerminal
        }
        ErrorClass::Retryable(_) | ErrorClass::TerminalGlobal(_) => {
            DeliveryStatus::FailedRetryable
        }
    }
}

pub struct DeliveryOrchestrator {
    storage: Storage,
    threads: Arc<dyn ThreadResolver>,
    directory: Arc<dyn Directory>,
    establisher: Arc<SessionEstablisher>,
    fanout: Arc<FanoutSender>,
    sender_keys: SenderKeyCoordinator,
    caches: Arc<NegativeCaches>,
    local: LocalAccount,
}

impl DeliveryOrchestrator {
    pub fn new(deps: DeliveryDeps) -> Self {
        let DeliveryDeps {
            storage,
            relay,
            threads,
            directory,
            challenges,
            clock,
            config,
            local,
        } = deps;
        let locks = Arc::new(SessionLocks::default());
        let caches = Arc::new(NegativeCaches::new(clock.clone(), &config));
        let establisher = Arc::new(SessionEstablisher::new(
            storage.clone(),
            PrekeyFetcher::new(relay.clone(), challenges.clone()),
            caches.clone(),
            locks.clone(),
        ));
        let encryptor = Arc::new(DeviceMessageEncryptor::new(
            storage.clone(),
            locks.clone(),
            local.clone(),
            config.max_group_ciphertext_bytes,
        ));
        let fanout = Arc::new(FanoutSender::new(
            storage.clone(),
            relay.clone(),
            challenges,
            establisher.clone(),
            encryptor.clone(),
            caches.clone(),
            locks.clone(),
            local.clone(),
            config.max_local_retries,
        ));
        let sender_keys = SenderKeyCoordinator::new(
            storage.clone(),
            relay,
            fanout.clone(),
            encryptor,
            locks,
            clock,
            local.clone(),
            config.sender_key_enabled,
            config.sender_key_max_age(),
            config.max_local_retries,
        );
        Self {
            storage,
            threads,
            directory,
            establisher,
            fanout,
            sender_keys,
            caches,
            local,
        }
    }

    pub fn establisher(&self) -> &SessionEstablisher {
        &self.establisher
    }

    pub fn caches(&self) -> &NegativeCaches {
        &self.caches
    }

    pub fn sender_keys(&self) -> &SenderKeyCoordinator {
        &self.sender_keys
    }

    /// Delivers one message to its current recipients and records every outcome.
    ///
    /// Outcomes are committed before an error is returned, so a failed send still
    /// leaves accurate per-recipient state behind for the caller's retry.
    pub async fn send(&self, message: &OutgoingMessage) -> Result<SendReport, SendFailure> {
        let thread = match self.threads.thread(&message.thread_id).await {
            Ok(Some(thread)) => thread,
            Ok(None) => {
                debug!(thread = %message.thread_id, "thread unknown; treating it as memberless");
                ThreadSnapshot {
                    thread_id: message.thread_id.clone(),
                    members: Vec::new(),
                    group_id: None,
                    sender_key_capable: false,
                }
            }
            Err(err) => return Err(Self::bare_failure(message, SendError::Local(err))),
        };
        let settled = match self.settled_recipients(message).await {
            Ok(settled) => settled,
            Err(err) => return Err(Self::bare_failure(message, err)),
        };

        let mut slots = self.resolve_recipients(message, &thread, &settled).await;
        let active: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.status == DeliveryStatus::Pending)
            .map(|(index, _)| index)
            .collect();

        if active.is_empty() {
            let failed = slots.iter().any(|slot| slot.error.is_some());
            let nothing_left = slots.is_empty() && !settled.is_empty();
            if !failed && !nothing_left && message.kind.requires_recipients() {
                info!(thread = %message.thread_id, "no valid recipients");
                let report = match self.commit(message, &mut slots).await {
                    Ok(report) => report,
                    Err(err) => return Err(Self::bare_failure(message, err)),
                };
                return Err(SendFailure {
                    error: SendError::NoValidRecipients,
                    report,
                });
            }
        } else {
            self.deliver(message, &thread, &mut slots, active).await;
        }

        let report = match self.commit(message, &mut slots).await {
            Ok(report) => report,
            Err(err) => return Err(Self::bare_failure(message, err)),
        };
        match representative_error(&mut slots) {
            Some(error) => {
                warn!(thread = %message.thread_id, "send finished with error: {error}");
                Err(SendFailure { error, report })
            }
            None => Ok(report),
        }
    }

    fn bare_failure(message: &OutgoingMessage, error: SendError) -> SendFailure {
        SendFailure {
            error,
            report: SendReport {
                message_id: message.message_id,
                ..SendReport::default()
            },
        }
    }

    async fn settled_recipients(
        &self,
        message: &OutgoingMessage,
    ) -> Result<HashSet<String>, SendError> {
        let Some(message_id) = message.message_id else {
            return Ok(HashSet::new());
        };
        Ok(self
            .storage
            .recipient_states(message_id)
            .await?
            .into_iter()
            .filter(|row| row.status.is_settled())
            .map(|row| row.recipient_key)
            .collect())
    }

    async fn resolve_recipients(
        &self,
        message: &OutgoingMessage,
        thread: &ThreadSnapshot,
        settled: &HashSet<String>,
    ) -> Vec<RecipientAttempt> {
        let mut slots = Vec::new();
        let mut seen_keys = HashSet::new();
        let mut phone_numbers = Vec::new();
        for recipient in &message.recipients {
            let key = recipient.key();
            if settled.contains(&key) || !seen_keys.insert(key.clone()) {
                continue;
            }
            match recipient {
                RecipientRef::Service(service_id) => {
                    slots.push(RecipientAttempt::pending(key, Some(service_id.clone())))
                }
                RecipientRef::PhoneNumber(e164) => {
                    phone_numbers.push(e164.clone());
                    slots.push(RecipientAttempt::pending(key, None));
                }
            }
        }

        if !phone_numbers.is_empty() {
            match self.directory.look_up(&phone_numbers).await {
                Ok(found) => {
                    for (slot, e164) in phone_slots(&mut slots).zip(&phone_numbers) {
                        match found.get(e164) {
                            Some(service_id) => slot.service_id = Some(service_id.clone()),
                            None => slot.skip("phone number not registered"),
                        }
                    }
                }
                Err(err) => {
                    warn!("directory lookup failed: {err:#}");
                    for slot in phone_slots(&mut slots) {
                        slot.fail(SendError::Network(format!("directory lookup failed: {err:#}")));
                    }
                }
            }
        }

        let mut seen_services = HashSet::new();
        for slot in slots.iter_mut() {
            if slot.status != DeliveryStatus::Pending {
                continue;
            }
            let Some(service_id) = slot.service_id.clone() else {
                continue;
            };
            if !seen_services.insert(service_id.clone()) {
                slot.skip("duplicate recipient");
                continue;
            }
            if service_id == self.local.service_id {
                if !message.kind.targets_self() {
                    slot.skip("local account");
                    continue;
                }
                match self.fanout.target_devices(&service_id).await {
                    Ok(devices) if devices.is_empty() => slot.skip("no other local devices"),
                    Ok(_) => {}
                    Err(err) => slot.fail(err),
                }
                continue;
            }
            if !thread.is_member(&service_id) {
                slot.skip("not a member of the thread");
                continue;
            }
            match self.threads.is_blocked(&service_id).await {
                Ok(true) => slot.skip("blocked"),
                Ok(false) => {}
                Err(err) => slot.fail(SendError::Local(err)),
            }
        }
        slots
    }

    async fn deliver(
        &self,
        message: &OutgoingMessage,
        thread: &ThreadSnapshot,
        slots: &mut [RecipientAttempt],
        active: Vec<usize>,
    ) {
        let certificate = self.local.sender_certificate.clone();
        let sealed_params = certificate.map(|certificate| SealedSenderParams {
            certificate,
            content_hint: message.kind.content_hint(),
            group_id: thread.group_id.clone(),
        });

        let mut access = HashMap::new();
        for &index in &active {
            let Some(service_id) = slots[index].service_id.clone() else {
                continue;
            };
            let recipient_access = if service_id == self.local.service_id {
                SealedSenderAccess::Disabled
            } else {
                self.threads
                    .sealed_sender_access(&service_id)
                    .await
                    .unwrap_or_else(|err| {
                        debug!(%service_id, "no sealed sender access: {err:#}");
                        SealedSenderAccess::Disabled
                    })
            };
            access.insert(index, recipient_access);
        }

        let mut fanout_slots = active.clone();
        let group_eligible = self.sender_keys.enabled()
            && thread.sender_key_capable
            && !message.kind.is_plaintext_wrapper()
            && !message.kind.targets_self();
        if let (true, Some(params)) = (group_eligible, sealed_params.as_ref()) {
            fanout_slots = self
                .deliver_group(message, thread, params, slots, &active, &access)
                .await;
        }

        let timestamp = message.timestamp.timestamp_millis().max(0) as u64;
        let request = EncryptRequest {
            kind: message.kind,
            content: message.content.clone(),
        };
        let (tx, mut rx) = mpsc::channel(fanout_slots.len().max(1));
        let sends = fanout_slots.iter().filter_map(|&index| {
            let service_id = slots[index].service_id.clone()?;
            let sealed = match (sealed_params.as_ref(), access.get(&index).and_then(|a| a.access_key())) {
                (Some(params), Some(access_key)) => Some(SealedAccess {
                    params: params.clone(),
                    access_key,
                }),
                _ => None,
            };
            let send = PairwiseSend {
                recipient: service_id,
                request: request.clone(),
                sealed,
                timestamp,
                online: message.kind.is_online_only(),
                urgent: message.kind.is_urgent(),
            };
            let tx = tx.clone();
            Some(async move {
                let outcome = self.fanout.send(&send).await;
                let report = AttemptReport {
                    slot: index,
                    mode: outcome.mode,
                    result: outcome.result,
                    registered: outcome.registered,
                };
                if tx.send(report).await.is_err() {
                    warn!(slot = index, "attempt report dropped");
                }
            })
        });
        join_all(sends).await;
        drop(tx);

        while let Some(report) = rx.recv().await {
            let slot = &mut slots[report.slot];
            slot.record(report.mode, report.result);
            if report.registered.is_some() {
                slot.registered = report.registered;
            }
        }
    }

    /// Runs the sender-key path for the eligible part of `active` and returns the slots
    /// still needing a pairwise send.
    async fn deliver_group(
        &self,
        message: &OutgoingMessage,
        thread: &ThreadSnapshot,
        params: &SealedSenderParams,
        slots: &mut [RecipientAttempt],
        active: &[usize],
        access: &HashMap<usize, SealedSenderAccess>,
    ) -> Vec<usize> {
        let state = match self.sender_keys.prepare_state(thread).await {
            Ok(state) => state,
            Err(err) => {
                warn!(thread = %thread.thread_id, "sender key unavailable, sending pairwise: {err}");
                return active.to_vec();
            }
        };

        let recipients: Vec<(ServiceId, SealedSenderAccess)> = active
            .iter()
            .filter_map(|index| {
                let service_id = slots[*index].service_id.clone()?;
                Some((service_id, access.get(index).copied()?))
            })
            .collect();
        let candidates = match self.sender_keys.candidates(&recipients).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!("could not list sender key candidates: {err}");
                return active.to_vec();
            }
        };
        let partition = partition_devices(&ClassifyInput {
            sender_key_enabled: self.sender_keys.enabled(),
            thread,
            local_service_id: &self.local.service_id,
            state: Some(&state),
            key_expired: self.sender_keys.is_expired(&state),
            devices: candidates,
        });

        // A recipient is demoted whole when any of its devices must go pairwise.
        let demoted: BTreeSet<&ServiceId> =
            partition.fanout.iter().map(|device| &device.service_id).collect();
        let grouped: BTreeSet<&ServiceId> = partition
            .sender_key_ready
            .iter()
            .chain(&partition.needs_distribution)
            .map(|device| &device.service_id)
            .filter(|service_id| !demoted.contains(service_id))
            .collect();

        let mut members = Vec::new();
        let mut pairwise = Vec::new();
        let mut by_service = HashMap::new();
        for &index in active {
            let service_id = slots[index].service_id.clone();
            let access_key = access.get(&index).and_then(|a| a.access_key());
            match (service_id, access_key) {
                (Some(service_id), Some(access_key)) if grouped.contains(&service_id) => {
                    by_service.insert(service_id.clone(), index);
                    members.push(GroupMember {
                        service_id,
                        access_key,
                    });
                }
                _ => pairwise.push(index),
            }
        }
        if members.is_empty() {
            return active.to_vec();
        }
        debug!(
            thread = %thread.thread_id,
            group = members.len(),
            pairwise = pairwise.len(),
            "partitioned recipients"
        );

        let send = GroupSend {
            thread,
            distribution_id: state.distribution_id,
            content: &message.content,
            sealed: params,
            timestamp: message.timestamp.timestamp_millis().max(0) as u64,
            online: message.kind.is_online_only(),
            urgent: message.kind.is_urgent(),
        };
        match self.sender_keys.send_group(&send, members).await {
            Ok(outcome) => {
                for (service_id, result) in outcome.results {
                    if let Some(&index) = by_service.get(&service_id) {
                        slots[index].record(EncryptionMode::SenderKey, result);
                    }
                }
                pairwise.extend(
                    outcome
                        .fallback
                        .iter()
                        .filter_map(|service_id| by_service.get(service_id).copied()),
                );
            }
            Err(err) => {
                warn!(thread = %thread.thread_id, "group send failed, sending pairwise: {err}");
                pairwise.extend(by_service.values().copied());
            }
        }
        pairwise
    }

    async fn commit(
        &self,
        message: &OutgoingMessage,
        slots: &mut [RecipientAttempt],
    ) -> Result<SendReport, SendError> {
        let mut commit = DeliveryCommit {
            message_id: message.message_id,
            ..DeliveryCommit::default()
        };
        for slot in slots.iter() {
            commit.recipients.push(RecipientStateRow {
                recipient_key: slot.recipient_key.clone(),
                status: slot.status,
                mode: slot.mode,
                error: slot.detail.clone().filter(|_| slot.error.is_some()),
            });
            if let Some(mode) = slot.mode {
                commit.devices.extend(slot.devices.iter().map(|device| DeviceDeliveryRow {
                    device: device.clone(),
                    status: DeliveryStatus::Sent,
                    mode,
                }));
            }
            if let (Some(service_id), Some(registered)) = (&slot.service_id, slot.registered) {
                commit.registered.push((service_id.clone(), registered));
            }
        }

        let committed = self.storage.commit_delivery(&commit).await?;
        if !committed {
            info!(message_id = ?message.message_id, "message deleted mid-send; discarding results");
        }
        Ok(SendReport {
            message_id: message.message_id,
            recipients: slots
                .iter()
                .map(|slot| RecipientSummary {
                    recipient_key: slot.recipient_key.clone(),
                    service_id: slot.service_id.clone(),
                    status: slot.status,
                    mode: slot.mode,
                    devices: slot.devices.clone(),
                    error: slot.error.as_ref().map(classify),
                    detail: slot.detail.clone(),
                })
                .collect(),
            abandoned: !committed,
        })
    }
}

fn phone_slots(slots: &mut [RecipientAttempt]) -> impl Iterator<Item = &mut RecipientAttempt> {
    slots
        .iter_mut()
        .filter(|slot| slot.recipient_key.starts_with("e164:") && slot.service_id.is_none())
}

/// Most severe error across recipients. Per-recipient terminal errors only count when
/// nobody received the message, and skipped recipients never count.
fn representative_error(slots: &mut [RecipientAttempt]) -> Option<SendError> {
    let anyone_sent = slots
        .iter()
        .any(|slot| slot.status == DeliveryStatus::Sent);
    slots
        .iter_mut()
        .filter(|slot| slot.status != DeliveryStatus::Skipped)
        .filter_map(|slot| {
            let class = classify(slot.error.as_ref()?);
            if anyone_sent && matches!(class, ErrorClass::TerminalPerRecipient(_)) {
                return None;
            }
            Some((class.severity(), slot))
        })
        .max_by_key(|(severity, _)| *severity)
        .and_then(|(_, slot)| slot.error.take())
}

#[cfg(test)]
#[path = "tests/orchestrator_tests.rs"]
mod tests;
