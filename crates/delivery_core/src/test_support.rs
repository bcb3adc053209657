//! Fakes shared by the unit tests. The relay plays every remote device, so anything it
//! accepts has actually been decrypted.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ratchet::{
    CiphertextKind, DeviceKeys, IdentityKeyPair, MultiRecipientMessage, ReceivingSession,
    SenderCertificate, SenderKeyDistributionMessage, SenderKeyReceiver,
};
use shared::{
    domain::{
        AccessKey, DeviceId, RecipientDevice, RegistrationId, SealedSenderAccess, ServiceId,
        ThreadId,
    },
    protocol::{
        AccountMismatchedDevices, ChallengeBody, EnvelopeType, MismatchedDevices,
        MultiRecipientSendResponse, PreKeyResponse,
    },
};
use storage::Storage;
use tokio::sync::Mutex;

use crate::{
    caches::NegativeCaches,
    clock::ManualClock,
    config::DeliveryConfig,
    encryptor::{DeviceMessage, DeviceMessageEncryptor, SessionLocks},
    fanout::FanoutSender,
    orchestrator::{DeliveryDeps, DeliveryOrchestrator},
    session_establisher::{prekey_response, PrekeyFetcher, SessionEstablisher},
    transport::{
        ChallengeResolver, DeviceMessageSubmission, Directory, MultiRecipientSubmission, Relay,
        RelayResponse, ThreadResolver, ThreadSnapshot,
    },
    LocalAccount,
};

pub(crate) const LOCAL: &str = "alice";

pub(crate) fn sid(raw: &str) -> ServiceId {
    ServiceId::new(raw)
}

pub(crate) fn device(raw: &str, device_id: u32) -> RecipientDevice {
    RecipientDevice::new(sid(raw), DeviceId(device_id))
}

pub(crate) fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub(crate) struct FakeDevice {
    pub keys: DeviceKeys,
    session: Option<ReceivingSession>,
    sender_keys: SenderKeyReceiver,
    pub received: Vec<Vec<u8>>,
}

impl FakeDevice {
    fn new(identity: &IdentityKeyPair, registration_id: u32, device_id: u32) -> Self {
        let mut keys = DeviceKeys::with_identity(
            identity.clone(),
            RegistrationId(registration_id),
            DeviceId(device_id),
        );
        keys.add_one_time_prekey(1);
        keys.add_one_time_prekey(2);
        Self {
            keys,
            session: None,
            sender_keys: SenderKeyReceiver::default(),
            received: Vec::new(),
        }
    }

    fn open(&mut self, kind: CiphertextKind, bytes: &[u8]) -> Vec<u8> {
        match kind {
            CiphertextKind::Plaintext => ratchet::unwrap_plaintext_content(bytes)
                .expect("plaintext marker")
                .to_vec(),
            CiphertextKind::Whisper => self
                .session
                .as_mut()
                .expect("whisper without a session")
                .decrypt(kind, bytes)
                .expect("whisper decrypts"),
            CiphertextKind::PreKey => {
                if let Some(plaintext) = self
                    .session
                    .as_mut()
                    .and_then(|session| session.decrypt(kind, bytes).ok())
                {
                    return plaintext;
                }
                let (session, plaintext) = self.keys.accept(bytes).expect("prekey message accepted");
                self.session = Some(session);
                plaintext
            }
            CiphertextKind::SenderKey => self
                .sender_keys
                .decrypt(bytes)
                .expect("sender key message decrypts"),
        }
    }

    fn deliver(&mut self, plaintext: Vec<u8>) {
        if let Ok(skdm) = SenderKeyDistributionMessage::deserialize(&plaintext) {
            self.sender_keys.process(&skdm);
        }
        self.received.push(plaintext);
    }
}

fn kind_from_u8(raw: u8) -> CiphertextKind {
    match raw {
        2 => CiphertextKind::Whisper,
        3 => CiphertextKind::PreKey,
        7 => CiphertextKind::SenderKey,
        _ => CiphertextKind::Plaintext,
    }
}

pub(crate) struct FakeAccount {
    pub identity: IdentityKeyPair,
    registration_id: u32,
    pub devices: BTreeMap<DeviceId, FakeDevice>,
}

#[derive(Default)]
pub(crate) struct RelayState {
    pub accounts: HashMap<ServiceId, FakeAccount>,
    device_script: HashMap<ServiceId, VecDeque<RelayResponse>>,
    group_script: VecDeque<RelayResponse>,
    prekey_script: HashMap<RecipientDevice, VecDeque<RelayResponse>>,
    pub device_submissions: Vec<DeviceMessageSubmission>,
    pub group_submissions: usize,
    pub prekey_fetches: Vec<(RecipientDevice, bool)>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeRelay {
    pub state: Arc<Mutex<RelayState>>,
}

impl FakeRelay {
    pub async fn add_account(&self, service_id: &str, devices: &[u32]) {
        self.add_account_with_registration(service_id, devices, 100).await;
    }

    /// Device `n` gets registration id `registration_base + n`.
    pub async fn add_account_with_registration(
        &self,
        service_id: &str,
        devices: &[u32],
        registration_base: u32,
    ) {
        let identity = IdentityKeyPair::generate();
        let devices = devices
            .iter()
            .map(|id| (DeviceId(*id), FakeDevice::new(&identity, registration_base + id, *id)))
            .collect();
        self.state.lock().await.accounts.insert(
            sid(service_id),
            FakeAccount {
                identity,
                registration_id: registration_base,
                devices,
            },
        );
    }

    pub async fn add_device(&self, service_id: &str, device_id: u32) {
        let mut state = self.state.lock().await;
        let account = state.accounts.get_mut(&sid(service_id)).expect("known account");
        let device = FakeDevice::new(
            &account.identity,
            account.registration_id + device_id,
            device_id,
        );
        account.devices.insert(DeviceId(device_id), device);
    }

    pub async fn remove_device(&self, service_id: &str, device_id: u32) {
        let mut state = self.state.lock().await;
        if let Some(account) = state.accounts.get_mut(&sid(service_id)) {
            account.devices.remove(&DeviceId(device_id));
        }
    }

    /// Reinstalls the account with a fresh identity, as after a reinstall.
    pub async fn rotate_identity(&self, service_id: &str) {
        let devices: Vec<u32> = {
            let state = self.state.lock().await;
            state.accounts[&sid(service_id)]
                .devices
                .keys()
                .map(|id| id.0)
                .collect()
        };
        self.add_account(service_id, &devices).await;
    }

    pub async fn prekeys_for(&self, device: &RecipientDevice) -> PreKeyResponse {
        let state = self.state.lock().await;
        let account = &state.accounts[&device.service_id];
        let keys = &account.devices[&device.device_id].keys;
        prekey_response(&account.identity.public_key(), &[keys.bundle()])
    }

    pub async fn script_device(&self, service_id: &str, response: RelayResponse) {
        self.state
            .lock()
            .await
            .device_script
            .entry(sid(service_id))
            .or_default()
            .push_back(response);
    }

    pub async fn script_group(&self, response: RelayResponse) {
        self.state.lock().await.group_script.push_back(response);
    }

    pub async fn script_prekeys(&self, device: &RecipientDevice, response: RelayResponse) {
        self.state
            .lock()
            .await
            .prekey_script
            .entry(device.clone())
            .or_default()
            .push_back(response);
    }

    pub async fn received(&self, device: &RecipientDevice) -> Vec<Vec<u8>> {
        let state = self.state.lock().await;
        state
            .accounts
            .get(&device.service_id)
            .and_then(|account| account.devices.get(&device.device_id))
            .map(|device| device.received.clone())
            .unwrap_or_default()
    }

    pub async fn device_submission_count(&self) -> usize {
        self.state.lock().await.device_submissions.len()
    }

    pub async fn group_submission_count(&self) -> usize {
        self.state.lock().await.group_submissions
    }

    pub async fn prekey_fetch_count(&self, device: &RecipientDevice) -> usize {
        self.state
            .lock()
            .await
            .prekey_fetches
            .iter()
            .filter(|(fetched, _)| fetched == device)
            .count()
    }

    pub async fn network_calls(&self) -> usize {
        let state = self.state.lock().await;
        state.device_submissions.len() + state.group_submissions + state.prekey_fetches.len()
    }
}

fn json_response(status: u16, body: &impl serde::Serialize) -> RelayResponse {
    RelayResponse::with_status(status, serde_json::to_vec(body).expect("serialize body"))
}

fn open_device_message(
    account: &FakeAccount,
    message: &DeviceMessage,
) -> (DeviceId, CiphertextKind, Vec<u8>) {
    let (kind, bytes) = match message.envelope_type {
        EnvelopeType::UnidentifiedSender => {
            let content = ratchet::sealed_sender_decrypt(&account.identity, &message.content)
                .expect("sealed envelope opens");
            (kind_from_u8(content.message_type), content.contents)
        }
        EnvelopeType::PrekeyBundle => (CiphertextKind::PreKey, message.content.clone()),
        EnvelopeType::Ciphertext => (CiphertextKind::Whisper, message.content.clone()),
        EnvelopeType::PlaintextContent => (CiphertextKind::Plaintext, message.content.clone()),
    };
    (message.destination_device_id, kind, bytes)
}

#[async_trait]
impl Relay for FakeRelay {
    async fn submit_device_messages(
        &self,
        submission: &DeviceMessageSubmission,
    ) -> Result<RelayResponse> {
        let mut state = self.state.lock().await;
        state.device_submissions.push(submission.clone());
        if let Some(response) = state
            .device_script
            .get_mut(&submission.destination)
            .and_then(VecDeque::pop_front)
        {
            return Ok(response);
        }
        let Some(account) = state.accounts.get_mut(&submission.destination) else {
            return Ok(RelayResponse::with_status(404, Vec::new()));
        };

        let sent: BTreeSet<u32> = submission
            .messages
            .iter()
            .map(|message| message.destination_device_id.0)
            .collect();
        let known: BTreeSet<u32> = account.devices.keys().map(|id| id.0).collect();
        let missing: Vec<u32> = known.difference(&sent).copied().collect();
        let extra: Vec<u32> = sent.difference(&known).copied().collect();
        if !missing.is_empty() || !extra.is_empty() {
            return Ok(json_response(
                409,
                &MismatchedDevices {
                    missing_devices: missing,
                    extra_devices: extra,
                },
            ));
        }

        for message in &submission.messages {
            let (device_id, kind, bytes) = open_device_message(account, message);
            let device = account.devices.get_mut(&device_id).expect("known device");
            let plaintext = device.open(kind, &bytes);
            device.deliver(plaintext);
        }
        Ok(RelayResponse::ok(Vec::new()))
    }

    async fn submit_multi_recipient_message(
        &self,
        submission: &MultiRecipientSubmission,
    ) -> Result<RelayResponse> {
        let mut state = self.state.lock().await;
        state.group_submissions += 1;
        if let Some(response) = state.group_script.pop_front() {
            return Ok(response);
        }

        let message = MultiRecipientMessage::parse(&submission.payload).expect("multi-recipient payload");
        let mut by_account: BTreeMap<ServiceId, BTreeSet<u32>> = BTreeMap::new();
        for device in message.recipient_devices() {
            by_account
                .entry(device.service_id)
                .or_default()
                .insert(device.device_id.0);
        }

        let mut unknown = Vec::new();
        let mut mismatched = Vec::new();
        for (service_id, sent) in &by_account {
            let Some(account) = state.accounts.get(service_id) else {
                unknown.push(service_id.clone());
                continue;
            };
            let known: BTreeSet<u32> = account.devices.keys().map(|id| id.0).collect();
            let missing: Vec<u32> = known.difference(sent).copied().collect();
            let extra: Vec<u32> = sent.difference(&known).copied().collect();
            if !missing.is_empty() || !extra.is_empty() {
                mismatched.push(AccountMismatchedDevices {
                    uuid: service_id.clone(),
                    devices: MismatchedDevices {
                        missing_devices: missing,
                        extra_devices: extra,
                    },
                });
            }
        }
        if !mismatched.is_empty() {
            return Ok(json_response(409, &mismatched));
        }

        for (service_id, sent) in &by_account {
            let Some(account) = state.accounts.get_mut(service_id) else {
                continue;
            };
            let content = ratchet::sealed_sender_multi_recipient_decrypt(
                &account.identity,
                service_id,
                &submission.payload,
            )
            .expect("multi-recipient copy opens");
            for device_id in sent {
                let device = account
                    .devices
                    .get_mut(&DeviceId(*device_id))
                    .expect("known device");
                let plaintext = device.open(kind_from_u8(content.message_type), &content.contents);
                device.deliver(plaintext);
            }
        }
        Ok(json_response(200, &MultiRecipientSendResponse { uuids404: unknown }))
    }

    async fn fetch_prekey_bundle(
        &self,
        device: &RecipientDevice,
        access_key: Option<&AccessKey>,
    ) -> Result<RelayResponse> {
        let mut state = self.state.lock().await;
        state.prekey_fetches.push((device.clone(), access_key.is_some()));
        if let Some(response) = state
            .prekey_script
            .get_mut(device)
            .and_then(VecDeque::pop_front)
        {
            return Ok(response);
        }
        let Some(account) = state.accounts.get(&device.service_id) else {
            return Ok(RelayResponse::with_status(404, Vec::new()));
        };
        let Some(fake) = account.devices.get(&device.device_id) else {
            return Ok(RelayResponse::with_status(404, Vec::new()));
        };
        Ok(json_response(
            200,
            &prekey_response(&account.identity.public_key(), &[fake.keys.bundle()]),
        ))
    }
}

pub(crate) const DEFAULT_ACCESS: SealedSenderAccess = SealedSenderAccess::Enabled(AccessKey([9; 16]));

#[derive(Default)]
pub(crate) struct FakeThreads {
    threads: Mutex<HashMap<ThreadId, ThreadSnapshot>>,
    blocked: Mutex<HashSet<ServiceId>>,
    access: Mutex<HashMap<ServiceId, SealedSenderAccess>>,
}

impl FakeThreads {
    pub async fn put_thread(&self, thread_id: &str, members: &[&str], group: bool) {
        let snapshot = ThreadSnapshot {
            thread_id: ThreadId::new(thread_id),
            members: members.iter().map(|m| sid(m)).collect(),
            group_id: group.then(|| thread_id.as_bytes().to_vec()),
            sender_key_capable: group,
        };
        self.threads
            .lock()
            .await
            .insert(snapshot.thread_id.clone(), snapshot);
    }

    pub async fn block(&self, service_id: &str) {
        self.blocked.lock().await.insert(sid(service_id));
    }

    pub async fn set_access(&self, service_id: &str, access: SealedSenderAccess) {
        self.access.lock().await.insert(sid(service_id), access);
    }
}

#[async_trait]
impl ThreadResolver for FakeThreads {
    async fn thread(&self, thread_id: &ThreadId) -> Result<Option<ThreadSnapshot>> {
        Ok(self.threads.lock().await.get(thread_id).cloned())
    }

    async fn is_blocked(&self, service_id: &ServiceId) -> Result<bool> {
        Ok(self.blocked.lock().await.contains(service_id))
    }

    async fn sealed_sender_access(&self, service_id: &ServiceId) -> Result<SealedSenderAccess> {
        Ok(self
            .access
            .lock()
            .await
            .get(service_id)
            .copied()
            .unwrap_or(DEFAULT_ACCESS))
    }
}

#[derive(Default)]
pub(crate) struct FakeDirectory {
    pub numbers: Mutex<HashMap<String, ServiceId>>,
    pub unavailable: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl Directory for FakeDirectory {
    async fn look_up(&self, phone_numbers: &[String]) -> Result<HashMap<String, ServiceId>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("directory offline"));
        }
        let numbers = self.numbers.lock().await;
        Ok(phone_numbers
            .iter()
            .filter_map(|e164| Some((e164.clone(), numbers.get(e164)?.clone())))
            .collect())
    }
}

#[derive(Default)]
pub(crate) struct FakeChallenges {
    pub solve: std::sync::atomic::AtomicBool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl ChallengeResolver for FakeChallenges {
    async fn try_to_handle_silently(
        &self,
        _challenge: &ChallengeBody,
        _retry_after: Option<Duration>,
    ) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.solve.load(Ordering::SeqCst))
    }
}

pub(crate) fn challenge_response() -> RelayResponse {
    json_response(
        428,
        &ChallengeBody {
            token: "token-1".into(),
            options: vec!["pushChallenge".into()],
        },
    )
}

/// The collaborators the orchestrator wires together, built the same way for tests
/// that drive one component directly.
pub(crate) struct Components {
    pub locks: Arc<SessionLocks>,
    pub caches: Arc<NegativeCaches>,
    pub establisher: Arc<SessionEstablisher>,
    pub encryptor: Arc<DeviceMessageEncryptor>,
    pub fanout: Arc<FanoutSender>,
}

pub(crate) struct Harness {
    pub storage: Storage,
    pub relay: FakeRelay,
    pub threads: Arc<FakeThreads>,
    pub directory: Arc<FakeDirectory>,
    pub challenges: Arc<FakeChallenges>,
    pub clock: Arc<ManualClock>,
    pub config: DeliveryConfig,
    pub local: LocalAccount,
    pub identity: IdentityKeyPair,
}

impl Harness {
    pub async fn new() -> Self {
        let storage = Storage::new("sqlite::memory:").await.expect("storage");
        let identity = IdentityKeyPair::generate();
        storage
            .initialize_local_account(&sid(LOCAL), DeviceId::PRIMARY, RegistrationId(77), &identity)
            .await
            .expect("local account");
        let local = LocalAccount {
            service_id: sid(LOCAL),
            device_id: DeviceId::PRIMARY,
            sender_certificate: Some(SenderCertificate {
                sender: sid(LOCAL),
                sender_device: DeviceId::PRIMARY,
                sender_identity: identity.public_key(),
                expires_at_ms: start_time().timestamp_millis() + 86_400_000,
                signature: vec![1, 2, 3],
            }),
        };
        Self {
            storage,
            relay: FakeRelay::default(),
            threads: Arc::new(FakeThreads::default()),
            directory: Arc::new(FakeDirectory::default()),
            challenges: Arc::new(FakeChallenges::default()),
            clock: Arc::new(ManualClock::new(start_time())),
            config: DeliveryConfig {
                database_url: "sqlite::memory:".into(),
                ..DeliveryConfig::default()
            },
            local,
            identity,
        }
    }

    pub fn deps(&self) -> DeliveryDeps {
        DeliveryDeps {
            storage: self.storage.clone(),
            relay: Arc::new(self.relay.clone()),
            threads: self.threads.clone(),
            directory: self.directory.clone(),
            challenges: self.challenges.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            local: self.local.clone(),
        }
    }

    pub fn orchestrator(&self) -> DeliveryOrchestrator {
        DeliveryOrchestrator::new(self.deps())
    }

    pub fn components(&self) -> Components {
        let relay: Arc<dyn Relay> = Arc::new(self.relay.clone());
        let locks = Arc::new(SessionLocks::default());
        let caches = Arc::new(NegativeCaches::new(self.clock.clone(), &self.config));
        let establisher = Arc::new(SessionEstablisher::new(
            self.storage.clone(),
            PrekeyFetcher::new(relay.clone(), self.challenges.clone()),
            caches.clone(),
            locks.clone(),
        ));
        let encryptor = Arc::new(DeviceMessageEncryptor::new(
            self.storage.clone(),
            locks.clone(),
            self.local.clone(),
            self.config.max_group_ciphertext_bytes,
        ));
        let fanout = Arc::new(FanoutSender::new(
            self.storage.clone(),
            relay,
            self.challenges.clone(),
            establisher.clone(),
            encryptor.clone(),
            caches.clone(),
            locks.clone(),
            self.local.clone(),
            self.config.max_local_retries,
        ));
        Components {
            locks,
            caches,
            establisher,
            encryptor,
            fanout,
        }
    }
}
