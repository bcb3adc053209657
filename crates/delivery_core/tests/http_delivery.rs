use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use delivery_core::{
    session_establisher::prekey_response,
    transport::{MissingChallengeResolver, MissingDirectory, ThreadSnapshot},
    DeliveryConfig, DeliveryDeps, DeliveryOrchestrator, HttpRelay, LocalAccount, OutgoingMessage,
    SystemClock, ThreadResolver,
};
use ratchet::{CiphertextKind, DeviceKeys, ReceivingSession, SenderCertificate};
use shared::{
    domain::{
        AccessKey, ContentKind, DeliveryStatus, DeviceId, EncryptionMode, RecipientDevice,
        RecipientRef, RegistrationId, SealedSenderAccess, ServiceId, ThreadId,
    },
    protocol::{EnvelopeType, MismatchedDevices, OutgoingMessageList},
};
use storage::Storage;
use tokio::{net::TcpListener, sync::Mutex};

/// One remote device behind a minimal relay.
struct RemoteDevice {
    keys: DeviceKeys,
    session: Option<ReceivingSession>,
    received: Vec<Vec<u8>>,
}

impl RemoteDevice {
    fn open(&mut self, kind: CiphertextKind, bytes: &[u8]) -> Vec<u8> {
        if let Some(plaintext) = self
            .session
            .as_mut()
            .and_then(|session| session.decrypt(kind, bytes).ok())
        {
            return plaintext;
        }
        let (session, plaintext) = self.keys.accept(bytes).expect("prekey message");
        self.session = Some(session);
        plaintext
    }
}

#[derive(Clone)]
struct RelayState {
    bob: Arc<Mutex<RemoteDevice>>,
}

async fn prekeys(
    State(state): State<RelayState>,
    Path((service_id, device_id)): Path<(String, u32)>,
) -> Response {
    if service_id != "bob" || device_id != 1 {
        return StatusCode::NOT_FOUND.into_response();
    }
    let bob = state.bob.lock().await;
    Json(prekey_response(&bob.keys.identity.public_key(), &[bob.keys.bundle()])).into_response()
}

async fn messages(
    State(state): State<RelayState>,
    Path(service_id): Path<String>,
    Json(list): Json<OutgoingMessageList>,
) -> Response {
    if service_id != "bob" {
        return StatusCode::NOT_FOUND.into_response();
    }
    let devices: Vec<u32> = list.messages.iter().map(|m| m.destination_device_id).collect();
    if devices != [1] {
        let body = MismatchedDevices {
            missing_devices: if devices.contains(&1) { Vec::new() } else { vec![1] },
            extra_devices: devices.into_iter().filter(|id| *id != 1).collect(),
        };
        return (StatusCode::CONFLICT, Json(body)).into_response();
    }

    let mut bob = state.bob.lock().await;
    for message in list.messages {
        let bytes = STANDARD.decode(&message.content).expect("base64 content");
        let (kind, inner) = match EnvelopeType::from_u8(message.message_type) {
            Some(EnvelopeType::UnidentifiedSender) => {
                let content = ratchet::sealed_sender_decrypt(&bob.keys.identity, &bytes)
                    .expect("sealed envelope");
                let kind = if content.message_type == CiphertextKind::PreKey.as_u8() {
                    CiphertextKind::PreKey
                } else {
                    CiphertextKind::Whisper
                };
                (kind, content.contents)
            }
            Some(EnvelopeType::PrekeyBundle) => (CiphertextKind::PreKey, bytes),
            _ => (CiphertextKind::Whisper, bytes),
        };
        let plaintext = bob.open(kind, &inner);
        bob.received.push(plaintext);
    }
    StatusCode::OK.into_response()
}

async fn spawn_relay() -> (String, RelayState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let mut keys = DeviceKeys::generate(RegistrationId(101), DeviceId(1));
    keys.add_one_time_prekey(1);
    let state = RelayState {
        bob: Arc::new(Mutex::new(RemoteDevice {
            keys,
            session: None,
            received: Vec::new(),
        })),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/v2/keys/:service_id/:device_id", get(prekeys))
        .route("/v1/messages/:service_id", put(messages))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

struct OneThread {
    snapshot: ThreadSnapshot,
    access: HashMap<ServiceId, SealedSenderAccess>,
}

#[async_trait]
impl ThreadResolver for OneThread {
    async fn thread(&self, thread_id: &ThreadId) -> Result<Option<ThreadSnapshot>> {
        Ok((thread_id == &self.snapshot.thread_id).then(|| self.snapshot.clone()))
    }

    async fn is_blocked(&self, _service_id: &ServiceId) -> Result<bool> {
        Ok(false)
    }

    async fn sealed_sender_access(&self, service_id: &ServiceId) -> Result<SealedSenderAccess> {
        Ok(self
            .access
            .get(service_id)
            .copied()
            .unwrap_or(SealedSenderAccess::Disabled))
    }
}

async fn orchestrator(relay_url: &str, storage: &Storage) -> DeliveryOrchestrator {
    let identity = ratchet::IdentityKeyPair::generate();
    let alice = ServiceId::new("alice");
    storage
        .initialize_local_account(&alice, DeviceId::PRIMARY, RegistrationId(5), &identity)
        .await
        .expect("local account");
    let config = DeliveryConfig {
        relay_url: relay_url.to_owned(),
        database_url: "sqlite::memory:".into(),
        ..DeliveryConfig::default()
    };
    let threads = OneThread {
        snapshot: ThreadSnapshot {
            thread_id: ThreadId::new("dm"),
            members: vec![alice.clone(), ServiceId::new("bob"), ServiceId::new("zed")],
            group_id: None,
            sender_key_capable: false,
        },
        access: HashMap::from([(
            ServiceId::new("bob"),
            SealedSenderAccess::Enabled(AccessKey([3; 16])),
        )]),
    };
    DeliveryOrchestrator::new(DeliveryDeps {
        storage: storage.clone(),
        relay: Arc::new(HttpRelay::from_config(&config).expect("relay")),
        threads: Arc::new(threads),
        directory: Arc::new(MissingDirectory),
        challenges: Arc::new(MissingChallengeResolver),
        clock: Arc::new(SystemClock),
        config,
        local: LocalAccount {
            service_id: alice.clone(),
            device_id: DeviceId::PRIMARY,
            sender_certificate: Some(SenderCertificate {
                sender: alice,
                sender_device: DeviceId::PRIMARY,
                sender_identity: identity.public_key(),
                expires_at_ms: Utc::now().timestamp_millis() + 60_000,
                signature: vec![0; 4],
            }),
        },
    })
}

fn text(content: &str, recipients: &[&str]) -> OutgoingMessage {
    OutgoingMessage {
        message_id: None,
        thread_id: ThreadId::new("dm"),
        timestamp: Utc::now(),
        kind: ContentKind::Text,
        content: content.as_bytes().to_vec(),
        recipients: recipients
            .iter()
            .map(|raw| RecipientRef::Service(ServiceId::new(*raw)))
            .collect(),
    }
}

#[tokio::test]
async fn messages_travel_over_http_and_decrypt_in_order() {
    let (relay_url, state) = spawn_relay().await;
    let storage = Storage::new("sqlite::memory:").await.expect("storage");
    let orchestrator = orchestrator(&relay_url, &storage).await;

    for content in ["first", "second", "third"] {
        let report = orchestrator
            .send(&text(content, &["bob"]))
            .await
            .expect("send over http");
        let bob = report.recipient("bob").expect("bob");
        assert_eq!(bob.status, DeliveryStatus::Sent);
        assert_eq!(bob.mode, Some(EncryptionMode::Pairwise));
        assert_eq!(
            bob.devices,
            vec![RecipientDevice::new(ServiceId::new("bob"), DeviceId(1))]
        );
    }

    let received = state.bob.lock().await.received.clone();
    assert_eq!(
        received,
        vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
    );
    assert_eq!(
        storage.is_registered(&ServiceId::new("bob")).await.expect("flag"),
        Some(true)
    );
}

#[tokio::test]
async fn accounts_the_relay_does_not_know_are_skipped() {
    let (relay_url, state) = spawn_relay().await;
    let storage = Storage::new("sqlite::memory:").await.expect("storage");
    let orchestrator = orchestrator(&relay_url, &storage).await;

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        orchestrator.send(&text("hello", &["bob", "zed"])),
    )
    .await
    .expect("finishes")
    .expect("send");
    assert_eq!(report.recipient("bob").expect("bob").status, DeliveryStatus::Sent);
    assert_eq!(report.recipient("zed").expect("zed").status, DeliveryStatus::Skipped);
    assert_eq!(
        storage.is_registered(&ServiceId::new("zed")).await.expect("flag"),
        Some(false)
    );
    assert_eq!(state.bob.lock().await.received.len(), 1);
}
