use super::*;
use chrono::TimeZone;
use ratchet::DeviceKeys;

async fn storage_with_account() -> Storage {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .initialize_local_account(
            &ServiceId::new("alice"),
            DeviceId(1),
            RegistrationId(42),
            &IdentityKeyPair::generate(),
        )
        .await
        .expect("account");
    storage
}

fn bob(device: u32) -> RecipientDevice {
    RecipientDevice::new(ServiceId::new("bob"), DeviceId(device))
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("delivery.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn local_registration_id_is_stored() {
    let storage = storage_with_account().await;
    assert_eq!(
        storage.local_registration_id().await.expect("reg id"),
        RegistrationId(42)
    );
}

#[tokio::test]
async fn archived_session_is_not_loaded_but_is_kept() {
    let storage = storage_with_account().await;
    let remote = DeviceKeys::generate(RegistrationId(7), DeviceId(1));
    ratchet::process_prekey_bundle(&storage, &bob(1), &remote.bundle())
        .await
        .expect("session");
    assert!(storage.load_session(&bob(1)).await.expect("load").is_some());

    storage.archive_session(&bob(1)).await.expect("archive");
    assert!(storage.load_session(&bob(1)).await.expect("load").is_none());
    let sessions = storage
        .list_sessions(&ServiceId::new("bob"))
        .await
        .expect("list");
    assert_eq!(
        sessions,
        vec![StoredSession {
            device_id: DeviceId(1),
            active: false,
            archived: true,
        }]
    );
}

#[tokio::test]
async fn pending_identity_can_be_approved() {
    let storage = storage_with_account().await;
    let bob_id = ServiceId::new("bob");
    let key = DeviceKeys::generate(RegistrationId(7), DeviceId(1)).identity_key();
    storage
        .save_identity(&bob_id, &key, TrustLevel::Pending)
        .await
        .expect("save");
    assert_eq!(
        storage.identity_trust(&bob_id).await.expect("trust"),
        Some(TrustLevel::Pending)
    );
    assert!(storage.trust_identity(&bob_id).await.expect("approve"));
    assert_eq!(
        storage.load_identity(&bob_id).await.expect("load"),
        Some((key, TrustLevel::Trusted))
    );
    assert!(!storage
        .trust_identity(&ServiceId::new("nobody"))
        .await
        .expect("approve missing"));
}

#[tokio::test]
async fn device_changes_add_and_remove_devices() {
    let storage = storage_with_account().await;
    let bob_id = ServiceId::new("bob");
    assert_eq!(storage.recipient_devices(&bob_id).await.expect("devices"), None);

    storage
        .set_recipient_devices(&bob_id, &[DeviceId(1), DeviceId(2)])
        .await
        .expect("set");
    storage
        .apply_device_changes(&bob_id, &[DeviceId(3)], &[DeviceId(2)])
        .await
        .expect("apply");
    assert_eq!(
        storage.recipient_devices(&bob_id).await.expect("devices"),
        Some(vec![DeviceId(1), DeviceId(3)])
    );
}

#[tokio::test]
async fn replacing_sender_key_state_forgets_previous_holders() {
    let storage = storage_with_account().await;
    let thread = ThreadId::new("group-1");
    let created_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let first = DistributionId::new_random();

    storage
        .replace_sender_key_state(&thread, first, created_at)
        .await
        .expect("state");
    storage
        .mark_sender_key_shared(first, &[bob(1), bob(2)])
        .await
        .expect("shared");
    storage
        .remove_sender_key_shared(first, &[bob(2)])
        .await
        .expect("unshare");
    let state = storage
        .sender_key_state(&thread)
        .await
        .expect("load")
        .expect("state");
    assert_eq!(state.distribution_id, first);
    assert_eq!(state.created_at, created_at);
    assert_eq!(state.shared_with, BTreeSet::from([bob(1)]));

    let second = DistributionId::new_random();
    storage
        .replace_sender_key_state(&thread, second, created_at)
        .await
        .expect("rotate");
    let state = storage
        .sender_key_state(&thread)
        .await
        .expect("load")
        .expect("state");
    assert_eq!(state.distribution_id, second);
    assert!(state.shared_with.is_empty());
}

#[tokio::test]
async fn commit_delivery_updates_states_and_summary() {
    let storage = storage_with_account().await;
    let message_id = storage
        .insert_message(
            &ThreadId::new("t"),
            Utc::now(),
            &[
                RecipientRef::Service(ServiceId::new("bob")),
                RecipientRef::Service(ServiceId::new("carol")),
            ],
        )
        .await
        .expect("message");
    assert_eq!(
        storage.delivery_summary(message_id).await.expect("summary").pending,
        2
    );

    let committed = storage
        .commit_delivery(&DeliveryCommit {
            message_id: Some(message_id),
            recipients: vec![
                RecipientStateRow {
                    recipient_key: "bob".into(),
                    status: DeliveryStatus::Sent,
                    mode: Some(EncryptionMode::Pairwise),
                    error: None,
                },
                RecipientStateRow {
                    recipient_key: "carol".into(),
                    status: DeliveryStatus::FailedRetryable,
                    mode: Some(EncryptionMode::Pairwise),
                    error: Some("network".into()),
                },
            ],
            devices: vec![DeviceDeliveryRow {
                device: bob(1),
                status: DeliveryStatus::Sent,
                mode: EncryptionMode::Pairwise,
            }],
            registered: vec![(ServiceId::new("bob"), true)],
        })
        .await
        .expect("commit");
    assert!(committed);

    let summary = storage.delivery_summary(message_id).await.expect("summary");
    assert_eq!(summary.sent, 1);
    assert_eq!(summary.failed_retryable, 1);
    assert!(!summary.is_settled());
    assert_eq!(
        storage.device_deliveries(message_id).await.expect("devices").len(),
        1
    );
    assert_eq!(
        storage
            .is_registered(&ServiceId::new("bob"))
            .await
            .expect("registered"),
        Some(true)
    );
}

#[tokio::test]
async fn commit_for_deleted_message_writes_nothing() {
    let storage = storage_with_account().await;
    let message_id = storage
        .insert_message(&ThreadId::new("t"), Utc::now(), &[])
        .await
        .expect("message");
    storage.delete_message(message_id).await.expect("delete");

    let committed = storage
        .commit_delivery(&DeliveryCommit {
            message_id: Some(message_id),
            registered: vec![(ServiceId::new("bob"), false)],
            ..DeliveryCommit::default()
        })
        .await
        .expect("commit");
    assert!(!committed);
    assert_eq!(
        storage
            .is_registered(&ServiceId::new("bob"))
            .await
            .expect("registered"),
        None
    );
}
