use super::*;
use crate::test_support::{challenge_response, device, sid, Harness, DEFAULT_ACCESS};
use ratchet::SenderCertificate;
use shared::domain::{ContentHint, ContentKind};
use std::sync::atomic::Ordering;

fn text_send(recipient: &str, content: &str, sealed: Option<SealedAccess>) -> PairwiseSend {
    PairwiseSend {
        recipient: sid(recipient),
        request: EncryptRequest {
            kind: ContentKind::Text,
            content: content.as_bytes().to_vec(),
        },
        sealed,
        timestamp: 1_717_243_200_000,
        online: false,
        urgent: true,
    }
}

fn sealed(certificate: SenderCertificate) -> SealedAccess {
    SealedAccess {
        params: SealedSenderParams {
            certificate,
            content_hint: ContentHint::Resendable,
            group_id: None,
        },
        access_key: DEFAULT_ACCESS.access_key().expect("enabled"),
    }
}

#[tokio::test]
async fn device_mismatch_is_reconciled_and_retried() {
    let h = Harness::new().await;
    h.relay.add_account("bob", &[1, 2]).await;
    let parts = h.components();

    let outcome = parts.fanout.send(&text_send("bob", "hello", None)).await;
    let devices = outcome.result.expect("delivered");
    assert_eq!(devices, vec![device("bob", 1), device("bob", 2)]);
    assert_eq!(outcome.registered, Some(true));
    assert_eq!(outcome.mode, EncryptionMode::Pairwise);

    assert_eq!(
        h.storage.recipient_devices(&sid("bob")).await.expect("devices"),
        Some(vec![DeviceId(1), DeviceId(2)])
    );
    assert_eq!(h.relay.device_submission_count().await, 2);
    assert_eq!(h.relay.received(&device("bob", 1)).await, vec![b"hello".to_vec()]);
    assert_eq!(h.relay.received(&device("bob", 2)).await, vec![b"hello".to_vec()]);
}

#[tokio::test]
async fn removed_device_is_dropped_after_mismatch() {
    let h = Harness::new().await;
    h.relay.add_account("bob", &[1, 2]).await;
    h.storage
        .set_recipient_devices(&sid("bob"), &[DeviceId(1), DeviceId(2)])
        .await
        .expect("devices");
    let parts = h.components();
    parts
        .fanout
        .send(&text_send("bob", "one", None))
        .await
        .result
        .expect("first");

    h.relay.remove_device("bob", 2).await;
    let devices = parts
        .fanout
        .send(&text_send("bob", "two", None))
        .await
        .result
        .expect("second");
    assert_eq!(devices, vec![device("bob", 1)]);
    assert!(h
        .storage
        .load_session(&device("bob", 2))
        .await
        .expect("load")
        .is_none());
}

#[tokio::test]
async fn stale_sessions_are_archived_and_rebuilt() {
    let h = Harness::new().await;
    h.relay.add_account("bob", &[1]).await;
    let parts = h.components();
    parts
        .fanout
        .send(&text_send("bob", "one", None))
        .await
        .result
        .expect("first");

    h.relay
        .script_device(
            "bob",
            RelayResponse::with_status(410, r#"{"staleDevices":[1]}"#),
        )
        .await;
    parts
        .fanout
        .send(&text_send("bob", "two", None))
        .await
        .result
        .expect("rebuilt");

    assert_eq!(h.relay.prekey_fetch_count(&device("bob", 1)).await, 2);
    assert_eq!(
        h.relay.received(&device("bob", 1)).await,
        vec![b"one".to_vec(), b"two".to_vec()]
    );
}

#[tokio::test]
async fn rejected_access_key_retries_once_unsealed() {
    let h = Harness::new().await;
    h.relay.add_account("bob", &[1]).await;
    let parts = h.components();
    h.relay
        .script_device("bob", RelayResponse::with_status(401, Vec::new()))
        .await;

    let certificate = h.local.sender_certificate.clone().expect("certificate");
    parts
        .fanout
        .send(&text_send("bob", "hi", Some(sealed(certificate))))
        .await
        .result
        .expect("unsealed retry");

    let state = h.relay.state.lock().await;
    let keys: Vec<bool> = state
        .device_submissions
        .iter()
        .map(|submission| submission.access_key.is_some())
        .collect();
    assert_eq!(keys, vec![true, false]);
}

#[tokio::test]
async fn unknown_account_is_unregistered() {
    let h = Harness::new().await;
    h.relay.add_account("bob", &[1]).await;
    let parts = h.components();
    parts
        .fanout
        .send(&text_send("bob", "one", None))
        .await
        .result
        .expect("first");

    h.relay
        .script_device("bob", RelayResponse::with_status(404, Vec::new()))
        .await;
    let outcome = parts.fanout.send(&text_send("bob", "two", None)).await;
    assert!(matches!(outcome.result, Err(SendError::Unregistered(_))));
    assert_eq!(outcome.registered, Some(false));

    let ghost = parts.fanout.send(&text_send("zed", "hi", None)).await;
    assert!(matches!(ghost.result, Err(SendError::Unregistered(_))));
    assert_eq!(h.relay.device_submission_count().await, 2);
}

#[tokio::test]
async fn network_failures_use_the_local_retry_budget() {
    let h = Harness::new().await;
    h.relay.add_account("bob", &[1]).await;
    let parts = h.components();
    for _ in 0..3 {
        h.relay
            .script_device("bob", RelayResponse::with_status(503, Vec::new()))
            .await;
    }

    let outcome = parts.fanout.send(&text_send("bob", "hi", None)).await;
    assert!(matches!(outcome.result, Err(SendError::Network(_))));
    assert_eq!(outcome.registered, None);
    assert_eq!(h.relay.device_submission_count().await, 3);
}

#[tokio::test]
async fn solved_challenge_resubmits() {
    let h = Harness::new().await;
    h.relay.add_account("bob", &[1]).await;
    h.challenges.solve.store(true, Ordering::SeqCst);
    let parts = h.components();
    h.relay.script_device("bob", challenge_response()).await;

    parts
        .fanout
        .send(&text_send("bob", "hi", None))
        .await
        .result
        .expect("resubmitted");
    assert_eq!(h.challenges.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.relay.received(&device("bob", 1)).await, vec![b"hi".to_vec()]);
}

#[tokio::test]
async fn unsolved_challenge_stops_the_send() {
    let h = Harness::new().await;
    h.relay.add_account("bob", &[1]).await;
    let parts = h.components();
    h.relay.script_device("bob", challenge_response()).await;

    let outcome = parts.fanout.send(&text_send("bob", "hi", None)).await;
    assert!(matches!(outcome.result, Err(SendError::ChallengePending { .. })));
    assert_eq!(h.relay.device_submission_count().await, 1);
}

#[tokio::test]
async fn local_device_is_never_a_target() {
    let h = Harness::new().await;
    h.storage
        .set_recipient_devices(&h.local.service_id, &[DeviceId(1), DeviceId(2)])
        .await
        .expect("devices");
    let parts = h.components();
    assert_eq!(
        parts.fanout.target_devices(&h.local.service_id).await.expect("targets"),
        vec![DeviceId(2)]
    );
    assert_eq!(
        parts.fanout.target_devices(&sid("carol")).await.expect("targets"),
        vec![DeviceId::PRIMARY]
    );
}
