use crate::{
    domain::{
        AccessKey, ContentKind, DeliveryStatus, DeviceId, RecipientDevice, RecipientRef,
        RegistrationId, ServiceId,
    },
    error::ErrorCode,
    protocol::{MismatchedDevices, MultiRecipientSendResponse},
};

#[test]
fn registration_ids_outside_fourteen_bits_are_rejected_for_multi_recipient() {
    assert!(RegistrationId(1).is_valid_for_multi_recipient());
    assert!(RegistrationId(0x3FFF).is_valid_for_multi_recipient());
    assert!(!RegistrationId(0).is_valid_for_multi_recipient());
    assert!(!RegistrationId(0x4000).is_valid_for_multi_recipient());
}

#[test]
fn composite_access_key_is_xor_of_members() {
    let a = AccessKey([0b1010; 16]);
    let b = AccessKey([0b0110; 16]);
    assert_eq!(AccessKey::composite([&a, &b]), AccessKey([0b1100; 16]));
    assert_eq!(AccessKey::composite([&a, &a]), AccessKey::UNRESTRICTED);
}

#[test]
fn recipient_keys_distinguish_phone_numbers_from_service_ids() {
    let service = RecipientRef::Service(ServiceId::new("abc"));
    let phone = RecipientRef::PhoneNumber("+15550100".into());
    assert_eq!(service.key(), "abc");
    assert_eq!(phone.key(), "e164:+15550100");
    let device = RecipientDevice::new(ServiceId::new("abc"), DeviceId(2));
    assert_eq!(device.to_string(), "abc.2");
}

#[test]
fn receipts_do_not_require_recipients_but_text_does() {
    assert!(ContentKind::Text.requires_recipients());
    assert!(!ContentKind::ReadReceipt.requires_recipients());
    assert!(ContentKind::SyncTranscript.targets_self());
    assert!(!ContentKind::Text.targets_self());
    assert!(ContentKind::ResendRequest.is_plaintext_wrapper());
}

#[test]
fn delivery_status_round_trips_through_storage_strings() {
    for status in [
        DeliveryStatus::Pending,
        DeliveryStatus::Sent,
        DeliveryStatus::Skipped,
        DeliveryStatus::FailedTerminal,
        DeliveryStatus::FailedRetryable,
    ] {
        assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
    }
    assert!(DeliveryStatus::Skipped.is_settled());
    assert!(!DeliveryStatus::FailedRetryable.is_settled());
}

#[test]
fn status_codes_map_to_relay_error_codes() {
    assert_eq!(ErrorCode::from_status(200), None);
    assert_eq!(ErrorCode::from_status(409), Some(ErrorCode::MismatchedDevices));
    assert_eq!(ErrorCode::from_status(413), Some(ErrorCode::RateLimited));
    assert_eq!(ErrorCode::from_status(429), Some(ErrorCode::RateLimited));
    assert_eq!(ErrorCode::from_status(503), Some(ErrorCode::ServerError));
    assert_eq!(ErrorCode::from_status(428), Some(ErrorCode::ChallengeRequired));
    assert_eq!(ErrorCode::from_status(403), Some(ErrorCode::Unauthorized));
}

#[test]
fn relay_bodies_parse_camel_case_json() {
    let mismatched: MismatchedDevices =
        serde_json::from_str(r#"{"missingDevices":[2],"extraDevices":[5]}"#).expect("parse");
    assert_eq!(mismatched.missing_devices, vec![2]);
    assert_eq!(mismatched.extra_devices, vec![5]);

    let response: MultiRecipientSendResponse =
        serde_json::from_str(r#"{"uuids404":["gone"]}"#).expect("parse");
    assert_eq!(response.uuids404, vec![ServiceId::new("gone")]);

    let empty: MultiRecipientSendResponse = serde_json::from_str("{}").expect("parse");
    assert!(empty.uuids404.is_empty());
}
