//! Single place where relay responses and send errors get their meaning.

use serde::de::DeserializeOwned;
use shared::{
    domain::{DeviceId, RecipientDevice, ServiceId},
    error::ErrorCode,
    protocol::{MismatchedDevices, StaleDevices},
};

use crate::{error::SendError, transport::RelayResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    Network,
    SealedSenderAuth,
    ChallengePending,
    DeviceMismatch,
    StaleDevices,
    InvalidSignature,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientKind {
    Unregistered,
    MissingDevice,
    UntrustedIdentity,
    InvalidSignature,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalKind {
    RateLimited,
    OversizedCiphertext,
    GroupAuthInvalid,
    GroupUnknownAccount,
    NoValidRecipients,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    AppExpired,
    Deregistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable(RetryKind),
    TerminalPerRecipient(RecipientKind),
    TerminalGlobal(GlobalKind),
    Fatal(FatalKind),
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Retryable(_))
    }

    /// Ordering used to pick the error a whole send reports.
    pub fn severity(self) -> u8 {
        match self {
            ErrorClass::TerminalPerRecipient(_) => 0,
            ErrorClass::Retryable(_) => 1,
            ErrorClass::TerminalGlobal(_) => 2,
            ErrorClass::Fatal(_) => 3,
        }
    }
}

pub fn classify(error: &SendError) -> ErrorClass {
    match error {
        SendError::Network(_) => ErrorClass::Retryable(RetryKind::Network),
        SendError::SealedSenderAuth { .. } => ErrorClass::Retryable(RetryKind::SealedSenderAuth),
        SendError::ChallengePending { .. } => ErrorClass::Retryable(RetryKind::ChallengePending),
        SendError::MismatchedDevices { .. } => ErrorClass::Retryable(RetryKind::DeviceMismatch),
        SendError::StaleDevices { .. } => ErrorClass::Retryable(RetryKind::StaleDevices),
        SendError::InvalidSignature {
            terminal: false, ..
        } => ErrorClass::Retryable(RetryKind::InvalidSignature),
        SendError::InvalidSignature { terminal: true, .. } => {
            ErrorClass::TerminalPerRecipient(RecipientKind::InvalidSignature)
        }
        SendError::Local(_) | SendError::Internal(_) | SendError::NoSession(_) => {
            ErrorClass::Retryable(RetryKind::Local)
        }
        SendError::Unregistered(_) => ErrorClass::TerminalPerRecipient(RecipientKind::Unregistered),
        SendError::MissingDevice(_) => {
            ErrorClass::TerminalPerRecipient(RecipientKind::MissingDevice)
        }
        SendError::UntrustedIdentity(_) => {
            ErrorClass::TerminalPerRecipient(RecipientKind::UntrustedIdentity)
        }
        SendError::Blocked(_) => ErrorClass::TerminalPerRecipient(RecipientKind::Blocked),
        SendError::PrekeyRateLimited { .. } | SendError::RateLimited { .. } => {
            ErrorClass::TerminalGlobal(GlobalKind::RateLimited)
        }
        SendError::OversizedCiphertext { .. } => {
            ErrorClass::TerminalGlobal(GlobalKind::OversizedCiphertext)
        }
        SendError::GroupAuthInvalid => ErrorClass::TerminalGlobal(GlobalKind::GroupAuthInvalid),
        SendError::GroupUnknownAccount => {
            ErrorClass::TerminalGlobal(GlobalKind::GroupUnknownAccount)
        }
        SendError::NoValidRecipients => ErrorClass::TerminalGlobal(GlobalKind::NoValidRecipients),
        SendError::AppExpired => ErrorClass::Fatal(FatalKind::AppExpired),
        SendError::Deregistered => ErrorClass::Fatal(FatalKind::Deregistered),
    }
}

/// Which request produced a response; the same status means different things per path.
#[derive(Debug, Clone, Copy)]
pub enum RequestKind<'a> {
    Pairwise {
        service_id: &'a ServiceId,
        sealed: bool,
    },
    Group,
    PrekeyFetch {
        device: &'a RecipientDevice,
    },
}

fn parse_body<T: DeserializeOwned>(response: &RelayResponse) -> Result<T, SendError> {
    serde_json::from_slice(&response.body)
        .map_err(|err| SendError::Internal(format!("malformed relay body ({}): {err}", response.status)))
}

fn device_ids(raw: &[u32]) -> Vec<DeviceId> {
    raw.iter().copied().map(DeviceId).collect()
}

/// Maps a relay response to the error it represents; `None` for success.
///
/// Group 409/410 bodies name several accounts and are decoded by the group path itself;
/// here they surface as [`SendError::Internal`] so nothing silently succeeds.
pub fn error_for_response(kind: RequestKind<'_>, response: &RelayResponse) -> Option<SendError> {
    let code = ErrorCode::from_status(response.status)?;
    let retry_after = response.retry_after;
    let error = match (code, kind) {
        (ErrorCode::Unauthorized, RequestKind::Pairwise { service_id, sealed: true }) => {
            SendError::SealedSenderAuth {
                service_id: service_id.clone(),
            }
        }
        (ErrorCode::Unauthorized, RequestKind::Pairwise { sealed: false, .. }) => {
            SendError::Deregistered
        }
        (ErrorCode::Unauthorized, RequestKind::Group) => SendError::GroupAuthInvalid,
        (ErrorCode::Unauthorized, RequestKind::PrekeyFetch { device }) => {
            SendError::SealedSenderAuth {
                service_id: device.service_id.clone(),
            }
        }
        (ErrorCode::NotFound, RequestKind::Pairwise { service_id, .. }) => {
            SendError::Unregistered(service_id.clone())
        }
        (ErrorCode::NotFound, RequestKind::Group) => SendError::GroupUnknownAccount,
        (ErrorCode::NotFound, RequestKind::PrekeyFetch { device }) => {
            SendError::MissingDevice(device.clone())
        }
        (ErrorCode::MismatchedDevices, RequestKind::Pairwise { service_id, .. }) => {
            match parse_body::<MismatchedDevices>(response) {
                Ok(body) => SendError::MismatchedDevices {
                    service_id: service_id.clone(),
                    missing: device_ids(&body.missing_devices),
                    extra: device_ids(&body.extra_devices),
                },
                Err(err) => err,
            }
        }
        (ErrorCode::StaleDevices, RequestKind::Pairwise { service_id, .. }) => {
            match parse_body::<StaleDevices>(response) {
                Ok(body) => SendError::StaleDevices {
                    service_id: service_id.clone(),
                    stale: device_ids(&body.stale_devices),
                },
                Err(err) => err,
            }
        }
        (ErrorCode::MismatchedDevices | ErrorCode::StaleDevices, _) => SendError::Internal(
            format!("unexpected device reconciliation status {}", response.status),
        ),
        (ErrorCode::RateLimited, RequestKind::PrekeyFetch { .. }) => {
            SendError::PrekeyRateLimited { retry_after }
        }
        (ErrorCode::RateLimited, _) => SendError::RateLimited { retry_after },
        (ErrorCode::ChallengeRequired, _) => SendError::ChallengePending { retry_after },
        (ErrorCode::AppExpired, _) => SendError::AppExpired,
        (ErrorCode::ServerError, _) => {
            SendError::Network(format!("relay returned {}", response.status))
        }
        (ErrorCode::Unexpected, _) => {
            SendError::Network(format!("unexpected relay status {}", response.status))
        }
    };
    Some(error)
}

#[cfg(test)]
#[path = "tests/classify_tests.rs"]
mod tests;
