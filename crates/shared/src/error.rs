use serde::{Deserialize, Serialize};

/// Relay status codes the delivery core distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    NotFound,
    MismatchedDevices,
    StaleDevices,
    RateLimited,
    ChallengeRequired,
    AppExpired,
    ServerError,
    Unexpected,
}

impl ErrorCode {
    /// `None` for 2xx.
    pub fn from_status(status: u16) -> Option<Self> {
        let code = match status {
            200..=299 => return None,
            401 | 403 => ErrorCode::Unauthorized,
            404 => ErrorCode::NotFound,
            409 => ErrorCode::MismatchedDevices,
            410 => ErrorCode::StaleDevices,
            413 | 429 => ErrorCode::RateLimited,
            428 => ErrorCode::ChallengeRequired,
            499 => ErrorCode::AppExpired,
            500..=599 => ErrorCode::ServerError,
            _ => ErrorCode::Unexpected,
        };
        Some(code)
    }
}
