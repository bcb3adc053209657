//! Outgoing message delivery: sessions, encryption mode selection, relay submission and
//! per-recipient bookkeeping.

pub mod caches;
pub mod classify;
pub mod clock;
pub mod config;
pub mod encryptor;
pub mod error;
pub mod fanout;
pub mod http_relay;
pub mod orchestrator;
pub mod sender_key;
pub mod session_establisher;
pub mod transport;

#[cfg(test)]
mod test_support;

use ratchet::SenderCertificate;
use shared::domain::{DeviceId, RecipientDevice, ServiceId};

pub use caches::NegativeCaches;
pub use classify::{classify as classify_error, ErrorClass};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_settings, DeliveryConfig};
pub use encryptor::{DeviceMessage, DeviceMessageEncryptor, SessionLocks};
pub use error::SendError;
pub use http_relay::HttpRelay;
pub use orchestrator::{
    DeliveryDeps, DeliveryOrchestrator, OutgoingMessage, RecipientSummary, SendFailure, SendReport,
};
pub use sender_key::{SenderKeyCoordinator, SenderKeyPartition};
pub use session_establisher::{PrekeyFetcher, SessionEstablisher};
pub use transport::{ChallengeResolver, Directory, Relay, RelayResponse, ThreadResolver};

/// The account and device messages are sent from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAccount {
    pub service_id: ServiceId,
    pub device_id: DeviceId,
    /// Needed for sealed sender; without it every send is unsealed and pairwise.
    pub sender_certificate: Option<SenderCertificate>,
}

impl LocalAccount {
    pub fn address(&self) -> RecipientDevice {
        RecipientDevice::new(self.service_id.clone(), self.device_id)
    }
}
