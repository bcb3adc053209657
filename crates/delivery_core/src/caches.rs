use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use shared::domain::{RecipientDevice, ServiceId};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{clock::Clock, config::DeliveryConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InvalidSignatureEntry {
    first_seen: DateTime<Utc>,
    count: u32,
}

/// Short-lived memory of recent failures so a send does not hammer the relay for
/// devices or identities that just failed. Each entry lapses after one window.
pub struct NegativeCaches {
    clock: Arc<dyn Clock>,
    missing_ttl: chrono::Duration,
    untrusted_ttl: chrono::Duration,
    invalid_signature_ttl: chrono::Duration,
    missing_devices: Mutex<HashMap<RecipientDevice, DateTime<Utc>>>,
    untrusted_identities: Mutex<HashMap<ServiceId, DateTime<Utc>>>,
    invalid_signatures: Mutex<HashMap<ServiceId, InvalidSignatureEntry>>,
}

impl NegativeCaches {
    pub fn new(clock: Arc<dyn Clock>, config: &DeliveryConfig) -> Self {
        Self {
            clock,
            missing_ttl: config.missing_device_ttl(),
            untrusted_ttl: config.untrusted_identity_ttl(),
            invalid_signature_ttl: config.invalid_signature_ttl(),
            missing_devices: Mutex::default(),
            untrusted_identities: Mutex::default(),
            invalid_signatures: Mutex::default(),
        }
    }

    fn live(&self, marked_at: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        self.clock.now() - marked_at < ttl
    }

    pub async fn mark_missing(&self, device: &RecipientDevice) {
        debug!(%device, "caching missing device");
        let now = self.clock.now();
        let mut guard = self.missing_devices.lock().await;
        guard.retain(|_, marked_at| now - *marked_at < self.missing_ttl);
        guard.insert(device.clone(), now);
    }

    pub async fn is_missing(&self, device: &RecipientDevice) -> bool {
        let mut guard = self.missing_devices.lock().await;
        match guard.get(device) {
            Some(marked_at) if self.live(*marked_at, self.missing_ttl) => true,
            Some(_) => {
                guard.remove(device);
                false
            }
            None => false,
        }
    }

    pub async fn clear_missing(&self, device: &RecipientDevice) {
        self.missing_devices.lock().await.remove(device);
    }

    pub async fn mark_untrusted(&self, service_id: &ServiceId) {
        debug!(%service_id, "caching untrusted identity");
        let now = self.clock.now();
        let mut guard = self.untrusted_identities.lock().await;
        guard.retain(|_, marked_at| now - *marked_at < self.untrusted_ttl);
        guard.insert(service_id.clone(), now);
    }

    pub async fn is_untrusted(&self, service_id: &ServiceId) -> bool {
        let mut guard = self.untrusted_identities.lock().await;
        match guard.get(service_id) {
            Some(marked_at) if self.live(*marked_at, self.untrusted_ttl) => true,
            Some(_) => {
                guard.remove(service_id);
                false
            }
            None => false,
        }
    }

    pub async fn clear_untrusted(&self, service_id: &ServiceId) {
        self.untrusted_identities.lock().await.remove(service_id);
    }

    /// Counts a signature failure and reports whether it is now terminal.
    ///
    /// The first failure in a window is not terminal so one re-fetch is allowed; a
    /// repeat inside the same window is.
    pub async fn record_invalid_signature(&self, service_id: &ServiceId) -> bool {
        let now = self.clock.now();
        let mut guard = self.invalid_signatures.lock().await;
        guard.retain(|_, entry| now - entry.first_seen < self.invalid_signature_ttl);
        let entry = guard
            .entry(service_id.clone())
            .and_modify(|entry| {
                if now - entry.first_seen < self.invalid_signature_ttl {
                    entry.count += 1;
                } else {
                    *entry = InvalidSignatureEntry {
                        first_seen: now,
                        count: 1,
                    };
                }
            })
            .or_insert(InvalidSignatureEntry {
                first_seen: now,
                count: 1,
            });
        debug!(%service_id, count = entry.count, "recorded invalid prekey signature");
        entry.count > 1
    }

    /// True when a repeated signature failure inside the window should stop fetching.
    pub async fn invalid_signature_blocked(&self, service_id: &ServiceId) -> bool {
        let mut guard = self.invalid_signatures.lock().await;
        match guard.get(service_id) {
            Some(entry) if self.live(entry.first_seen, self.invalid_signature_ttl) => {
                entry.count > 1
            }
            Some(_) => {
                guard.remove(service_id);
                false
            }
            None => false,
        }
    }

    pub async fn clear_invalid_signature(&self, service_id: &ServiceId) {
        self.invalid_signatures.lock().await.remove(service_id);
    }

    #[cfg(test)]
    async fn entry_counts(&self) -> (usize, usize, usize) {
        (
            self.missing_devices.lock().await.len(),
            self.untrusted_identities.lock().await.len(),
            self.invalid_signatures.lock().await.len(),
        )
    }
}

#[cfg(test)]
#[path = "tests/caches_tests.rs"]
mod tests;
