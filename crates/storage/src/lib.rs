use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ratchet::{
    IdentityKey, IdentityKeyPair, ProtocolStore, SenderKeyRecord, SessionRecord, TrustLevel,
};
use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;
use uuid::Uuid;

use shared::domain::{
    DeliveryStatus, DeviceId, DistributionId, EncryptionMode, MessageId, RecipientDevice,
    RecipientRef, RegistrationId, ServiceId, ThreadId,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// Sender-key bookkeeping for one thread on the local device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderKeyState {
    pub thread_id: ThreadId,
    pub distribution_id: DistributionId,
    pub created_at: DateTime<Utc>,
    pub shared_with: BTreeSet<RecipientDevice>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub device_id: DeviceId,
    pub active: bool,
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientStateRow {
    pub recipient_key: String,
    pub status: DeliveryStatus,
    pub mode: Option<EncryptionMode>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDeliveryRow {
    pub device: RecipientDevice,
    pub status: DeliveryStatus,
    pub mode: EncryptionMode,
}

/// Everything one send attempt writes, committed in a single transaction.
#[derive(Debug, Clone, Default)]
pub struct DeliveryCommit {
    pub message_id: Option<MessageId>,
    pub recipients: Vec<RecipientStateRow>,
    pub devices: Vec<DeviceDeliveryRow>,
    pub registered: Vec<(ServiceId, bool)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliverySummary {
    pub pending: u32,
    pub sent: u32,
    pub skipped: u32,
    pub failed_terminal: u32,
    pub failed_retryable: u32,
}

impl DeliverySummary {
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.failed_retryable == 0
    }
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_database_dir(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every pooled connection to ":memory:" would open its own empty database.
        let max_connections = if is_memory_url(database_url) { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;
        Ok(Self { pool })
    }

    pub async fn initialize_local_account(
        &self,
        service_id: &ServiceId,
        device_id: DeviceId,
        registration_id: RegistrationId,
        identity: &IdentityKeyPair,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO local_account (id, service_id, device_id, registration_id, identity_blob)
             VALUES (1, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                service_id = excluded.service_id,
                device_id = excluded.device_id,
                registration_id = excluded.registration_id,
                identity_blob = excluded.identity_blob",
        )
        .bind(service_id.as_str())
        .bind(device_id.0 as i64)
        .bind(registration_id.0 as i64)
        .bind(identity.serialize()?)
        .execute(&self.pool)
        .await
        .context("failed to store local account")?;
        Ok(())
    }

    pub async fn list_sessions(&self, service_id: &ServiceId) -> Result<Vec<StoredSession>> {
        let rows = sqlx::query(
            "SELECT device_id, record IS NOT NULL, archived_record IS NOT NULL
             FROM sessions WHERE service_id = ? ORDER BY device_id",
        )
        .bind(service_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredSession {
                device_id: DeviceId(r.get::<i64, _>(0) as u32),
                active: r.get::<i64, _>(1) != 0,
                archived: r.get::<i64, _>(2) != 0,
            })
            .collect())
    }

    pub async fn identity_trust(&self, service_id: &ServiceId) -> Result<Option<TrustLevel>> {
        let row = sqlx::query("SELECT trust FROM identities WHERE service_id = ?")
            .bind(service_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let raw = r.get::<String, _>(0);
            TrustLevel::parse(&raw).ok_or_else(|| anyhow!("unknown trust level '{raw}'"))
        })
        .transpose()
    }

    /// Marks the stored identity as approved. Returns false when none is stored.
    pub async fn trust_identity(&self, service_id: &ServiceId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE identities SET trust = ?, updated_at = CURRENT_TIMESTAMP WHERE service_id = ?",
        )
        .bind(TrustLevel::Trusted.as_str())
        .bind(service_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `None` until the relay has told us anything about this account's devices.
    pub async fn recipient_devices(&self, service_id: &ServiceId) -> Result<Option<Vec<DeviceId>>> {
        let rows = sqlx::query(
            "SELECT device_id FROM recipient_devices WHERE service_id = ? ORDER BY device_id",
        )
        .bind(service_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            rows.into_iter()
                .map(|r| DeviceId(r.get::<i64, _>(0) as u32))
                .collect(),
        ))
    }

    pub async fn set_recipient_devices(
        &self,
        service_id: &ServiceId,
        devices: &[DeviceId],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM recipient_devices WHERE service_id = ?")
            .bind(service_id.as_str())
            .execute(&mut *tx)
            .await?;
        for device_id in devices {
            sqlx::query("INSERT OR IGNORE INTO recipient_devices (service_id, device_id) VALUES (?, ?)")
                .bind(service_id.as_str())
                .bind(device_id.0 as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Applies a device mismatch report: removed devices lose their session as well.
    pub async fn apply_device_changes(
        &self,
        service_id: &ServiceId,
        added: &[DeviceId],
        removed: &[DeviceId],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for device_id in added {
            sqlx::query("INSERT OR IGNORE INTO recipient_devices (service_id, device_id) VALUES (?, ?)")
                .bind(service_id.as_str())
                .bind(device_id.0 as i64)
                .execute(&mut *tx)
                .await?;
        }
        for device_id in removed {
            sqlx::query("DELETE FROM recipient_devices WHERE service_id = ? AND device_id = ?")
                .bind(service_id.as_str())
                .bind(device_id.0 as i64)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "UPDATE sessions SET archived_record = COALESCE(record, archived_record), record = NULL,
                    updated_at = CURRENT_TIMESTAMP
                 WHERE service_id = ? AND device_id = ?",
            )
            .bind(service_id.as_str())
            .bind(device_id.0 as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(%service_id, added = added.len(), removed = removed.len(), "applied device changes");
        Ok(())
    }

    pub async fn is_registered(&self, service_id: &ServiceId) -> Result<Option<bool>> {
        let row = sqlx::query("SELECT registered FROM recipients WHERE service_id = ?")
            .bind(service_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<bool, _>(0)))
    }

    pub async fn sender_key_state(&self, thread_id: &ThreadId) -> Result<Option<SenderKeyState>> {
        let row = sqlx::query(
            "SELECT distribution_id, created_at FROM sender_key_states WHERE thread_id = ?",
        )
        .bind(thread_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let distribution_id = parse_distribution_id(&row.get::<String, _>(0))?;
        let created_at = row.get::<DateTime<Utc>, _>(1);

        let shared = sqlx::query(
            "SELECT service_id, device_id FROM sender_key_shared WHERE distribution_id = ?",
        )
        .bind(distribution_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        let shared_with = shared
            .into_iter()
            .map(|r| {
                RecipientDevice::new(
                    ServiceId(r.get::<String, _>(0)),
                    DeviceId(r.get::<i64, _>(1) as u32),
                )
            })
            .collect();

        Ok(Some(SenderKeyState {
            thread_id: thread_id.clone(),
            distribution_id,
            created_at,
            shared_with,
        }))
    }

    /// Starts a fresh distribution for the thread; nobody holds the new key yet.
    pub async fn replace_sender_key_state(
        &self,
        thread_id: &ThreadId,
        distribution_id: DistributionId,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let previous: Option<String> =
            sqlx::query_scalar("SELECT distribution_id FROM sender_key_states WHERE thread_id = ?")
                .bind(thread_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        if let Some(previous) = previous {
            sqlx::query("DELETE FROM sender_key_shared WHERE distribution_id = ?")
                .bind(previous)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "INSERT INTO sender_key_states (thread_id, distribution_id, created_at) VALUES (?, ?, ?)
             ON CONFLICT(thread_id) DO UPDATE SET
                distribution_id = excluded.distribution_id,
                created_at = excluded.created_at",
        )
        .bind(thread_id.as_str())
        .bind(distribution_id.to_string())
        .bind(created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn mark_sender_key_shared(
        &self,
        distribution_id: DistributionId,
        devices: &[RecipientDevice],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for device in devices {
            sqlx::query(
                "INSERT OR IGNORE INTO sender_key_shared (distribution_id, service_id, device_id)
                 VALUES (?, ?, ?)",
            )
            .bind(distribution_id.to_string())
            .bind(device.service_id.as_str())
            .bind(device.device_id.0 as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_sender_key_shared(
        &self,
        distribution_id: DistributionId,
        devices: &[RecipientDevice],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for device in devices {
            sqlx::query(
                "DELETE FROM sender_key_shared
                 WHERE distribution_id = ? AND service_id = ? AND device_id = ?",
            )
            .bind(distribution_id.to_string())
            .bind(device.service_id.as_str())
            .bind(device.device_id.0 as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Records a message and a pending row per intended recipient.
    pub async fn insert_message(
        &self,
        thread_id: &ThreadId,
        sent_at: DateTime<Utc>,
        recipients: &[RecipientRef],
    ) -> Result<MessageId> {
        let mut tx = self.pool.begin().await?;
        let id: i64 =
            sqlx::query_scalar("INSERT INTO messages (thread_id, sent_at) VALUES (?, ?) RETURNING id")
                .bind(thread_id.as_str())
                .bind(sent_at)
                .fetch_one(&mut *tx)
                .await?;
        for recipient in recipients {
            sqlx::query(
                "INSERT OR IGNORE INTO message_recipient_states (message_id, recipient_key, status)
                 VALUES (?, ?, ?)",
            )
            .bind(id)
            .bind(recipient.key())
            .bind(DeliveryStatus::Pending.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(MessageId(id))
    }

    pub async fn message_exists(&self, message_id: MessageId) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM messages WHERE id = ?")
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn recipient_states(&self, message_id: MessageId) -> Result<Vec<RecipientStateRow>> {
        let rows = sqlx::query(
            "SELECT recipient_key, status, mode, error FROM message_recipient_states
             WHERE message_id = ? ORDER BY recipient_key",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                let status_raw = r.get::<String, _>(1);
                let status = DeliveryStatus::parse(&status_raw)
                    .ok_or_else(|| anyhow!("unknown delivery status '{status_raw}'"))?;
                let mode = r
                    .get::<Option<String>, _>(2)
                    .and_then(|raw| EncryptionMode::parse(&raw));
                Ok(RecipientStateRow {
                    recipient_key: r.get::<String, _>(0),
                    status,
                    mode,
                    error: r.get::<Option<String>, _>(3),
                })
            })
            .collect()
    }

    pub async fn device_deliveries(&self, message_id: MessageId) -> Result<Vec<DeviceDeliveryRow>> {
        let rows = sqlx::query(
            "SELECT service_id, device_id, status, mode FROM message_device_deliveries
             WHERE message_id = ? ORDER BY service_id, device_id",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                let status_raw = r.get::<String, _>(2);
                let mode_raw = r.get::<String, _>(3);
                Ok(DeviceDeliveryRow {
                    device: RecipientDevice::new(
                        ServiceId(r.get::<String, _>(0)),
                        DeviceId(r.get::<i64, _>(1) as u32),
                    ),
                    status: DeliveryStatus::parse(&status_raw)
                        .ok_or_else(|| anyhow!("unknown delivery status '{status_raw}'"))?,
                    mode: EncryptionMode::parse(&mode_raw)
                        .ok_or_else(|| anyhow!("unknown encryption mode '{mode_raw}'"))?,
                })
            })
            .collect()
    }

    pub async fn delivery_summary(&self, message_id: MessageId) -> Result<DeliverySummary> {
        let mut summary = DeliverySummary::default();
        for row in self.recipient_states(message_id).await? {
            match row.status {
                DeliveryStatus::Pending => summary.pending += 1,
                DeliveryStatus::Sent => summary.sent += 1,
                DeliveryStatus::Skipped => summary.skipped += 1,
                DeliveryStatus::FailedTerminal => summary.failed_terminal += 1,
                DeliveryStatus::FailedRetryable => summary.failed_retryable += 1,
            }
        }
        Ok(summary)
    }

    /// Writes one attempt's outcomes. Returns false, writing nothing, when the message
    /// row is gone (the message was deleted while the send was in flight).
    pub async fn commit_delivery(&self, commit: &DeliveryCommit) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        if let Some(message_id) = commit.message_id {
            let found: Option<i64> = sqlx::query_scalar("SELECT id FROM messages WHERE id = ?")
                .bind(message_id.0)
                .fetch_optional(&mut *tx)
                .await?;
            if found.is_none() {
                tx.rollback().await?;
                return Ok(false);
            }

            for row in &commit.recipients {
                sqlx::query(
                    "INSERT INTO message_recipient_states (message_id, recipient_key, status, mode, error)
                     VALUES (?, ?, ?, ?, ?)
                     ON CONFLICT(message_id, recipient_key) DO UPDATE SET
                        status = excluded.status,
                        mode = excluded.mode,
                        error = excluded.error,
                        updated_at = CURRENT_TIMESTAMP",
                )
                .bind(message_id.0)
                .bind(&row.recipient_key)
                .bind(row.status.as_str())
                .bind(row.mode.map(EncryptionMode::as_str))
                .bind(row.error.as_deref())
                .execute(&mut *tx)
                .await?;
            }

            for row in &commit.devices {
                sqlx::query(
                    "INSERT INTO message_device_deliveries (message_id, service_id, device_id, status, mode)
                     VALUES (?, ?, ?, ?, ?)
                     ON CONFLICT(message_id, service_id, device_id) DO UPDATE SET
                        status = excluded.status,
                        mode = excluded.mode,
                        updated_at = CURRENT_TIMESTAMP",
                )
                .bind(message_id.0)
                .bind(row.device.service_id.as_str())
                .bind(row.device.device_id.0 as i64)
                .bind(row.status.as_str())
                .bind(row.mode.as_str())
                .execute(&mut *tx)
                .await?;
            }
        }

        for (service_id, registered) in &commit.registered {
            sqlx::query(
                "INSERT INTO recipients (service_id, registered) VALUES (?, ?)
                 ON CONFLICT(service_id) DO UPDATE SET
                    registered = excluded.registered,
                    updated_at = CURRENT_TIMESTAMP",
            )
            .bind(service_id.as_str())
            .bind(*registered)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}

fn parse_distribution_id(raw: &str) -> Result<DistributionId> {
    Uuid::parse_str(raw)
        .map(DistributionId)
        .with_context(|| format!("invalid distribution id '{raw}'"))
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

/// Creates the directory a file-backed SQLite URL points into.
pub fn ensure_database_dir(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[async_trait]
impl ProtocolStore for Storage {
    async fn local_identity(&self) -> Result<IdentityKeyPair> {
        let blob: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT identity_blob FROM local_account WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        let blob = blob.ok_or_else(|| anyhow!("local account has not been initialized"))?;
        Ok(IdentityKeyPair::deserialize(&blob)?)
    }

    async fn local_registration_id(&self) -> Result<RegistrationId> {
        let id: Option<i64> =
            sqlx::query_scalar("SELECT registration_id FROM local_account WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        id.map(|id| RegistrationId(id as u32))
            .ok_or_else(|| anyhow!("local account has not been initialized"))
    }

    async fn load_session(&self, address: &RecipientDevice) -> Result<Option<SessionRecord>> {
        let blob: Option<Option<Vec<u8>>> = sqlx::query_scalar(
            "SELECT record FROM sessions WHERE service_id = ? AND device_id = ?",
        )
        .bind(address.service_id.as_str())
        .bind(address.device_id.0 as i64)
        .fetch_optional(&self.pool)
        .await?;
        match blob.flatten() {
            Some(blob) => Ok(Some(
                SessionRecord::deserialize(&blob)
                    .with_context(|| format!("corrupt session record for {address}"))?,
            )),
            None => Ok(None),
        }
    }

    async fn store_session(&self, address: &RecipientDevice, record: &SessionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (service_id, device_id, record) VALUES (?, ?, ?)
             ON CONFLICT(service_id, device_id) DO UPDATE SET
                record = excluded.record,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(address.service_id.as_str())
        .bind(address.device_id.0 as i64)
        .bind(record.serialize()?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn archive_session(&self, address: &RecipientDevice) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET archived_record = COALESCE(record, archived_record), record = NULL,
                updated_at = CURRENT_TIMESTAMP
             WHERE service_id = ? AND device_id = ?",
        )
        .bind(address.service_id.as_str())
        .bind(address.device_id.0 as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_identity(&self, service_id: &ServiceId) -> Result<Option<(IdentityKey, TrustLevel)>> {
        let row = sqlx::query("SELECT identity_key, trust FROM identities WHERE service_id = ?")
            .bind(service_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let identity = IdentityKey::from_bytes(&row.get::<Vec<u8>, _>(0))?;
        let raw = row.get::<String, _>(1);
        let trust = TrustLevel::parse(&raw).ok_or_else(|| anyhow!("unknown trust level '{raw}'"))?;
        Ok(Some((identity, trust)))
    }

    async fn save_identity(
        &self,
        service_id: &ServiceId,
        identity: &IdentityKey,
        trust: TrustLevel,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO identities (service_id, identity_key, trust) VALUES (?, ?, ?)
             ON CONFLICT(service_id) DO UPDATE SET
                identity_key = excluded.identity_key,
                trust = excluded.trust,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(service_id.as_str())
        .bind(identity.to_bytes().to_vec())
        .bind(trust.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_sender_key(
        &self,
        sender: &RecipientDevice,
        distribution_id: DistributionId,
    ) -> Result<Option<SenderKeyRecord>> {
        let blob: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT record FROM sender_keys
             WHERE sender_service_id = ? AND sender_device_id = ? AND distribution_id = ?",
        )
        .bind(sender.service_id.as_str())
        .bind(sender.device_id.0 as i64)
        .bind(distribution_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        blob.map(|blob| SenderKeyRecord::deserialize(&blob).map_err(anyhow::Error::from))
            .transpose()
    }

    async fn store_sender_key(
        &self,
        sender: &RecipientDevice,
        distribution_id: DistributionId,
        record: &SenderKeyRecord,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO sender_keys (sender_service_id, sender_device_id, distribution_id, record)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(sender_service_id, sender_device_id, distribution_id) DO UPDATE SET
                record = excluded.record",
        )
        .bind(sender.service_id.as_str())
        .bind(sender.device_id.0 as i64)
        .bind(distribution_id.to_string())
        .bind(record.serialize()?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
