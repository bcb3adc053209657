use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub relay_url: String,
    pub database_url: String,
    /// Kill switch for group (sender key) encryption.
    pub sender_key_enabled: bool,
    pub max_local_retries: u32,
    pub missing_device_ttl_secs: i64,
    pub untrusted_identity_ttl_secs: i64,
    pub invalid_signature_ttl_secs: i64,
    pub sender_key_max_age_secs: i64,
    pub max_group_ciphertext_bytes: usize,
    pub request_timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://127.0.0.1:8080".into(),
            database_url: "sqlite://./data/delivery.db".into(),
            sender_key_enabled: true,
            max_local_retries: 3,
            missing_device_ttl_secs: 60,
            untrusted_identity_ttl_secs: 5 * 60,
            invalid_signature_ttl_secs: 5 * 60,
            sender_key_max_age_secs: 90 * 24 * 60 * 60,
            max_group_ciphertext_bytes: 256 * 1024,
            request_timeout_secs: 30,
        }
    }
}

impl DeliveryConfig {
    pub fn missing_device_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.missing_device_ttl_secs)
    }

    pub fn untrusted_identity_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.untrusted_identity_ttl_secs)
    }

    pub fn invalid_signature_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.invalid_signature_ttl_secs)
    }

    pub fn sender_key_max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.sender_key_max_age_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Defaults, then the optional TOML file, then `DELIVERY__*` environment variables.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<DeliveryConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(
            config::File::from(path)
                .format(config::FileFormat::Toml)
                .required(false),
        );
    }
    let settings = builder
        .add_source(
            config::Environment::with_prefix("DELIVERY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("failed to assemble delivery settings")?;
    settings
        .try_deserialize::<DeliveryConfig>()
        .context("invalid delivery settings")
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    storage::ensure_database_dir(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return DeliveryConfig::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
