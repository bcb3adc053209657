use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{header::RETRY_AFTER, Client, Response};
use shared::{
    domain::{AccessKey, RecipientDevice},
    protocol::OutgoingMessageList,
};
use tracing::debug;
use url::Url;

use crate::{
    config::DeliveryConfig,
    transport::{DeviceMessageSubmission, MultiRecipientSubmission, Relay, RelayResponse},
};

pub const UNIDENTIFIED_ACCESS_KEY: &str = "Unidentified-Access-Key";
pub const MULTI_RECIPIENT_CONTENT_TYPE: &str = "application/vnd.delivery-multi-recipient";

/// [`Relay`] over the relay's REST interface.
pub struct HttpRelay {
    http: Client,
    base_url: String,
}

impl HttpRelay {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let parsed = Url::parse(base_url).with_context(|| format!("invalid relay url '{base_url}'"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!("relay url must start with http:// or https://"));
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build relay http client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    pub fn from_config(config: &DeliveryConfig) -> Result<Self> {
        Self::new(&config.relay_url, config.request_timeout())
    }

    fn access_header(access_key: &AccessKey) -> String {
        STANDARD.encode(access_key.0)
    }

    async fn into_relay_response(response: Response) -> Result<RelayResponse> {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response
            .bytes()
            .await
            .context("failed to read relay response body")?
            .to_vec();
        debug!(status, bytes = body.len(), "relay responded");
        Ok(RelayResponse {
            status,
            body,
            retry_after,
        })
    }
}

#[async_trait]
impl Relay for HttpRelay {
    async fn submit_device_messages(
        &self,
        submission: &DeviceMessageSubmission,
    ) -> Result<RelayResponse> {
        let body = OutgoingMessageList {
            messages: submission
                .messages
                .iter()
                .map(|message| message.to_outgoing())
                .collect(),
            timestamp: submission.timestamp,
            online: submission.online,
            urgent: submission.urgent,
        };
        let mut request = self
            .http
            .put(format!("{}/v1/messages/{}", self.base_url, submission.destination))
            .json(&body);
        if let Some(access_key) = &submission.access_key {
            request = request.header(UNIDENTIFIED_ACCESS_KEY, Self::access_header(access_key));
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("failed to submit messages for {}", submission.destination))?;
        Self::into_relay_response(response).await
    }

    async fn submit_multi_recipient_message(
        &self,
        submission: &MultiRecipientSubmission,
    ) -> Result<RelayResponse> {
        let response = self
            .http
            .put(format!("{}/v1/messages/multi_recipient", self.base_url))
            .query(&[
                ("ts", submission.timestamp.to_string()),
                ("online", submission.online.to_string()),
                ("urgent", submission.urgent.to_string()),
            ])
            .header(reqwest::header::CONTENT_TYPE, MULTI_RECIPIENT_CONTENT_TYPE)
            .header(
                UNIDENTIFIED_ACCESS_KEY,
                Self::access_header(&submission.access_key),
            )
            .body(submission.payload.clone())
            .send()
            .await
            .context("failed to submit multi-recipient message")?;
        Self::into_relay_response(response).await
    }

    async fn fetch_prekey_bundle(
        &self,
        device: &RecipientDevice,
        access_key: Option<&AccessKey>,
    ) -> Result<RelayResponse> {
        let mut request = self.http.get(format!(
            "{}/v2/keys/{}/{}",
            self.base_url, device.service_id, device.device_id
        ));
        if let Some(access_key) = access_key {
            request = request.header(UNIDENTIFIED_ACCESS_KEY, Self::access_header(access_key));
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("failed to fetch prekeys for {device}"))?;
        Self::into_relay_response(response).await
    }
}

#[cfg(test)]
#[path = "tests/http_relay_tests.rs"]
mod tests;
