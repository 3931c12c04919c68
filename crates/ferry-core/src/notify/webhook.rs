//! Generic JSON webhook delivery with retry and signature.
//!
//! Delivers run summaries (`extraction_complete`) and source alerts
//! (`extraction_error`) to an HTTP endpoint with:
//! - HMAC-SHA256 payload signing (`X-Ferry-Signature`) when a secret is set
//! - Exponential backoff retry on 5xx and network failures

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;

use super::{NotificationSink, RunSummary, SourceAlert};
use crate::config::WebhookConfig;
use crate::credentials::CredentialStore;
use crate::error::{FerryError, FerryResult};

const COMPLETE_EVENT: &str = "extraction_complete";
const ERROR_EVENT: &str = "extraction_error";
const MAX_RETRIES: usize = 3;

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    event: &'static str,
    timestamp: String,
    source: &'static str,
    data: &'a T,
}

/// Posts a signed JSON envelope to a URL.
pub struct WebhookSink {
    client: Client,
    url: String,
    secret: Option<SecretString>,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, secret: Option<SecretString>, timeout: Duration) -> FerryResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FerryError::internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            secret,
        })
    }

    pub fn from_config(config: &WebhookConfig, credentials: &CredentialStore) -> FerryResult<Self> {
        let secret = config
            .secret_env
            .as_deref()
            .map(|var| credentials.resolve(var))
            .transpose()?;
        Self::new(&config.url, secret, Duration::from_secs(config.timeout_secs))
    }

    fn render<T: Serialize>(&self, event: &'static str, data: &T) -> FerryResult<String> {
        let envelope = Envelope {
            event,
            timestamp: Utc::now().to_rfc3339(),
            source: "ferry",
            data,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    async fn deliver_once(
        &self,
        event: &'static str,
        payload: &str,
        signature: Option<&str>,
    ) -> FerryResult<()> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("X-Ferry-Event", event)
            .header("X-Ferry-Delivery", uuid::Uuid::new_v4().to_string());
        if let Some(signature) = signature {
            request = request.header("X-Ferry-Signature", signature);
        }

        let response = request.body(payload.to_string()).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(FerryError::from_http_status(status.as_u16(), "webhook", None))
        }
    }

    async fn deliver(&self, event: &'static str, payload: String) -> FerryResult<()> {
        let signature = self
            .secret
            .as_ref()
            .map(|secret| sign_payload(&payload, secret.expose_secret()));

        (|| self.deliver_once(event, &payload, signature.as_deref()))
            .retry(
                ExponentialBuilder::default()
                    .with_max_times(MAX_RETRIES)
                    .with_min_delay(Duration::from_millis(200))
                    .with_max_delay(Duration::from_secs(10)),
            )
            .when(FerryError::is_retryable)
            .notify(|err: &FerryError, dur: Duration| {
                tracing::warn!(
                    "webhook delivery to {} failed, retrying in {:?}: {}",
                    self.url,
                    dur,
                    err
                );
            })
            .await
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> String {
        "webhook".to_string()
    }

    async fn send(&self, summary: &RunSummary) -> FerryResult<()> {
        let payload = self.render(COMPLETE_EVENT, summary)?;
        self.deliver(COMPLETE_EVENT, payload).await
    }

    async fn send_alert(&self, alert: &SourceAlert) -> FerryResult<()> {
        let payload = self.render(ERROR_EVENT, alert)?;
        self.deliver(ERROR_EVENT, payload).await
    }
}

/// `sha256=<hex>` HMAC of `payload` under `secret`.
pub fn sign_payload(payload: &str, secret: &str) -> String {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(payload.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Check a signature produced by [`sign_payload`], for receivers.
pub fn verify_signature(payload: &str, secret: &str, signature: &str) -> bool {
    let expected = sign_payload(payload, secret);
    constant_time_eq(expected.as_bytes(), signature.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
