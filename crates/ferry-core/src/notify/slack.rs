//! Slack incoming-webhook sink.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

use super::{NotificationSink, RunSummary, SourceAlert};
use crate::config::SlackConfig;
use crate::credentials::CredentialStore;
use crate::error::{FerryError, FerryResult};

/// Posts a short text summary. The webhook URL is itself a credential.
pub struct SlackSink {
    client: Client,
    webhook_url: SecretString,
}

impl SlackSink {
    pub fn new(webhook_url: SecretString) -> FerryResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| FerryError::internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            webhook_url,
        })
    }

    pub fn from_config(config: &SlackConfig, credentials: &CredentialStore) -> FerryResult<Self> {
        Self::new(credentials.resolve(&config.webhook_url_env)?)
    }
}

/// Message text: headline plus one line per source.
pub(crate) fn render_text(summary: &RunSummary) -> String {
    let mut text = summary.headline();
    for source in &summary.sources {
        text.push_str(&format!(
            "\n• {} ({}): {}, {} messages, {} media, {} errors",
            source.account,
            source.kind,
            if source.success { "ok" } else { "failed" },
            source.message_count,
            source.media_count,
            source.error_count
        ));
    }
    text
}

/// Alert text: headline plus one line per error.
pub(crate) fn render_alert(alert: &SourceAlert) -> String {
    let mut text = alert.headline();
    for error in &alert.errors {
        text.push_str(&format!("\n• [{}] {}", error.kind, error.message));
    }
    text
}

impl SlackSink {
    async fn post(&self, text: String) -> FerryResult<()> {
        let body = serde_json::json!({ "text": text });
        let response = self
            .client
            .post(self.webhook_url.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| FerryError::network(format!("slack post failed: {}", e.without_url())))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(FerryError::from_http_status(status.as_u16(), "slack", None))
        }
    }
}

#[async_trait]
impl NotificationSink for SlackSink {
    fn name(&self) -> String {
        "slack".to_string()
    }

    async fn send(&self, summary: &RunSummary) -> FerryResult<()> {
        self.post(render_text(summary)).await
    }

    async fn send_alert(&self, alert: &SourceAlert) -> FerryResult<()> {
        self.post(render_alert(alert)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::SourceSummary;
    use crate::types::SourceKind;
    use chrono::Utc;

    #[test]
    fn test_render_text_lists_sources() {
        let summary = RunSummary {
            run_id: "r1".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            success: false,
            total_messages: 0,
            total_media: 0,
            sources: vec![SourceSummary {
                account: "support".to_string(),
                kind: SourceKind::WhatsApp,
                success: false,
                message_count: 0,
                media_count: 0,
                duplicate_count: 0,
                error_count: 1,
                execution_time_ms: 40,
            }],
        };
        let text = render_text(&summary);
        assert!(text.starts_with("ferry run FAILED"));
        assert!(text.contains("support (whatsapp): failed"));
    }

    #[test]
    fn test_render_alert_lists_errors() {
        let alert = SourceAlert {
            run_id: "r1".to_string(),
            account: "support".to_string(),
            kind: SourceKind::WhatsApp,
            success: false,
            message_count: 0,
            execution_time_ms: 40,
            errors: vec![(&FerryError::authentication("token rejected")).into()],
        };
        let text = render_alert(&alert);
        assert!(text.starts_with("ferry error in support (whatsapp): 1 error(s)"));
        assert!(text.contains("[authentication]"));
    }
}
