//! SMTP email sink.
//!
//! Plain-text mails over STARTTLS (or implicit TLS on port 465), sent with
//! lettre's tokio transport.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::ExposeSecret;
use std::fmt::Write;
use std::time::Duration;

use super::{NotificationSink, RunSummary, SourceAlert};
use crate::config::EmailNotificationConfig;
use crate::credentials::CredentialStore;
use crate::error::{FerryError, FerryResult};

const IMPLICIT_TLS_PORT: u16 = 465;

/// Mails run summaries and source alerts to a fixed recipient list.
pub struct EmailSink {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
    on_success: bool,
    on_error: bool,
}

impl EmailSink {
    pub fn from_config(
        config: &EmailNotificationConfig,
        credentials: &CredentialStore,
    ) -> FerryResult<Self> {
        let username = credentials.resolve(&config.username_env)?;
        let password = credentials.resolve(&config.password_env)?;

        let builder = if config.smtp_port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_server)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_server)
        };
        let builder = builder.map_err(|e| {
            FerryError::Configuration(format!(
                "smtp server '{}' is unusable: {}",
                config.smtp_server, e
            ))
        })?;
        let transport = builder
            .port(config.smtp_port)
            .credentials(Credentials::new(
                username.expose_secret().clone(),
                password.expose_secret().clone(),
            ))
            .timeout(Some(Duration::from_secs(config.timeout_secs)))
            .build();

        let to = config
            .to
            .iter()
            .map(|addr| mailbox("notifications.email.to", addr))
            .collect::<FerryResult<Vec<_>>>()?;
        Ok(Self {
            transport,
            from: mailbox("notifications.email.from", &config.from)?,
            to,
            on_success: config.on_success,
            on_error: config.on_error,
        })
    }

    fn compose(&self, subject: String, body: String) -> FerryResult<Message> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN);
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        builder
            .body(body)
            .map_err(|e| FerryError::internal(format!("cannot build notification mail: {}", e)))
    }

    async fn deliver(&self, message: Message) -> FerryResult<()> {
        self.transport
            .send(message)
            .await
            .map_err(|e| FerryError::network(format!("smtp delivery failed: {}", e)))?;
        tracing::debug!(recipients = self.to.len(), "notification mail sent");
        Ok(())
    }
}

fn mailbox(field: &str, addr: &str) -> FerryResult<Mailbox> {
    addr.parse()
        .map_err(|e| FerryError::Configuration(format!("{}: '{}' is not a mailbox: {}", field, addr, e)))
}

/// Subject and body of a run summary mail.
pub(crate) fn render_summary(summary: &RunSummary) -> (String, String) {
    let failed = summary.sources.iter().filter(|s| !s.success).count();
    let subject = if failed == 0 {
        "ferry extraction completed".to_string()
    } else {
        format!("ferry extraction completed with {} failed source(s)", failed)
    };

    let mut body = String::new();
    let _ = writeln!(body, "{}", summary.headline());
    let _ = writeln!(body, "run {}", summary.run_id);
    let _ = writeln!(body);
    for source in &summary.sources {
        let _ = writeln!(
            body,
            "{} ({}): {}, {} messages, {} media, {} errors",
            source.account,
            source.kind,
            if source.success { "ok" } else { "FAILED" },
            source.message_count,
            source.media_count,
            source.error_count
        );
    }
    let _ = writeln!(body);
    let _ = writeln!(body, "finished {}", summary.finished_at.to_rfc3339());
    (subject, body)
}

/// Subject and body of a source alert mail.
pub(crate) fn render_alert(alert: &SourceAlert) -> (String, String) {
    let mut body = String::new();
    let _ = writeln!(body, "account: {} ({})", alert.account, alert.kind);
    let _ = writeln!(body, "run: {}", alert.run_id);
    let _ = writeln!(body, "messages stored: {}", alert.message_count);
    let _ = writeln!(body, "elapsed: {} ms", alert.execution_time_ms);
    let _ = writeln!(body);
    for error in &alert.errors {
        let _ = writeln!(body, "[{}] {}", error.kind, error.message);
    }
    (alert.headline(), body)
}

#[async_trait]
impl NotificationSink for EmailSink {
    fn name(&self) -> String {
        "email".to_string()
    }

    async fn send(&self, summary: &RunSummary) -> FerryResult<()> {
        let clean = summary.sources.iter().all(|s| s.success && s.error_count == 0);
        if clean && !self.on_success {
            return Ok(());
        }
        let (subject, body) = render_summary(summary);
        self.deliver(self.compose(subject, body)?).await
    }

    async fn send_alert(&self, alert: &SourceAlert) -> FerryResult<()> {
        if !self.on_error {
            return Ok(());
        }
        let (subject, body) = render_alert(alert);
        self.deliver(self.compose(subject, body)?).await
    }
}
