//! Run notifications.
//!
//! After each run the orchestrator hands the report to a
//! [`NotificationDispatcher`], which renders a high-level [`RunSummary`] and
//! delivers it to every configured sink. Each source that recorded errors
//! additionally produces a [`SourceAlert`]. Delivery is best effort: failures
//! are logged and never affect the run's outcome.

mod email;
mod slack;
mod webhook;

pub use email::EmailSink;
pub use slack::SlackSink;
pub use webhook::{sign_payload, verify_signature, WebhookSink};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::NotificationConfig;
use crate::credentials::CredentialStore;
use crate::error::FerryResult;
use crate::types::{ErrorDescriptor, ExtractionResult, RunReport, SourceKind};

/// Per-source line of a summary. Counts only, no error text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub account: String,
    pub kind: SourceKind,
    pub success: bool,
    pub message_count: usize,
    pub media_count: usize,
    pub duplicate_count: usize,
    pub error_count: usize,
    pub execution_time_ms: u64,
}

/// What notification sinks receive about a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub total_messages: usize,
    pub total_media: usize,
    pub sources: Vec<SourceSummary>,
}

impl From<&RunReport> for RunSummary {
    fn from(report: &RunReport) -> Self {
        Self {
            run_id: report.run_id.clone(),
            started_at: report.started_at,
            finished_at: report.finished_at,
            success: report.success,
            total_messages: report.total_messages(),
            total_media: report.total_media(),
            sources: report
                .results
                .values()
                .map(|r| SourceSummary {
                    account: r.source_account.clone(),
                    kind: r.source_kind,
                    success: r.success,
                    message_count: r.message_count,
                    media_count: r.media_count,
                    duplicate_count: r.duplicate_count,
                    error_count: r.errors.len(),
                    execution_time_ms: r.execution_time_ms,
                })
                .collect(),
        }
    }
}

impl RunSummary {
    /// One-line human rendering, used by chat sinks.
    pub fn headline(&self) -> String {
        let ok = self.sources.iter().filter(|s| s.success).count();
        format!(
            "ferry run {}: {}/{} sources succeeded, {} messages, {} media files",
            if self.success { "completed" } else { "FAILED" },
            ok,
            self.sources.len(),
            self.total_messages,
            self.total_media
        )
    }
}

/// Errors one source recorded during a run.
///
/// Messages come from [`crate::FerryError`] displays, which name credential
/// variables but never their values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAlert {
    pub run_id: String,
    pub account: String,
    pub kind: SourceKind,
    /// Whether the source still counted as successful.
    pub success: bool,
    pub message_count: usize,
    pub execution_time_ms: u64,
    pub errors: Vec<ErrorDescriptor>,
}

impl SourceAlert {
    /// Alert for `result`, or `None` when it recorded no errors.
    pub fn from_result(run_id: &str, result: &ExtractionResult) -> Option<Self> {
        if result.errors.is_empty() {
            return None;
        }
        Some(Self {
            run_id: run_id.to_string(),
            account: result.source_account.clone(),
            kind: result.source_kind,
            success: result.success,
            message_count: result.message_count,
            execution_time_ms: result.execution_time_ms,
            errors: result.errors.clone(),
        })
    }

    pub fn headline(&self) -> String {
        format!(
            "ferry {} in {} ({}): {} error(s)",
            if self.success { "warning" } else { "error" },
            self.account,
            self.kind,
            self.errors.len()
        )
    }
}

/// A destination for run summaries and error alerts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> String;

    async fn send(&self, summary: &RunSummary) -> FerryResult<()>;

    async fn send_alert(&self, alert: &SourceAlert) -> FerryResult<()>;
}

/// Fans a run summary out to all sinks.
#[derive(Clone, Default)]
pub struct NotificationDispatcher {
    sinks: Vec<Arc<dyn NotificationSink>>,
    only_on_failure: bool,
}

impl NotificationDispatcher {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self {
            sinks,
            only_on_failure: false,
        }
    }

    /// Build the sinks named in config.
    ///
    /// A sink whose credentials cannot be resolved is skipped with a warning.
    pub fn from_config(config: &NotificationConfig, credentials: &CredentialStore) -> Self {
        let mut sinks: Vec<Arc<dyn NotificationSink>> = Vec::new();
        if config.enabled {
            if let Some(webhook) = &config.webhook {
                match WebhookSink::from_config(webhook, credentials) {
                    Ok(sink) => sinks.push(Arc::new(sink)),
                    Err(e) => tracing::warn!("webhook notifications disabled: {}", e),
                }
            }
            if let Some(slack) = &config.slack {
                match SlackSink::from_config(slack, credentials) {
                    Ok(sink) => sinks.push(Arc::new(sink)),
                    Err(e) => tracing::warn!("slack notifications disabled: {}", e),
                }
            }
            if let Some(email) = &config.email {
                match EmailSink::from_config(email, credentials) {
                    Ok(sink) => sinks.push(Arc::new(sink)),
                    Err(e) => tracing::warn!("email notifications disabled: {}", e),
                }
            }
        }
        Self {
            sinks,
            only_on_failure: config.only_on_failure,
        }
    }

    pub fn only_on_failure(mut self, only_on_failure: bool) -> Self {
        self.only_on_failure = only_on_failure;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Deliver the summary, then any source alerts, to every sink. Never
    /// fails.
    pub async fn notify(&self, report: &RunReport) {
        if self.sinks.is_empty() {
            return;
        }
        if self.only_on_failure && report.is_clean() {
            tracing::debug!(run_id = %report.run_id, "clean run, notifications suppressed");
            return;
        }

        let summary = RunSummary::from(report);
        let deliveries = self.sinks.iter().map(|sink| {
            let summary = &summary;
            async move {
                match sink.send(summary).await {
                    Ok(()) => tracing::debug!(sink = %sink.name(), "notification delivered"),
                    Err(e) => tracing::warn!(sink = %sink.name(), "notification failed: {}", e),
                }
            }
        });
        futures::future::join_all(deliveries).await;

        let alerts: Vec<SourceAlert> = report
            .results
            .values()
            .filter_map(|result| SourceAlert::from_result(&report.run_id, result))
            .collect();
        for alert in &alerts {
            let deliveries = self.sinks.iter().map(|sink| async move {
                if let Err(e) = sink.send_alert(alert).await {
                    tracing::warn!(
                        sink = %sink.name(),
                        account = %alert.account,
                        "error alert failed: {}",
                        e
                    );
                }
            });
            futures::future::join_all(deliveries).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FerryError;
    use crate::types::{ExtractionResult, OutputPaths};
    use std::collections::BTreeMap;

    fn report(success: bool, with_error: bool) -> RunReport {
        let mut errors = Vec::new();
        if with_error {
            errors.push((&FerryError::media("a.png", "secret detail")).into());
        }
        let mut results = BTreeMap::new();
        results.insert(
            "inbox".to_string(),
            ExtractionResult {
                source_account: "inbox".to_string(),
                source_kind: SourceKind::Email,
                success,
                message_count: 3,
                media_count: 2,
                duplicate_count: 0,
                errors,
                execution_time_ms: 12,
                output_paths: OutputPaths::default(),
            },
        );
        RunReport::new("run-1", Utc::now(), Utc::now(), results)
    }

    #[test]
    fn test_summary_carries_counts_not_details() {
        let summary = RunSummary::from(&report(true, true));
        assert_eq!(summary.sources[0].error_count, 1);
        let json = serde_json::to_string(&summary).unwrap();
        assert!(!json.contains("secret detail"));
        assert!(summary.headline().contains("1/1 sources"));
    }

    #[tokio::test]
    async fn test_dispatch_to_all_sinks_and_swallow_errors() {
        let mut failing = MockNotificationSink::new();
        failing.expect_name().return_const("failing".to_string());
        failing
            .expect_send()
            .times(1)
            .returning(|_| Err(FerryError::network("down")));

        let mut working = MockNotificationSink::new();
        working.expect_name().return_const("working".to_string());
        working
            .expect_send()
            .times(1)
            .withf(|s| s.run_id == "run-1" && s.total_messages == 3)
            .returning(|_| Ok(()));

        let dispatcher = NotificationDispatcher::new(vec![Arc::new(failing), Arc::new(working)]);
        dispatcher.notify(&report(true, false)).await;
    }

    #[tokio::test]
    async fn test_sources_with_errors_raise_alerts() {
        let mut sink = MockNotificationSink::new();
        sink.expect_name().return_const("sink".to_string());
        sink.expect_send().times(1).returning(|_| Ok(()));
        sink.expect_send_alert()
            .times(1)
            .withf(|a| {
                a.account == "inbox"
                    && a.errors.len() == 1
                    && a.errors[0].kind == crate::error::ErrorKind::PartialMediaDownload
            })
            .returning(|_| Err(FerryError::network("down")));

        let dispatcher = NotificationDispatcher::new(vec![Arc::new(sink)]);
        dispatcher.notify(&report(true, true)).await;
    }

    #[test]
    fn test_alert_headline() {
        let failed = report(false, true);
        let alert = SourceAlert::from_result("run-1", &failed.results["inbox"]).unwrap();
        assert_eq!(alert.headline(), "ferry error in inbox (email): 1 error(s)");
        assert!(SourceAlert::from_result("run-1", &report(true, false).results["inbox"]).is_none());
    }

    #[tokio::test]
    async fn test_only_on_failure_suppresses_clean_runs() {
        let mut sink = MockNotificationSink::new();
        sink.expect_name().return_const("sink".to_string());
        sink.expect_send().times(1).returning(|_| Ok(()));

        let dispatcher = NotificationDispatcher::new(vec![Arc::new(sink)]).only_on_failure(true);
        dispatcher.notify(&report(true, false)).await;
        dispatcher.notify(&report(false, false)).await;
    }
}
