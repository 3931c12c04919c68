//! Per-source extraction results and the aggregate run report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{ErrorKind, FerryError};
use crate::types::SourceKind;

/// Error as recorded in a result: taxonomy bucket plus a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&FerryError> for ErrorDescriptor {
    fn from(err: &FerryError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Where a source's output landed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputPaths {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csv: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_dir: Option<PathBuf>,
}

/// Outcome of one source-account in one run. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub source_account: String,
    pub source_kind: SourceKind,
    pub success: bool,
    /// Records newly persisted in this run.
    pub message_count: usize,
    pub media_count: usize,
    /// Records skipped because an earlier run already stored them.
    pub duplicate_count: usize,
    pub errors: Vec<ErrorDescriptor>,
    pub execution_time_ms: u64,
    pub output_paths: OutputPaths,
}

impl ExtractionResult {
    /// Result for a source that failed before producing anything.
    pub fn failed(
        source_account: impl Into<String>,
        source_kind: SourceKind,
        error: &FerryError,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            source_account: source_account.into(),
            source_kind,
            success: false,
            message_count: 0,
            media_count: 0,
            duplicate_count: 0,
            errors: vec![error.into()],
            execution_time_ms,
            output_paths: OutputPaths::default(),
        }
    }

    /// Errors that made the source fail, as opposed to skipped attachments.
    pub fn fatal_errors(&self) -> impl Iterator<Item = &ErrorDescriptor> {
        self.errors
            .iter()
            .filter(|e| e.kind != ErrorKind::PartialMediaDownload)
    }
}

/// Aggregate of one orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Keyed by source-account name.
    pub results: BTreeMap<String, ExtractionResult>,
    /// True iff at least one source succeeded.
    pub success: bool,
}

impl RunReport {
    /// Assemble a report; `success` is derived from the results.
    pub fn new(
        run_id: impl Into<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        results: BTreeMap<String, ExtractionResult>,
    ) -> Self {
        let success = results.values().any(|r| r.success);
        Self {
            run_id: run_id.into(),
            started_at,
            finished_at,
            results,
            success,
        }
    }

    pub fn successful_sources(&self) -> usize {
        self.results.values().filter(|r| r.success).count()
    }

    pub fn total_messages(&self) -> usize {
        self.results.values().map(|r| r.message_count).sum()
    }

    pub fn total_media(&self) -> usize {
        self.results.values().map(|r| r.media_count).sum()
    }

    /// Whether every source succeeded without any recorded error.
    pub fn is_clean(&self) -> bool {
        self.results
            .values()
            .all(|r| r.success && r.errors.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, success: bool) -> ExtractionResult {
        ExtractionResult {
            source_account: name.to_string(),
            source_kind: SourceKind::Email,
            success,
            message_count: 2,
            media_count: 1,
            duplicate_count: 0,
            errors: Vec::new(),
            execution_time_ms: 5,
            output_paths: OutputPaths::default(),
        }
    }

    #[test]
    fn test_report_success_iff_any_source_succeeded() {
        let mut results = BTreeMap::new();
        results.insert("a".to_string(), result("a", false));
        results.insert("b".to_string(), result("b", true));
        let report = RunReport::new("r1", Utc::now(), Utc::now(), results);
        assert!(report.success);
        assert_eq!(report.successful_sources(), 1);
        assert_eq!(report.total_messages(), 4);

        let mut results = BTreeMap::new();
        results.insert("a".to_string(), result("a", false));
        let report = RunReport::new("r2", Utc::now(), Utc::now(), results);
        assert!(!report.success);
    }

    #[test]
    fn test_fatal_errors_skip_media_failures() {
        let mut r = result("a", true);
        r.errors.push((&FerryError::media("x.png", "gone")).into());
        r.errors.push((&FerryError::network("reset")).into());
        assert_eq!(r.fatal_errors().count(), 1);
    }
}
