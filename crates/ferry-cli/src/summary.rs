//! Human-readable run summary printed after a CLI run.

use std::fmt::Write;

use ferry_core::{ExtractionResult, RunReport};

/// Errors shown per source before the rest are collapsed.
const SHOWN_ERRORS: usize = 3;

/// Render `report` as the per-source block printed to stdout.
pub fn render(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Extraction results (run {})", report.run_id);
    for result in report.results.values() {
        render_source(&mut out, result);
    }
    let _ = writeln!(
        out,
        "Summary: {}/{} sources successful, {} messages, {} media files",
        report.successful_sources(),
        report.results.len(),
        report.total_messages(),
        report.total_media()
    );
    out
}

fn render_source(out: &mut String, result: &ExtractionResult) {
    let status = if result.success { "SUCCESS" } else { "FAILED" };
    let _ = writeln!(
        out,
        "{} [{}]: {}",
        result.source_account, result.source_kind, status
    );
    let _ = writeln!(
        out,
        "  messages={} media={} duplicates={} time={:.2}s",
        result.message_count,
        result.media_count,
        result.duplicate_count,
        result.execution_time_ms as f64 / 1000.0
    );

    if !result.errors.is_empty() {
        let _ = writeln!(out, "  errors: {}", result.errors.len());
        for error in result.errors.iter().take(SHOWN_ERRORS) {
            let _ = writeln!(out, "    - [{}] {}", error.kind, error.message);
        }
        if result.errors.len() > SHOWN_ERRORS {
            let _ = writeln!(
                out,
                "    ... and {} more",
                result.errors.len() - SHOWN_ERRORS
            );
        }
    }

    let paths = &result.output_paths;
    for (label, path) in [
        ("json", &paths.json),
        ("csv", &paths.csv),
        ("media", &paths.media_dir),
    ] {
        if let Some(path) = path {
            let _ = writeln!(out, "  {}: {}", label, path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ferry_core::{ErrorDescriptor, ErrorKind, OutputPaths, SourceKind};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn result(account: &str, success: bool, errors: usize) -> ExtractionResult {
        ExtractionResult {
            source_account: account.to_string(),
            source_kind: SourceKind::Email,
            success,
            message_count: 3,
            media_count: 2,
            duplicate_count: 0,
            errors: (0..errors)
                .map(|i| ErrorDescriptor {
                    kind: ErrorKind::PartialMediaDownload,
                    message: format!("attachment {} failed", i),
                })
                .collect(),
            execution_time_ms: 1500,
            output_paths: OutputPaths {
                json: Some(PathBuf::from("/data/work/2024-01-15/messages.json")),
                ..OutputPaths::default()
            },
        }
    }

    #[test]
    fn test_render_lists_first_errors_only() {
        let mut results = BTreeMap::new();
        results.insert("work".to_string(), result("work", true, 5));
        results.insert("home".to_string(), result("home", false, 0));
        let now = Utc::now();
        let report = RunReport::new("run-1", now, now, results);

        let text = render(&report);

        assert!(text.contains("work [email]: SUCCESS"));
        assert!(text.contains("home [email]: FAILED"));
        assert!(text.contains("messages=3 media=2 duplicates=0 time=1.50s"));
        assert!(text.contains("attachment 2 failed"));
        assert!(!text.contains("attachment 3 failed"));
        assert!(text.contains("... and 2 more"));
        assert!(text.contains("json: /data/work/2024-01-15/messages.json"));
        assert!(text.contains("Summary: 1/2 sources successful, 6 messages, 4 media files"));
    }
}
