//! The per-source extraction loop shared by every provider.

use chrono::{NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dedup::DedupIndex;
use crate::error::{FerryError, FerryResult};
use crate::storage::StorageManager;
use crate::traits::{ExtractionFilter, SourceExtractor};
use crate::types::{
    Attachment, AttachmentRef, ErrorDescriptor, ExtractionResult, OutputPaths, RawRecord,
};

/// Counters a source updates as pages are persisted.
///
/// Shared with the orchestrator so a source that times out still reports
/// what it had already written.
#[derive(Debug, Default)]
pub struct SourceProgress {
    messages: AtomicUsize,
    media: AtomicUsize,
    duplicates: AtomicUsize,
    details: Mutex<ProgressDetails>,
}

#[derive(Debug, Default)]
struct ProgressDetails {
    errors: Vec<ErrorDescriptor>,
    output_paths: OutputPaths,
}

impl SourceProgress {
    pub fn messages(&self) -> usize {
        self.messages.load(Ordering::SeqCst)
    }

    pub fn media(&self) -> usize {
        self.media.load(Ordering::SeqCst)
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates.load(Ordering::SeqCst)
    }

    /// Record a non-fatal error.
    pub fn push_error(&self, err: &FerryError) {
        if let Ok(mut details) = self.details.lock() {
            details.errors.push(err.into());
        }
    }

    fn set_outputs(&self, json: PathBuf, csv: PathBuf, media_dir: PathBuf) {
        if let Ok(mut details) = self.details.lock() {
            details.output_paths = OutputPaths {
                json: Some(json),
                csv: Some(csv),
                media_dir: Some(media_dir),
            };
        }
    }

    /// Freeze the counters into a result. `fatal` is the error that ended the
    /// source, if any.
    pub fn to_result(
        &self,
        account: &str,
        kind: crate::types::SourceKind,
        fatal: Option<&FerryError>,
        elapsed: Duration,
    ) -> ExtractionResult {
        let (mut errors, output_paths) = match self.details.lock() {
            Ok(details) => (details.errors.clone(), details.output_paths.clone()),
            Err(_) => (Vec::new(), OutputPaths::default()),
        };
        if let Some(err) = fatal {
            errors.push(err.into());
        }
        ExtractionResult {
            source_account: account.to_string(),
            source_kind: kind,
            success: fatal.is_none(),
            message_count: self.messages(),
            media_count: self.media(),
            duplicate_count: self.duplicates(),
            errors,
            execution_time_ms: elapsed.as_millis() as u64,
            output_paths,
        }
    }
}

/// Drives one extractor: authenticate, page, dedup, download, persist.
pub struct SourceRunner<'a> {
    extractor: &'a dyn SourceExtractor,
    storage: &'a StorageManager,
    dedup: &'a DedupIndex,
    partition: NaiveDate,
    max_concurrent_downloads: usize,
    progress: Arc<SourceProgress>,
}

impl<'a> SourceRunner<'a> {
    pub fn new(
        extractor: &'a dyn SourceExtractor,
        storage: &'a StorageManager,
        dedup: &'a DedupIndex,
        partition: NaiveDate,
    ) -> Self {
        Self {
            extractor,
            storage,
            dedup,
            partition,
            max_concurrent_downloads: 4,
            progress: Arc::new(SourceProgress::default()),
        }
    }

    pub fn with_max_concurrent_downloads(mut self, n: usize) -> Self {
        self.max_concurrent_downloads = n.max(1);
        self
    }

    /// Report into an existing progress handle.
    pub fn with_progress(mut self, progress: Arc<SourceProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> Arc<SourceProgress> {
        Arc::clone(&self.progress)
    }

    /// Extract everything the filter selects.
    ///
    /// Pages are persisted as they arrive, so an error part-way leaves the
    /// earlier pages stored and marked seen.
    pub async fn run(&self, filter: &ExtractionFilter) -> FerryResult<()> {
        let account = self.extractor.account();
        self.extractor.authenticate().await?;
        tracing::info!(account, kind = %self.extractor.kind(), "authenticated");

        let mut cursor: Option<String> = None;
        let mut cursors_seen = HashSet::new();
        let mut fetched = 0usize;
        let mut pages = 0usize;

        loop {
            let page = self.extractor.fetch_page(filter, cursor.as_deref()).await?;
            pages += 1;

            let mut records = page.records;
            if let Some(max) = filter.max_records {
                records.truncate(max.saturating_sub(fetched));
            }
            fetched += records.len();
            tracing::debug!(account, page = pages, records = records.len(), "page fetched");

            self.process_page(records).await?;

            if filter.max_records.is_some_and(|max| fetched >= max) {
                tracing::info!(account, fetched, "max_records reached");
                break;
            }
            match page.next_cursor {
                None => break,
                Some(next) => {
                    if !cursors_seen.insert(next.clone()) {
                        tracing::warn!(account, cursor = %next, "provider repeated a cursor, stopping");
                        break;
                    }
                    cursor = Some(next);
                }
            }
        }

        tracing::info!(
            account,
            pages,
            fetched,
            messages = self.progress.messages(),
            media = self.progress.media(),
            duplicates = self.progress.duplicates(),
            "extraction finished"
        );
        Ok(())
    }

    async fn process_page(&self, records: Vec<RawRecord>) -> FerryResult<()> {
        let account = self.extractor.account();

        let mut fresh = Vec::with_capacity(records.len());
        let mut in_page = HashSet::new();
        let mut duplicates = 0usize;
        for record in records {
            if !in_page.insert(record.id.clone()) || self.dedup.seen(account, &record.id)? {
                duplicates += 1;
            } else {
                fresh.push(record);
            }
        }
        self.progress.duplicates.fetch_add(duplicates, Ordering::SeqCst);
        if fresh.is_empty() {
            return Ok(());
        }

        let jobs: Vec<(usize, &AttachmentRef)> = fresh
            .iter()
            .enumerate()
            .flat_map(|(i, r)| r.attachments.iter().map(move |a| (i, a)))
            .collect();
        let downloaded: Vec<(usize, FerryResult<Option<Attachment>>)> = stream::iter(jobs)
            .map(move |(i, attachment)| async move { (i, self.store_attachment(attachment).await) })
            .buffered(self.max_concurrent_downloads)
            .boxed()
            .collect()
            .await;

        let mut per_record: Vec<Vec<Attachment>> = vec![Vec::new(); fresh.len()];
        for (i, outcome) in downloaded {
            if let Some(attachment) = outcome? {
                per_record[i].push(attachment);
            }
        }

        let extracted_at = Utc::now();
        let kind = self.extractor.kind();
        let media: usize = per_record.iter().map(Vec::len).sum();
        let messages: Vec<_> = fresh
            .into_iter()
            .zip(per_record)
            .map(|(raw, attachments)| raw.into_message(kind, account, extracted_at, attachments))
            .collect();

        let outcome = self.storage.persist(account, self.partition, &messages)?;
        self.dedup
            .mark_seen_batch(account, messages.iter().map(|m| m.id.as_str()))?;

        let already_stored = messages.len() - outcome.added;
        self.progress.messages.fetch_add(outcome.added, Ordering::SeqCst);
        self.progress.duplicates.fetch_add(already_stored, Ordering::SeqCst);
        self.progress.media.fetch_add(media, Ordering::SeqCst);
        self.progress.set_outputs(
            outcome.json_path,
            outcome.csv_path,
            self.storage.media_dir(account, self.partition),
        );
        Ok(())
    }

    /// Download and store one attachment.
    ///
    /// A failed download is recorded and yields `None`; a failed write is
    /// returned as an error.
    async fn store_attachment(&self, attachment: &AttachmentRef) -> FerryResult<Option<Attachment>> {
        let account = self.extractor.account();
        let bytes = match self.extractor.download_attachment(attachment).await {
            Ok(bytes) => bytes,
            Err(err) => {
                let err = match err {
                    e @ FerryError::PartialMediaDownload { .. } => e,
                    e => FerryError::media(&attachment.filename, e.to_string()),
                };
                tracing::warn!(account, filename = %attachment.filename, "{}", err);
                self.progress.push_error(&err);
                return Ok(None);
            }
        };

        let local_path = self
            .storage
            .save_media(account, self.partition, &attachment.filename, &bytes)?;
        Ok(Some(Attachment {
            filename: attachment.filename.clone(),
            size_bytes: bytes.len() as u64,
            content_type: attachment.content_type.clone(),
            local_path,
        }))
    }
}
