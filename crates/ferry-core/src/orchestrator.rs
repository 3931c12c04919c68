//! Runs every enabled source-account once and aggregates the results.

use chrono::Utc;
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::credentials::CredentialStore;
use crate::dedup::DedupIndex;
use crate::error::{FerryError, FerryResult};
use crate::notify::NotificationDispatcher;
use crate::retry::{RateLimiter, RequestPolicy};
use crate::runner::{SourceProgress, SourceRunner};
use crate::storage::StorageManager;
use crate::traits::{ExtractionFilter, ExtractorContext, ExtractorFactory};
use crate::types::{ExtractionResult, RunReport, SourceKind};

/// Dedup index and storage shared by every run of one process.
struct SharedStores {
    dedup: Arc<DedupIndex>,
    storage: Arc<StorageManager>,
}

impl SharedStores {
    fn open(config: &PipelineConfig) -> FerryResult<Self> {
        let dedup = DedupIndex::open(&config.storage.dedup_db_path)?;
        let storage = StorageManager::new(&config.storage.base_path);
        let storage = match &config.storage.fallback_path {
            Some(fallback) => storage.with_fallback(fallback),
            None => storage,
        };
        tracing::debug!(
            dedup_db = %config.storage.dedup_db_path.display(),
            known_records = dedup.len(),
            base_path = %storage.base_path().display(),
            "stores opened"
        );
        Ok(Self {
            dedup: Arc::new(dedup),
            storage: Arc::new(storage),
        })
    }
}

/// Fans a run out over source-accounts.
///
/// Sources are isolated: an error, timeout or panic in one is recorded in its
/// result and never stops the others.
///
/// The dedup index and storage manager are opened on the first run (from
/// that run's config) and reused by every later run, unless injected with
/// [`Orchestrator::with_stores`].
pub struct Orchestrator {
    factory: Arc<dyn ExtractorFactory>,
    credentials: CredentialStore,
    notifier: Option<NotificationDispatcher>,
    stores: OnceCell<SharedStores>,
}

impl Orchestrator {
    pub fn new(factory: Arc<dyn ExtractorFactory>, credentials: CredentialStore) -> Self {
        Self {
            factory,
            credentials,
            notifier: None,
            stores: OnceCell::new(),
        }
    }

    /// Use this dispatcher instead of building one from config.
    pub fn with_notifier(mut self, notifier: NotificationDispatcher) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Use these stores instead of opening them from config.
    pub fn with_stores(mut self, dedup: Arc<DedupIndex>, storage: Arc<StorageManager>) -> Self {
        self.stores = OnceCell::with_value(SharedStores { dedup, storage });
        self
    }

    fn stores(&self, config: &PipelineConfig) -> FerryResult<&SharedStores> {
        self.stores.get_or_try_init(|| SharedStores::open(config))
    }

    /// Execute one run.
    ///
    /// Fails only when shared state (the dedup index) cannot be opened;
    /// source failures are reported inside the [`RunReport`].
    ///
    /// Each source's `source_timeout_secs` deadline starts once it holds an
    /// account slot; time spent queued behind `max_concurrent_accounts` does
    /// not count against it.
    pub async fn run(&self, config: &PipelineConfig) -> FerryResult<RunReport> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let partition = started_at.date_naive();
        let execution = &config.pipeline;

        let stores = self.stores(config)?;
        let dedup = &stores.dedup;
        let storage = &stores.storage;
        let permits = Arc::new(Semaphore::new(execution.max_concurrent_accounts.max(1)));
        let source_timeout = Duration::from_secs(execution.source_timeout_secs);

        let accounts = config.enabled_accounts();
        tracing::info!(run_id = %run_id, sources = accounts.len(), "run started");

        let mut tasks = Vec::with_capacity(accounts.len());
        for account in &accounts {
            let name = account.name().to_string();
            let kind = account.kind();
            let progress = Arc::new(SourceProgress::default());
            let filter = ExtractionFilter::for_account(account, started_at);

            let ctx = ExtractorContext {
                credentials: self.credentials.clone(),
                policy: RequestPolicy::new(
                    Arc::new(RateLimiter::per_minute(
                        account.limits().rate_limit,
                        Duration::from_secs(execution.acquire_timeout_secs),
                    )),
                    execution.retry.clone(),
                ),
                request_timeout: Duration::from_secs(execution.request_timeout_secs),
            };
            let extractor = match self.factory.create(account, ctx) {
                Ok(extractor) => extractor,
                Err(err) => {
                    tracing::error!(account = %name, "cannot build extractor: {}", err);
                    tasks.push(SourceTask::Failed(ExtractionResult::failed(
                        &name,
                        kind,
                        &err,
                        0,
                    )));
                    continue;
                }
            };

            let storage = Arc::clone(storage);
            let dedup = Arc::clone(dedup);
            let permits = Arc::clone(&permits);
            let task_progress = Arc::clone(&progress);
            let downloads = execution.max_concurrent_downloads;
            let handle = tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| FerryError::internal("account semaphore closed"))?;
                // The deadline covers extraction only, not the wait for a slot.
                let started = Instant::now();
                let runner = SourceRunner::new(extractor.as_ref(), &storage, &dedup, partition)
                    .with_max_concurrent_downloads(downloads)
                    .with_progress(task_progress);

                let outcome = tokio::time::timeout(source_timeout, async {
                    let outcome = runner.run(&filter).await;
                    extractor.close().await;
                    outcome
                })
                .await;
                let outcome = match outcome {
                    Ok(result) => result,
                    Err(_) => Err(FerryError::Timeout(format!(
                        "source did not finish within {}s",
                        source_timeout.as_secs()
                    ))),
                };
                Ok::<_, FerryError>((outcome, started.elapsed()))
            });
            tasks.push(SourceTask::Running {
                name,
                kind,
                progress,
                handle,
            });
        }

        let mut results = BTreeMap::new();
        for task in tasks {
            let result = task.finish().await;
            log_result(&result);
            results.insert(result.source_account.clone(), result);
        }

        let report = RunReport::new(run_id, started_at, Utc::now(), results);
        tracing::info!(
            run_id = %report.run_id,
            success = report.success,
            succeeded = report.successful_sources(),
            sources = report.results.len(),
            messages = report.total_messages(),
            media = report.total_media(),
            "run finished"
        );

        match &self.notifier {
            Some(notifier) => notifier.notify(&report).await,
            None => {
                NotificationDispatcher::from_config(&config.notifications, &self.credentials)
                    .notify(&report)
                    .await
            }
        }

        Ok(report)
    }
}

type TaskOutput = FerryResult<(FerryResult<()>, Duration)>;

enum SourceTask {
    Failed(ExtractionResult),
    Running {
        name: String,
        kind: SourceKind,
        progress: Arc<SourceProgress>,
        handle: tokio::task::JoinHandle<TaskOutput>,
    },
}

impl SourceTask {
    async fn finish(self) -> ExtractionResult {
        match self {
            Self::Failed(result) => result,
            Self::Running {
                name,
                kind,
                progress,
                handle,
            } => match handle.await {
                Ok(Ok((Ok(()), elapsed))) => progress.to_result(&name, kind, None, elapsed),
                Ok(Ok((Err(err), elapsed))) => {
                    progress.to_result(&name, kind, Some(&err), elapsed)
                }
                Ok(Err(err)) => progress.to_result(&name, kind, Some(&err), Duration::ZERO),
                Err(join) => {
                    let err = if join.is_panic() {
                        FerryError::internal("source task panicked")
                    } else {
                        FerryError::internal("source task was cancelled")
                    };
                    progress.to_result(&name, kind, Some(&err), Duration::ZERO)
                }
            },
        }
    }
}

fn log_result(result: &ExtractionResult) {
    if result.success {
        tracing::info!(
            account = %result.source_account,
            kind = %result.source_kind,
            messages = result.message_count,
            media = result.media_count,
            duplicates = result.duplicate_count,
            errors = result.errors.len(),
            elapsed_ms = result.execution_time_ms,
            "source succeeded"
        );
    } else {
        let reason = result
            .fatal_errors()
            .last()
            .map(|e| e.message.as_str())
            .unwrap_or("unknown error");
        tracing::error!(
            account = %result.source_account,
            kind = %result.source_kind,
            messages = result.message_count,
            elapsed_ms = result.execution_time_ms,
            "source failed: {}",
            reason
        );
    }
}
