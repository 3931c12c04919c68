//! Recurring execution of the pipeline.
//!
//! Uses tokio-cron-scheduler for interval and cron triggers. An
//! [`OverlapGuard`] decides what happens when a trigger fires while the
//! previous run is still going.

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::config::{OverlapPolicy, PipelineConfig, ScheduleMode, SchedulerConfig};
use crate::error::{FerryError, FerryResult};
use crate::orchestrator::Orchestrator;

/// When a scheduled job fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Every(Duration),
    /// Six-field cron expression.
    Cron(String),
}

impl Trigger {
    /// Derive the trigger for a scheduler config. `once` has none.
    pub fn from_config(config: &SchedulerConfig) -> FerryResult<Self> {
        match config.mode {
            ScheduleMode::Once => Err(FerryError::Configuration(
                "scheduler mode 'once' has no recurring trigger".to_string(),
            )),
            ScheduleMode::Interval => match config.interval_minutes {
                Some(minutes) if minutes > 0 => Ok(Self::Every(Duration::from_secs(minutes * 60))),
                _ => Err(FerryError::Configuration(
                    "scheduler.interval_minutes must be positive".to_string(),
                )),
            },
            ScheduleMode::Cron => config
                .cron
                .as_deref()
                .map(|expr| Self::Cron(expr.trim().to_string()))
                .ok_or_else(|| FerryError::Configuration("scheduler.cron is required".to_string())),
            ScheduleMode::Daily => {
                let time = config.daily_time.as_deref().unwrap_or("02:00");
                daily_cron(time).map(Self::Cron)
            }
        }
    }
}

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn job_body(
    job: Arc<dyn ScheduledRun>,
    guard: OverlapGuard,
) -> impl FnMut(Uuid, JobScheduler) -> JobFuture + Send + Sync + 'static {
    move |_uuid, _lock| {
        let job = Arc::clone(&job);
        let guard = guard.clone();
        Box::pin(async move {
            guard.run(job.execute()).await;
        })
    }
}

/// Convert `HH:MM` into a cron expression firing once a day.
fn daily_cron(time: &str) -> FerryResult<String> {
    let invalid = || FerryError::Configuration(format!("invalid daily_time '{}', expected HH:MM", time));
    let (hour, minute) = time.split_once(':').ok_or_else(invalid)?;
    let hour: u8 = hour.parse().map_err(|_| invalid())?;
    let minute: u8 = minute.parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok(format!("0 {} {} * * *", minute, hour))
}

/// Serializes or drops overlapping runs.
#[derive(Clone)]
pub struct OverlapGuard {
    policy: OverlapPolicy,
    lock: Arc<Mutex<()>>,
}

impl OverlapGuard {
    pub fn new(policy: OverlapPolicy) -> Self {
        Self {
            policy,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Run `fut` unless the policy says to skip. Returns whether it ran.
    pub async fn run<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()>,
    {
        match self.policy {
            OverlapPolicy::Skip => match self.lock.try_lock() {
                Ok(_guard) => {
                    fut.await;
                    true
                }
                Err(_) => {
                    tracing::warn!("previous run still in progress, skipping this trigger");
                    false
                }
            },
            OverlapPolicy::Queue => {
                let _guard = self.lock.lock().await;
                fut.await;
                true
            }
        }
    }
}

/// Work performed on each trigger.
#[async_trait]
pub trait ScheduledRun: Send + Sync {
    async fn execute(&self);
}

/// Runs the orchestrator against a fixed config and logs failures.
pub struct PipelineRun {
    orchestrator: Arc<Orchestrator>,
    config: Arc<PipelineConfig>,
}

impl PipelineRun {
    pub fn new(orchestrator: Arc<Orchestrator>, config: Arc<PipelineConfig>) -> Self {
        Self {
            orchestrator,
            config,
        }
    }
}

#[async_trait]
impl ScheduledRun for PipelineRun {
    async fn execute(&self) {
        match self.orchestrator.run(&self.config).await {
            Ok(report) if !report.success => {
                tracing::error!(run_id = %report.run_id, "scheduled run: every source failed")
            }
            Ok(_) => {}
            Err(e) => tracing::error!("scheduled run could not start: {}", e),
        }
    }
}

/// Owns the cron scheduler and the single pipeline job.
pub struct PipelineScheduler {
    scheduler: JobScheduler,
    trigger: Trigger,
    running: RwLock<bool>,
}

impl PipelineScheduler {
    /// Create a scheduler with one job for `config`'s trigger.
    pub async fn new(config: &SchedulerConfig, job: Arc<dyn ScheduledRun>) -> FerryResult<Self> {
        let trigger = Trigger::from_config(config)?;
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| FerryError::internal(format!("Failed to create scheduler: {}", e)))?;

        let run = job_body(job, OverlapGuard::new(config.overlap));

        let job = match &trigger {
            Trigger::Every(every) => Job::new_repeated_async(*every, run)
                .map_err(|e| FerryError::internal(format!("Failed to create repeated job: {}", e)))?,
            Trigger::Cron(expr) => Job::new_async(expr.as_str(), run).map_err(|e| {
                FerryError::Configuration(format!("invalid cron expression '{}': {}", expr, e))
            })?,
        };
        scheduler
            .add(job)
            .await
            .map_err(|e| FerryError::internal(format!("Failed to add job: {}", e)))?;

        Ok(Self {
            scheduler,
            trigger,
            running: RwLock::new(false),
        })
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    /// Start the scheduler.
    pub async fn start(&self) -> FerryResult<()> {
        let mut running = self.running.write().await;
        if !*running {
            self.scheduler
                .start()
                .await
                .map_err(|e| FerryError::internal(format!("Failed to start scheduler: {}", e)))?;
            *running = true;
            tracing::info!(trigger = ?self.trigger, "scheduler started");
        }
        Ok(())
    }

    /// Stop the scheduler.
    pub async fn shutdown(&mut self) -> FerryResult<()> {
        let mut running = self.running.write().await;
        if *running {
            self.scheduler
                .shutdown()
                .await
                .map_err(|e| FerryError::internal(format!("Failed to shutdown scheduler: {}", e)))?;
            *running = false;
            tracing::info!("scheduler stopped");
        }
        Ok(())
    }

    /// Check if scheduler is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(mode: ScheduleMode) -> SchedulerConfig {
        SchedulerConfig {
            enabled: true,
            mode,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn test_trigger_from_config() {
        let mut c = config(ScheduleMode::Interval);
        c.interval_minutes = Some(15);
        assert_eq!(
            Trigger::from_config(&c).unwrap(),
            Trigger::Every(Duration::from_secs(900))
        );

        let mut c = config(ScheduleMode::Daily);
        c.daily_time = Some("07:05".to_string());
        assert_eq!(
            Trigger::from_config(&c).unwrap(),
            Trigger::Cron("0 5 7 * * *".to_string())
        );

        assert!(Trigger::from_config(&config(ScheduleMode::Once)).is_err());
        c.daily_time = Some("7am".to_string());
        assert!(Trigger::from_config(&c).is_err());
    }

    #[tokio::test]
    async fn test_skip_policy_drops_overlapping_run() {
        let guard = OverlapGuard::new(OverlapPolicy::Skip);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .run(async {
                        let _ = rx.await;
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!guard.run(async {}).await);
        tx.send(()).unwrap();
        assert!(first.await.unwrap());
        assert!(guard.run(async {}).await);
    }

    #[tokio::test]
    async fn test_queue_policy_runs_after_current() {
        let guard = OverlapGuard::new(OverlapPolicy::Queue);
        let order = Arc::new(AtomicUsize::new(0));

        let first = {
            let guard = guard.clone();
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                guard
                    .run(async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        order.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst).ok();
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let ran = guard
            .run(async {
                order.compare_exchange(1, 2, Ordering::SeqCst, Ordering::SeqCst).ok();
            })
            .await;
        assert!(ran);
        assert!(first.await.unwrap());
        assert_eq!(order.load(Ordering::SeqCst), 2);
    }
}
