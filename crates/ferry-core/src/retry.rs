//! Request pacing and retry.
//!
//! Every provider call goes through a [`RequestPolicy`]: it first takes a slot
//! from the account's [`RateLimiter`], then runs the call and retries
//! retryable failures with exponential backoff. A server-supplied
//! `Retry-After` stretches the wait but never shortens it.

use backon::Retryable;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{ErrorCode, FerryError, FerryResult};

/// Sliding-window limiter: at most `max_requests` per `window`.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    acquire_timeout: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Limiter allowing `per_minute` requests in any sixty-second window.
    pub fn per_minute(per_minute: u32, acquire_timeout: Duration) -> Self {
        Self::with_window(per_minute as usize, Duration::from_secs(60), acquire_timeout)
    }

    pub fn with_window(max_requests: usize, window: Duration, acquire_timeout: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            acquire_timeout,
            issued: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait for a slot. Fails with a rate-limit error once waiting would
    /// exceed the acquire timeout.
    pub async fn acquire(&self) -> FerryResult<()> {
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            let wait = {
                let mut issued = self.issued.lock().await;
                let now = Instant::now();
                while let Some(oldest) = issued.front() {
                    if now.duration_since(*oldest) >= self.window {
                        issued.pop_front();
                    } else {
                        break;
                    }
                }
                match issued.front() {
                    Some(oldest) if issued.len() >= self.max_requests => {
                        self.window.saturating_sub(now.duration_since(*oldest))
                    }
                    _ => {
                        issued.push_back(now);
                        return Ok(());
                    }
                }
            };

            if Instant::now() + wait > deadline {
                return Err(FerryError::RateLimit {
                    message: format!(
                        "no request slot within {:?} ({} per {:?})",
                        self.acquire_timeout, self.max_requests, self.window
                    ),
                    code: ErrorCode::RateLimitBudgetTimeout,
                    retry_after: Some(wait.as_secs()),
                });
            }
            tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f32,
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 300_000,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based): `min(base * factor^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.base_delay_ms as f64 * f64::from(self.backoff_factor).powi(attempt as i32);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Delays between attempts, one per retry.
    fn delays(&self) -> impl Iterator<Item = Duration> + Send + Sync + Unpin {
        let policy = self.clone();
        (0..self.max_attempts.saturating_sub(1)).map(move |n| policy.delay_for(n))
    }
}

/// Rate limiter plus backoff for one source-account.
#[derive(Debug, Clone)]
pub struct RequestPolicy {
    limiter: Arc<RateLimiter>,
    backoff: BackoffPolicy,
}

impl RequestPolicy {
    pub fn new(limiter: Arc<RateLimiter>, backoff: BackoffPolicy) -> Self {
        Self { limiter, backoff }
    }

    /// Policy without pacing or retries, for tests and mock sources.
    pub fn unlimited() -> Self {
        Self {
            limiter: Arc::new(RateLimiter::with_window(
                usize::MAX,
                Duration::from_secs(60),
                Duration::from_secs(1),
            )),
            backoff: BackoffPolicy {
                max_attempts: 1,
                ..BackoffPolicy::default()
            },
        }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Run `op`, taking a rate-limit slot before every attempt.
    ///
    /// Retryable errors are retried until `max_attempts` is used up; the last
    /// error is returned. Other errors return immediately. The wait before a
    /// retry is the larger of the backoff delay and the error's `retry_after`.
    pub async fn execute<T, F, Fut>(&self, what: &str, mut op: F) -> FerryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FerryResult<T>>,
    {
        let limiter = &self.limiter;
        let attempt = || {
            let fut = op();
            async move {
                limiter.acquire().await?;
                fut.await
            }
        };

        attempt
            .retry(self.backoff.delays())
            .when(FerryError::is_retryable)
            .adjust(|err: &FerryError, delay: Option<Duration>| {
                delay.map(|d| match err.retry_after() {
                    Some(secs) => d.max(Duration::from_secs(secs)),
                    None => d,
                })
            })
            .notify(|err: &FerryError, dur: Duration| {
                tracing::warn!(
                    operation = what,
                    error_code = err.code().as_str(),
                    retry_in_ms = dur.as_millis() as u64,
                    "request failed, retrying: {}",
                    err
                );
            })
            .await
    }
}
