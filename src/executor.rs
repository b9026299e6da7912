//! Batched, throttled, retrying execution of per-item remote operations

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ExecutionConfig, MAX_BATCH_SIZE};
use crate::error::{CleanerError, Result};
use crate::rate_limiter::{QuotaCost, QuotaRateLimiter};
use crate::tasks::ItemFailure;

/// Bounded exponential backoff: `base * 2^(attempt - 1)`, capped at `max_delay`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` (1-based) failed.
    /// A server-provided `retry_after` is honoured up to `max_delay`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff = self.base_delay.saturating_mul(1u32 << exponent);
        backoff.max(retry_after.unwrap_or_default()).min(self.max_delay)
    }

    /// Run `operation`, retrying transient errors
    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempts < self.max_attempts => {
                    let delay = self.delay_for(attempts, e.retry_after().map(Duration::from_secs));
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempts, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

impl BatchSettings {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            concurrency: config.max_concurrent_batches,
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                base_delay: Duration::from_millis(config.retry_base_delay_ms),
                max_delay: Duration::from_secs(config.retry_max_delay_secs),
            },
        }
    }

    fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_BATCH_SIZE)
    }
}

/// Outcome for one item of a batch
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome<T> {
    Success(T),
    RetryableFailure {
        code: String,
        reason: String,
        retry_after: Option<Duration>,
    },
    PermanentFailure {
        code: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemResult<T> {
    pub id: String,
    pub outcome: ItemOutcome<T>,
}

impl<T> ItemResult<T> {
    pub fn success(id: impl Into<String>, value: T) -> Self {
        Self {
            id: id.into(),
            outcome: ItemOutcome::Success(value),
        }
    }

    /// Classify an error for one item: transient errors are retryable
    pub fn from_error(id: impl Into<String>, error: &CleanerError) -> Self {
        let outcome = if error.is_transient() {
            ItemOutcome::RetryableFailure {
                code: error.code().to_string(),
                reason: error.to_string(),
                retry_after: error.retry_after().map(Duration::from_secs),
            }
        } else {
            ItemOutcome::PermanentFailure {
                code: error.code().to_string(),
                reason: error.to_string(),
            }
        };
        Self {
            id: id.into(),
            outcome,
        }
    }

    /// Same error for every id, for calls that fail as a whole
    pub fn all_failed(ids: &[String], error: &CleanerError) -> Vec<Self> {
        ids.iter().map(|id| Self::from_error(id.clone(), error)).collect()
    }
}

/// A remote operation applied to a group of item ids in one round-trip.
///
/// `apply` reports one result per id and never fails as a whole.
#[async_trait]
pub trait BatchOperation: Send + Sync {
    type Output: Send + 'static;

    fn name(&self) -> &str;

    fn quota_cost(&self, batch_len: usize) -> QuotaCost;

    async fn apply(&self, ids: &[String]) -> Vec<ItemResult<Self::Output>>;
}

/// Results of one batch after retries
#[derive(Debug)]
pub struct BatchReport<T> {
    pub index: usize,
    pub successes: Vec<(String, T)>,
    pub failures: Vec<ItemFailure>,
    pub attempts: u32,
}

/// Summary of a whole run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub batches_total: usize,
    pub batches_dispatched: usize,
    pub cancelled: bool,
    /// Items in batches that were never dispatched
    pub remaining: Vec<String>,
}

impl RunOutcome {
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed
    }
}

pub struct BatchExecutor {
    settings: BatchSettings,
    limiter: Option<QuotaRateLimiter>,
}

impl BatchExecutor {
    pub fn new(settings: BatchSettings) -> Self {
        Self {
            settings,
            limiter: None,
        }
    }

    pub fn with_limiter(mut self, limiter: QuotaRateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Partition `items` into batches and run `op` over them with at most
    /// `concurrency` batches in flight.
    ///
    /// `on_batch` runs after each batch settles. Cancellation is checked
    /// before each dispatch; batches already in flight always complete.
    pub async fn run<Op, F>(
        &self,
        items: Vec<String>,
        op: &Op,
        cancel: &CancellationToken,
        mut on_batch: F,
    ) -> RunOutcome
    where
        Op: BatchOperation + ?Sized,
        F: FnMut(BatchReport<Op::Output>) + Send,
    {
        let batch_size = self.settings.effective_batch_size();
        let concurrency = self.settings.concurrency.max(1);
        let total = items.len();

        let batches: Vec<Vec<String>> = items.chunks(batch_size).map(|c| c.to_vec()).collect();
        let batches_total = batches.len();
        let mut pending = batches.into_iter().enumerate();
        let mut in_flight = FuturesUnordered::new();

        let mut outcome = RunOutcome {
            total,
            batches_total,
            ..Default::default()
        };

        info!(
            "{}: {} items in {} batches (size {}, concurrency {})",
            op.name(),
            total,
            batches_total,
            batch_size,
            concurrency
        );

        loop {
            while !outcome.cancelled && in_flight.len() < concurrency {
                if cancel.is_cancelled() {
                    info!("{}: cancellation observed, no further batches", op.name());
                    outcome.cancelled = true;
                    break;
                }
                match pending.next() {
                    Some((index, ids)) => {
                        outcome.batches_dispatched += 1;
                        in_flight.push(self.run_batch(index, ids, op));
                    }
                    None => break,
                }
            }

            match in_flight.next().await {
                Some(report) => {
                    outcome.succeeded += report.successes.len();
                    outcome.failed += report.failures.len();
                    on_batch(report);
                }
                None => break,
            }
        }

        if outcome.cancelled {
            outcome.remaining = pending.flat_map(|(_, ids)| ids).collect();
        }

        debug!(
            "{}: finished, {} succeeded, {} failed, {} not dispatched",
            op.name(),
            outcome.succeeded,
            outcome.failed,
            outcome.remaining.len()
        );
        outcome
    }

    async fn run_batch<Op>(&self, index: usize, ids: Vec<String>, op: &Op) -> BatchReport<Op::Output>
    where
        Op: BatchOperation + ?Sized,
    {
        let policy = self.settings.retry;
        let mut successes = Vec::with_capacity(ids.len());
        let mut failures = Vec::new();
        let mut pending = ids;
        let mut attempts = 0;

        while !pending.is_empty() {
            attempts += 1;
            if let Some(limiter) = &self.limiter {
                limiter.acquire(op.quota_cost(pending.len())).await;
            }

            let mut outcomes: HashMap<String, VecDeque<ItemOutcome<Op::Output>>> = HashMap::new();
            for result in op.apply(&pending).await {
                outcomes.entry(result.id).or_default().push_back(result.outcome);
            }

            let mut retry = Vec::new();
            let mut retry_after: Option<Duration> = None;
            for id in pending {
                match outcomes.get_mut(&id).and_then(|q| q.pop_front()) {
                    Some(ItemOutcome::Success(value)) => successes.push((id, value)),
                    Some(ItemOutcome::PermanentFailure { code, reason }) => {
                        failures.push(ItemFailure::new(id, code, reason));
                    }
                    Some(ItemOutcome::RetryableFailure {
                        code,
                        reason,
                        retry_after: after,
                    }) => {
                        if attempts < policy.max_attempts {
                            retry_after = retry_after.max(after);
                            retry.push(id);
                        } else {
                            failures.push(ItemFailure::new(
                                id,
                                code,
                                format!("{} (gave up after {} attempts)", reason, attempts),
                            ));
                        }
                    }
                    None => failures.push(ItemFailure::new(id, "missing_result", "operation reported no outcome")),
                }
            }

            if !retry.is_empty() {
                let delay = policy.delay_for(attempts, retry_after);
                warn!(
                    "{}: batch {} has {} retryable failures (attempt {}/{}), retrying in {:?}",
                    op.name(),
                    index,
                    retry.len(),
                    attempts,
                    policy.max_attempts,
                    delay
                );
                if let (Some(limiter), Some(_)) = (&self.limiter, retry_after) {
                    limiter.hold_off(delay).await;
                }
                tokio::time::sleep(delay).await;
            }
            pending = retry;
        }

        BatchReport {
            index,
            successes,
            failures,
            attempts,
        }
    }
}
