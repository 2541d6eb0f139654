//! Driver loop: steps a batch to a terminal state.
//!
//! The driver owns no state of its own — it is one of possibly several
//! callers (alongside a scheduled reaper) converging on the store. It paces
//! itself between steps, retries transient store failures with backoff, and
//! reports progress after every step. A wall-clock budget bounds each run:
//! exceeding it means "still running, check later", never failure, because
//! another caller can finish the work.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use atelier_core::BatchId;
use atelier_gen::Generator;

use super::executor::StepExecutor;
use super::snapshot::BatchSnapshot;
use super::store::{BatchStore, StoreError};

/// Backoff policy for transient store failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum consecutive transient failures before giving up
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0) to add randomness
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Fixed-delay policy (no growth, no jitter).
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    /// Exponential delay for a given attempt number (1-indexed), capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = (base_ms * 2_f64.powi((attempt - 1) as i32)).min(max_ms);

        // Deterministic pseudo-jitter keyed on the attempt number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Check if another retry is allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Driver loop configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Pacing delay between consecutive steps
    pub step_delay: Duration,
    /// Backoff policy for transient store failures
    pub retry: RetryPolicy,
    /// Wall-clock budget for one run; exceeding it yields
    /// [`DriverOutcome::StillRunning`]
    pub budget: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_millis(250),
            retry: RetryPolicy::default(),
            budget: Duration::from_secs(120),
        }
    }
}

impl DriverConfig {
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }
}

const TOKEN_IDLE: u8 = 0;
const TOKEN_LIVE: u8 = 1;
const TOKEN_STOPPED: u8 = 2;

/// Single-use liveness token guarding one logical driver run.
///
/// The caller creates a fresh token per logical start and hands clones to
/// whoever may request a stop. A token is armed exactly once: arming a live
/// or spent token fails, which catches both overlapping loops for the same
/// session and hosting frameworks that re-invoke setup code. A stopped token
/// is never reusable — a restart requires a new token.
#[derive(Debug, Clone, Default)]
pub struct LivenessToken {
    state: Arc<AtomicU8>,
}

impl LivenessToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of the run. Fails unless the token is fresh.
    fn arm(&self) -> Result<(), DriverError> {
        self.state
            .compare_exchange(TOKEN_IDLE, TOKEN_LIVE, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| DriverError::TokenAlreadyUsed)
    }

    /// Request a stop. The running driver observes it at the next loop
    /// iteration and cancels the batch; in-flight work converges on its own.
    pub fn stop(&self) {
        self.state.store(TOKEN_STOPPED, Ordering::Release);
    }

    pub fn is_live(&self) -> bool {
        self.state.load(Ordering::Acquire) == TOKEN_LIVE
    }

    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) == TOKEN_STOPPED
    }
}

/// How a driver run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverOutcome {
    /// The batch reached a terminal status.
    Terminal(BatchSnapshot),
    /// The local stop flag was flipped before the batch finished;
    /// cancellation has been requested. A stop observed only after the batch
    /// reached a terminal status reports [`DriverOutcome::Terminal`] instead.
    Cancelled(BatchSnapshot),
    /// The wall-clock budget ran out before a terminal status. The batch is
    /// still progressing in the store; another caller (or the reaper) will
    /// finish it — check later.
    StillRunning { last: BatchSnapshot },
}

/// Driver error.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The liveness token was already armed or stopped. Indicates an
    /// overlapping loop or re-invoked setup; the existing run owns the token.
    #[error("liveness token already used; a run for this session exists or existed")]
    TokenAlreadyUsed,
    #[error("transient retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Loop that drives a batch to completion through repeated step calls.
pub struct StepDriver<S: BatchStore, G: Generator> {
    executor: Arc<StepExecutor<S, G>>,
    config: DriverConfig,
}

impl<S: BatchStore, G: Generator> StepDriver<S, G> {
    pub fn new(executor: Arc<StepExecutor<S, G>>) -> Self {
        Self::with_config(executor, DriverConfig::default())
    }

    pub fn with_config(executor: Arc<StepExecutor<S, G>>, config: DriverConfig) -> Self {
        Self { executor, config }
    }

    /// Drive `batch_id` until terminal, stopped, or out of budget.
    ///
    /// `on_progress` is invoked after every step with the latest snapshot.
    /// Transient store failures — on the bootstrap read, on steps, and on
    /// the stop-path cancel — are retried with backoff (the attempt counter
    /// resets on any successful step); other store failures abort the run.
    pub async fn run<F>(
        &self,
        batch_id: BatchId,
        token: &LivenessToken,
        mut on_progress: F,
    ) -> Result<DriverOutcome, DriverError>
    where
        F: FnMut(&BatchSnapshot),
    {
        token.arm()?;
        let started = Instant::now();
        info!(%batch_id, "driver run started");

        // Bootstrap read before any stepping.
        let mut last = self
            .with_backoff(batch_id, "status", || self.executor.status(batch_id))
            .await?;
        let mut attempt = 0u32;

        loop {
            if last.is_terminal() {
                info!(
                    %batch_id,
                    status = ?last.status,
                    completed = last.completed_items,
                    failed = last.failed_items,
                    "driver run finished"
                );
                return Ok(DriverOutcome::Terminal(last));
            }

            if token.is_stopped() {
                info!(%batch_id, "stop requested, cancelling batch");
                let snapshot = self
                    .with_backoff(batch_id, "cancel", || self.executor.cancel(batch_id))
                    .await?;
                return Ok(DriverOutcome::Cancelled(snapshot));
            }

            if started.elapsed() >= self.config.budget {
                info!(%batch_id, "budget exceeded, batch still running in background");
                return Ok(DriverOutcome::StillRunning { last });
            }

            match self.executor.step(batch_id).await {
                Ok(snapshot) => {
                    attempt = 0;
                    on_progress(&snapshot);
                    let terminal = snapshot.is_terminal();
                    last = snapshot;
                    if !terminal {
                        tokio::time::sleep(self.config.step_delay).await;
                    }
                }
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    if !self.config.retry.should_retry(attempt) {
                        return Err(DriverError::RetriesExhausted {
                            attempts: attempt,
                            last_error: err.to_string(),
                        });
                    }
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(%batch_id, attempt, ?delay, error = %err, "transient step failure, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    debug!(%batch_id, error = %err, "fatal step failure");
                    return Err(err.into());
                }
            }
        }
    }

    /// Run a store-backed call, retrying transient failures with backoff.
    /// Used for the reads and writes outside the step loop, which share the
    /// step's retry policy.
    async fn with_backoff<T>(
        &self,
        batch_id: BatchId,
        op: &str,
        mut call: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, DriverError> {
        let mut attempt = 0u32;
        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    if !self.config.retry.should_retry(attempt) {
                        return Err(DriverError::RetriesExhausted {
                            attempts: attempt,
                            last_error: err.to_string(),
                        });
                    }
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(%batch_id, op, attempt, ?delay, error = %err, "transient store failure, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
