//! Whole-transaction retry on serialization conflicts.
//!
//! The backend detects write conflicts at commit time. The only correct
//! response is to replay the entire transaction body from `BEGIN`, never a
//! single statement. [`RetryExecutor::run`] does exactly that:
//!
//! 1. begin a transaction;
//! 2. run the body; on error roll back, then classify;
//! 3. on success commit; a failed commit is classified the same way;
//! 4. `Retryable` waits `backoff(attempt)` and starts over while attempts
//!    remain; every other kind returns immediately.
//!
//! Condition failures are never retried: they mean another actor won, and
//! replaying the body with the same expected token cannot change that.
//!
//! Side effects in the body other than statements on the transaction must
//! be idempotent, since the body may run up to `max_attempts` times.

use std::time::Duration;

use async_trait::async_trait;
use dsql_core::config::RetryConfig;
use dsql_core::{Classify, ErrorKind, Metrics};
use futures::future::BoxFuture;
use rand::Rng;
use tokio::time::Instant;

/// Opens, commits, and aborts transactions for the executor.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    /// An open transaction.
    type Tx: Send;
    /// Errors from the source and from transaction bodies.
    type Error: Classify + std::fmt::Display + Send;

    /// Begin a transaction.
    async fn begin(&self) -> Result<Self::Tx, Self::Error>;

    /// Commit a transaction.
    async fn commit(&self, tx: Self::Tx) -> Result<(), Self::Error>;

    /// Abort a transaction. Failures are handled by the source.
    async fn rollback(&self, tx: Self::Tx);
}

/// Terminal outcome of a logical transaction that did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum TxError<E> {
    /// A fenced write lost. The target changed concurrently.
    #[error("target changed concurrently: {0}")]
    ConditionFailed(E),

    /// Every attempt hit a serialization conflict.
    #[error("under contention, try again (gave up after {attempts} attempts): {last}")]
    RetriesExhausted {
        /// Body invocations made.
        attempts: u32,
        /// The last conflict.
        last: E,
    },

    /// The statement used a feature the backend does not support.
    #[error("unsupported backend feature (caller bug): {0}")]
    UnsupportedFeature(E),

    /// A non-retryable failure.
    #[error("{0}")]
    Permanent(E),

    /// The caller's deadline passed.
    #[error("deadline exceeded after {attempts} attempts")]
    DeadlineExceeded {
        /// Body invocations made.
        attempts: u32,
    },
}

impl<E> TxError<E> {
    /// The classification behind this outcome.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ConditionFailed(_) => ErrorKind::ConditionFailed,
            Self::RetriesExhausted { .. } => ErrorKind::Retryable,
            Self::UnsupportedFeature(_) => ErrorKind::UnsupportedFeature,
            Self::Permanent(_) | Self::DeadlineExceeded { .. } => ErrorKind::Permanent,
        }
    }

    /// The underlying error, if there is one.
    pub const fn source_error(&self) -> Option<&E> {
        match self {
            Self::ConditionFailed(e)
            | Self::UnsupportedFeature(e)
            | Self::Permanent(e)
            | Self::RetriesExhausted { last: e, .. } => Some(e),
            Self::DeadlineExceeded { .. } => None,
        }
    }
}

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total body invocations allowed, at least 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Jitter fraction in `[0, 1)`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay after failed attempt `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1_u32.checked_shl(exp).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Jittered delay after failed attempt `attempt`, scaled by a uniform
    /// factor in `[1 - jitter, 1 + jitter]` and capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let jitter = self.jitter.min(0.999);
        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        delay.mul_f64(factor).min(self.max_delay)
    }
}

/// The future returned by a transaction body for one attempt.
pub type TxBody<'c, T, E> = BoxFuture<'c, Result<T, E>>;

/// Runs transaction bodies with conflict retry.
#[derive(Debug)]
pub struct RetryExecutor<S> {
    source: S,
    policy: RetryPolicy,
    metrics: Option<Metrics>,
}

impl<S: TransactionSource> RetryExecutor<S> {
    /// Create an executor over `source`.
    pub const fn new(source: S, policy: RetryPolicy) -> Self {
        Self {
            source,
            policy,
            metrics: None,
        }
    }

    /// Attach a metrics handle.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The transaction source.
    pub const fn source(&self) -> &S {
        &self.source
    }

    /// The retry policy.
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `body` in a transaction, retrying serialization conflicts.
    ///
    /// `operation` labels logs and metrics.
    ///
    /// # Errors
    ///
    /// Returns a [`TxError`] describing the terminal outcome.
    pub async fn run<T, B>(&self, operation: &str, body: B) -> Result<T, TxError<S::Error>>
    where
        T: Send,
        B: for<'c> FnMut(&'c mut S::Tx) -> TxBody<'c, T, S::Error> + Send,
    {
        self.run_with_deadline(operation, None, body).await
    }

    /// Like [`run`](Self::run), giving up with
    /// [`TxError::DeadlineExceeded`] if `deadline` passes before an attempt
    /// starts or during a backoff wait.
    ///
    /// # Errors
    ///
    /// Returns a [`TxError`] describing the terminal outcome.
    pub async fn run_with_deadline<T, B>(
        &self,
        operation: &str,
        deadline: Option<Instant>,
        mut body: B,
    ) -> Result<T, TxError<S::Error>>
    where
        T: Send,
        B: for<'c> FnMut(&'c mut S::Tx) -> TxBody<'c, T, S::Error> + Send,
    {
        let started = Instant::now();
        let result = self.attempt_loop(operation, deadline, &mut body).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_tx_duration(operation, started.elapsed());
            match &result {
                Err(TxError::ConditionFailed(_)) => metrics.record_tx_condition_failure(operation),
                Err(TxError::RetriesExhausted { .. }) => {
                    metrics.record_tx_retries_exhausted(operation);
                }
                _ => {}
            }
        }
        result
    }

    async fn attempt_loop<T, B>(
        &self,
        operation: &str,
        deadline: Option<Instant>,
        body: &mut B,
    ) -> Result<T, TxError<S::Error>>
    where
        T: Send,
        B: for<'c> FnMut(&'c mut S::Tx) -> TxBody<'c, T, S::Error> + Send,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0_u32;
        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(TxError::DeadlineExceeded { attempts: attempt });
            }
            attempt = attempt.saturating_add(1);
            if let Some(metrics) = &self.metrics {
                metrics.record_tx_attempt(operation);
            }

            let err = match self.attempt_once(body).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation, attempt, "transaction committed after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            match err.kind() {
                ErrorKind::ConditionFailed => {
                    tracing::debug!(operation, attempt, error = %err, "condition failed");
                    return Err(TxError::ConditionFailed(err));
                }
                ErrorKind::UnsupportedFeature => {
                    tracing::error!(operation, error = %err, "unsupported backend feature");
                    return Err(TxError::UnsupportedFeature(err));
                }
                ErrorKind::Permanent => {
                    tracing::debug!(operation, attempt, error = %err, "transaction failed");
                    return Err(TxError::Permanent(err));
                }
                ErrorKind::Retryable => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_tx_conflict(operation);
                    }
                    if attempt >= max_attempts {
                        tracing::warn!(operation, attempts = attempt, error = %err, "retries exhausted");
                        return Err(TxError::RetriesExhausted {
                            attempts: attempt,
                            last: err,
                        });
                    }
                    let delay = self.policy.backoff(attempt);
                    tracing::debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis(),
                        "serialization conflict, retrying"
                    );
                    match deadline {
                        Some(d) => {
                            if tokio::time::timeout_at(d, tokio::time::sleep(delay))
                                .await
                                .is_err()
                            {
                                return Err(TxError::DeadlineExceeded { attempts: attempt });
                            }
                        }
                        None => tokio::time::sleep(delay).await,
                    }
                }
            }
        }
    }

    async fn attempt_once<T, B>(&self, body: &mut B) -> Result<T, S::Error>
    where
        T: Send,
        B: for<'c> FnMut(&'c mut S::Tx) -> TxBody<'c, T, S::Error> + Send,
    {
        let mut tx = self.source.begin().await?;
        match body(&mut tx).await {
            Ok(value) => {
                self.source.commit(tx).await?;
                Ok(value)
            }
            Err(e) => {
                self.source.rollback(tx).await;
                Err(e)
            }
        }
    }
}
