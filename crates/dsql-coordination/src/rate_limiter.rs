//! Token bucket shared by every instance connecting to one endpoint.
//!
//! The bucket lives in the [`CoordinationStore`] under
//! `{prefix}:ratelimit:{endpoint}`. Token counts are fixed-point
//! milli-tokens so that sub-second refills accumulate exactly: after
//! `elapsed_ms` milliseconds at `rate` tokens per second the bucket gains
//! `elapsed_ms * rate` milli-tokens.
//!
//! [`DistributedRateLimiter::try_acquire`] reads the bucket, refills it,
//! takes one token if available, and commits with a conditional write. A
//! lost write re-reads and recomputes, up to a bounded number of attempts.

use std::sync::Arc;
use std::time::Duration;

use dsql_core::{Clock, Metrics};
use serde::{Deserialize, Serialize};

use crate::error::CoordinationError;
use crate::store::{CoordinationStore, load_json, store_json_if};

/// Milli-tokens per token.
pub const MILLI_TOKENS: u64 = 1_000;

/// Conditional writes attempted before giving up on a contended bucket.
const MAX_CAS_ATTEMPTS: u32 = 8;

/// Records idle this long are dropped by the store; a recreated bucket
/// starts full.
const BUCKET_RECORD_TTL: Duration = Duration::from_secs(3600);

/// Persisted bucket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketState {
    /// Available milli-tokens.
    pub tokens_milli: u64,
    /// When the bucket was last refilled, in epoch milliseconds.
    pub last_refill_ms: u64,
    /// Refill rate in tokens per second.
    pub rate_per_sec: u32,
    /// Capacity in tokens.
    pub capacity: u32,
}

impl BucketState {
    /// A full bucket as of `now_ms`.
    pub fn full(now_ms: u64, rate_per_sec: u32, capacity: u32) -> Self {
        Self {
            tokens_milli: u64::from(capacity).saturating_mul(MILLI_TOKENS),
            last_refill_ms: now_ms,
            rate_per_sec,
            capacity,
        }
    }

    /// The bucket after refilling up to `now_ms` with the given parameters.
    ///
    /// A clock that moved backwards adds nothing and keeps the later
    /// timestamp.
    pub fn refilled(&self, now_ms: u64, rate_per_sec: u32, capacity: u32) -> Self {
        let elapsed_ms = now_ms.saturating_sub(self.last_refill_ms);
        let cap_milli = u64::from(capacity).saturating_mul(MILLI_TOKENS);
        let added = elapsed_ms.saturating_mul(u64::from(rate_per_sec));
        Self {
            tokens_milli: self.tokens_milli.saturating_add(added).min(cap_milli),
            last_refill_ms: self.last_refill_ms.max(now_ms),
            rate_per_sec,
            capacity,
        }
    }

    /// Take one token, or return how long until one is available.
    pub fn take_one(&self) -> Result<Self, Duration> {
        if self.tokens_milli >= MILLI_TOKENS {
            return Ok(Self {
                tokens_milli: self.tokens_milli.saturating_sub(MILLI_TOKENS),
                ..*self
            });
        }
        let missing = MILLI_TOKENS.saturating_sub(self.tokens_milli);
        let rate = u64::from(self.rate_per_sec.max(1));
        Err(Duration::from_millis(missing.div_ceil(rate)))
    }
}

/// Outcome of one acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// A token was taken; the caller may open one connection.
    Acquired,
    /// The bucket is empty. Try again after the given delay.
    Throttled(Duration),
}

/// A token bucket shared through a [`CoordinationStore`].
#[derive(Debug)]
pub struct DistributedRateLimiter {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    key: String,
    rate_per_sec: u32,
    capacity: u32,
    metrics: Option<Metrics>,
}

impl DistributedRateLimiter {
    /// Create a limiter for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::Config`] if `rate_per_sec` or
    /// `capacity` is zero.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        prefix: &str,
        endpoint: &str,
        rate_per_sec: u32,
        capacity: u32,
    ) -> Result<Self, CoordinationError> {
        if rate_per_sec == 0 || capacity == 0 {
            return Err(CoordinationError::Config(
                "rate limiter rate and capacity must be positive".to_owned(),
            ));
        }
        Ok(Self {
            store,
            clock,
            key: format!("{prefix}:ratelimit:{endpoint}"),
            rate_per_sec,
            capacity,
            metrics: None,
        })
    }

    /// Attach a metrics handle.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The store key of this limiter's bucket.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Try to take one token.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::Contention`] if every conditional write
    /// lost, or any store error.
    pub async fn try_acquire(&self) -> Result<RateDecision, CoordinationError> {
        let result = self.try_acquire_inner().await;
        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                Ok(RateDecision::Acquired) => "acquired",
                Ok(RateDecision::Throttled(_)) => "throttled",
                Err(_) => "error",
            };
            metrics.record_rate_limit(outcome);
        }
        result
    }

    async fn try_acquire_inner(&self) -> Result<RateDecision, CoordinationError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now_ms();
            let current = load_json::<BucketState>(self.store.as_ref(), &self.key).await?;
            let (expected, state) = match current {
                Some(rec) => (
                    Some(rec.version),
                    rec.value.refilled(now, self.rate_per_sec, self.capacity),
                ),
                None => (
                    None,
                    BucketState::full(now, self.rate_per_sec, self.capacity),
                ),
            };

            let next = match state.take_one() {
                Ok(next) => next,
                Err(wait) => {
                    tracing::debug!(key = %self.key, wait_ms = wait.as_millis(), "connect rate limited");
                    return Ok(RateDecision::Throttled(wait));
                }
            };

            if store_json_if(
                self.store.as_ref(),
                &self.key,
                expected,
                &next,
                BUCKET_RECORD_TTL,
            )
            .await?
            {
                return Ok(RateDecision::Acquired);
            }
            tracing::trace!(key = %self.key, "rate limiter write lost, re-reading");
        }
        Err(CoordinationError::Contention {
            key: self.key.clone(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }
}
