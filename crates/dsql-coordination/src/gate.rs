//! Admission decision consulted before opening a background connection.
//!
//! The reservoir refiller asks its [`ConnectGate`] before every connection
//! it creates. [`OpenGate`] always admits; [`CoordinatedGate`] checks the
//! lease ceiling first (no side effect while capacity remains) and then
//! takes a rate-limiter token.
//!
//! Coordination failures never admit blindly: they throttle for a fixed
//! back-off, and the request path still falls back to synchronous
//! creation when the reservoir is empty.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::lease::LeaseManager;
use crate::rate_limiter::{DistributedRateLimiter, RateDecision};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Open the connection now.
    Granted,
    /// Rate limited (or coordination unavailable); retry after the delay.
    Throttled(Duration),
    /// The cluster-wide connection ceiling is reached.
    AtCapacity,
}

impl Admission {
    /// Metric label for a non-granted decision.
    pub const fn reason(self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Throttled(_) => "rate_limit",
            Self::AtCapacity => "lease_capacity",
        }
    }
}

/// Decides whether one more backend connection may be opened.
#[async_trait]
pub trait ConnectGate: Send + Sync + std::fmt::Debug {
    /// Check admission given the number of connections this instance
    /// currently has open.
    async fn admit(&self, open_connections: usize) -> Admission;
}

/// A gate that admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenGate;

#[async_trait]
impl ConnectGate for OpenGate {
    async fn admit(&self, _open_connections: usize) -> Admission {
        Admission::Granted
    }
}

/// Composes the distributed rate limiter and connection lease.
#[derive(Debug, Clone)]
pub struct CoordinatedGate {
    limiter: Option<Arc<DistributedRateLimiter>>,
    lease: Option<Arc<LeaseManager>>,
    error_backoff: Duration,
}

impl CoordinatedGate {
    /// Default back-off after a coordination store error.
    pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

    /// A gate with neither component; equivalent to [`OpenGate`].
    pub const fn new() -> Self {
        Self {
            limiter: None,
            lease: None,
            error_backoff: Self::DEFAULT_ERROR_BACKOFF,
        }
    }

    /// Add a rate limiter.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<DistributedRateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Add a lease manager.
    #[must_use]
    pub fn with_lease(mut self, lease: Arc<LeaseManager>) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Set the back-off returned after coordination errors.
    #[must_use]
    pub const fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

impl Default for CoordinatedGate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectGate for CoordinatedGate {
    async fn admit(&self, open_connections: usize) -> Admission {
        if let Some(lease) = &self.lease {
            match lease.ensure_capacity(open_connections).await {
                Ok(true) => {}
                Ok(false) => return Admission::AtCapacity,
                Err(e) => {
                    tracing::warn!(error = %e, "lease check failed, deferring connection");
                    return Admission::Throttled(self.error_backoff);
                }
            }
        }
        if let Some(limiter) = &self.limiter {
            match limiter.try_acquire().await {
                Ok(RateDecision::Acquired) => {}
                Ok(RateDecision::Throttled(wait)) => return Admission::Throttled(wait),
                Err(e) => {
                    tracing::warn!(error = %e, "rate limiter unavailable, deferring connection");
                    return Admission::Throttled(self.error_backoff);
                }
            }
        }
        Admission::Granted
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use dsql_core::ManualClock;

    use super::*;
    use crate::lease::LeaseSettings;
    use crate::store::{CoordinationStore, MemoryStore};

    fn parts() -> (Arc<ManualClock>, Arc<dyn CoordinationStore>) {
        let clock = Arc::new(ManualClock::new(0));
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new(clock.clone()));
        (clock, store)
    }

    #[tokio::test]
    async fn open_gate_always_grants() {
        assert_eq!(OpenGate.admit(usize::MAX).await, Admission::Granted);
        assert_eq!(CoordinatedGate::new().admit(0).await, Admission::Granted);
    }

    #[tokio::test]
    async fn rate_limit_throttles() {
        let (clock, store) = parts();
        let limiter =
            DistributedRateLimiter::new(store, clock, "dsql", "ep", 1, 1).unwrap();
        let gate = CoordinatedGate::new().with_rate_limiter(Arc::new(limiter));
        assert_eq!(gate.admit(0).await, Admission::Granted);
        assert_eq!(
            gate.admit(1).await,
            Admission::Throttled(Duration::from_secs(1))
        );
    }

    #[tokio::test]
    async fn lease_ceiling_reports_capacity() {
        let (clock, store) = parts();
        let settings = LeaseSettings {
            prefix: "dsql".to_owned(),
            endpoint: "ep".to_owned(),
            block_size: 2,
            block_count: 1,
            ttl: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
        };
        let lease = LeaseManager::new(store, clock, settings).unwrap();
        let gate = CoordinatedGate::new().with_lease(Arc::new(lease));
        assert_eq!(gate.admit(0).await, Admission::Granted);
        assert_eq!(gate.admit(1).await, Admission::Granted);
        assert_eq!(gate.admit(2).await, Admission::AtCapacity);
    }

    #[tokio::test]
    async fn at_capacity_consumes_no_rate_token() {
        let (clock, store) = parts();
        let settings = LeaseSettings {
            prefix: "dsql".to_owned(),
            endpoint: "ep".to_owned(),
            block_size: 1,
            block_count: 1,
            ttl: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
        };
        let lease = Arc::new(LeaseManager::new(Arc::clone(&store), clock.clone(), settings).unwrap());
        let limiter = Arc::new(
            DistributedRateLimiter::new(Arc::clone(&store), clock, "dsql", "ep", 1, 2).unwrap(),
        );
        let gate = CoordinatedGate::new()
            .with_lease(lease)
            .with_rate_limiter(Arc::clone(&limiter));
        assert_eq!(gate.admit(0).await, Admission::Granted);
        assert_eq!(gate.admit(1).await, Admission::AtCapacity);
        // One of two tokens left.
        assert_eq!(limiter.try_acquire().await.unwrap(), RateDecision::Acquired);
    }

    #[test]
    fn reasons_are_stable() {
        assert_eq!(Admission::AtCapacity.reason(), "lease_capacity");
        assert_eq!(Admission::Throttled(Duration::ZERO).reason(), "rate_limit");
    }
}
