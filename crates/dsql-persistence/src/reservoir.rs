//! Warm buffer of ready connections.
//!
//! The backend caps how fast new connections may be opened cluster-wide, so
//! the request path must never wait on that limit. A background refiller
//! keeps up to `target_ready` authenticated connections waiting; checkout
//! pops one without touching the network.
//!
//! # Slot lifecycle
//!
//! ```text
//! Creating --(factory ok)--> Ready --(checkout, lifetime ok)--> CheckedOut
//!                              |
//!                              +--(inside guard window / error / evict)--> Discarded
//! ```
//!
//! Every connection gets a negotiated lifetime of `base ± uniform jitter`
//! at creation. A slot is never handed out with less than `guard_window`
//! left, and discarded slots are never re-queued; the refiller notices the
//! gap on its next pass.
//!
//! When no eligible slot is ready, checkout creates a connection
//! synchronously. The connect gate is still consulted so the rate limiter
//! and lease see the connection, but its decision is advisory: the caller
//! always gets a connection, and a denial is logged and counted. Under a
//! burst this path can therefore exceed the rate limit and the lease
//! ceiling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dsql_coordination::{Admission, ConnectGate, OpenGate};
use dsql_core::Metrics;
use dsql_core::config::ReservoirConfig;
use futures::future::join_all;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::DsqlError;
use crate::factory::ConnectionFactory;

/// Why a connection was closed instead of being handed out or reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscardReason {
    /// Remaining lifetime fell inside the guard window.
    GuardWindow,
    /// An operation on the connection failed at the transport level.
    Error,
    /// Idle in the pool longer than the idle timeout.
    Idle,
    /// Returned with a transaction still open.
    OpenTransaction,
    /// Explicitly evicted by the caller.
    Evicted,
    /// The reservoir is shutting down.
    Shutdown,
}

impl DiscardReason {
    /// Metric label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GuardWindow => "guard_window",
            Self::Error => "error",
            Self::Idle => "idle",
            Self::OpenTransaction => "open_transaction",
            Self::Evicted => "evicted",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Reservoir sizing and lifetime parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservoirSettings {
    /// Run the background refiller. When `false` every checkout creates a
    /// connection on demand.
    pub enabled: bool,
    /// Desired ready connections.
    pub target_ready: usize,
    /// Maximum concurrent creations per refill pass.
    pub max_in_flight: usize,
    /// Base connection lifetime.
    pub base_lifetime: Duration,
    /// Uniform jitter applied to the lifetime in either direction.
    pub lifetime_jitter: Duration,
    /// Minimum remaining lifetime at handoff.
    pub guard_window: Duration,
    /// Refiller poll period.
    pub refill_interval: Duration,
}

impl From<&ReservoirConfig> for ReservoirSettings {
    fn from(config: &ReservoirConfig) -> Self {
        Self {
            enabled: config.enabled,
            target_ready: config.target_ready,
            max_in_flight: config.max_in_flight.max(1),
            base_lifetime: config.base_lifetime(),
            lifetime_jitter: config.lifetime_jitter(),
            guard_window: config.guard_window(),
            refill_interval: config.refill_interval(),
        }
    }
}

impl ReservoirSettings {
    /// Draw a lifetime from `base ± uniform(jitter)`.
    pub fn draw_lifetime(&self) -> Duration {
        let jitter_ms = u64::try_from(self.lifetime_jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return self.base_lifetime;
        }
        let offset = rand::rng().random_range(0..=jitter_ms.saturating_mul(2));
        self.base_lifetime
            .saturating_sub(self.lifetime_jitter)
            .saturating_add(Duration::from_millis(offset))
    }
}

/// Decrements the live-connection count when the connection is dropped.
#[derive(Debug)]
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(live))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// A connection created by the reservoir, with its negotiated lifetime.
#[derive(Debug)]
pub struct ReservoirConnection<C> {
    conn: C,
    created_at: Instant,
    expires_at: Instant,
    _live: LiveGuard,
}

impl<C> ReservoirConnection<C> {
    /// The underlying connection.
    pub const fn connection(&self) -> &C {
        &self.conn
    }

    /// The underlying connection, mutably.
    pub const fn connection_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    /// When the connection was established.
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the connection's negotiated lifetime ends.
    pub const fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Lifetime left at `now`.
    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    /// Whether the remaining lifetime at `now` is inside `guard`.
    pub fn inside_guard(&self, now: Instant, guard: Duration) -> bool {
        self.remaining_at(now) < guard
    }

    fn into_inner(self) -> C {
        self.conn
    }
}

/// Result of one refill pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefillReport {
    /// Connections added.
    pub created: usize,
    /// Creations that failed.
    pub failed: usize,
    /// Ready slots swept out for entering the guard window.
    pub swept: usize,
    /// The gate decision that stopped the pass early, if any.
    pub deferred: Option<Admission>,
}

struct Shared<F: ConnectionFactory> {
    factory: F,
    gate: Arc<dyn ConnectGate>,
    settings: ReservoirSettings,
    ready: Mutex<VecDeque<ReservoirConnection<F::Connection>>>,
    live: Arc<AtomicUsize>,
    metrics: Option<Metrics>,
    shutdown: watch::Sender<bool>,
}

impl<F: ConnectionFactory> Shared<F> {
    fn lock_ready(&self) -> std::sync::MutexGuard<'_, VecDeque<ReservoirConnection<F::Connection>>> {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_size(&self, size: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_reservoir_size(size);
        }
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn create(&self) -> Result<ReservoirConnection<F::Connection>, DsqlError> {
        let conn = self.factory.connect().await?;
        let created_at = Instant::now();
        let lifetime = self.settings.draw_lifetime();
        Ok(ReservoirConnection {
            conn,
            created_at,
            expires_at: created_at.checked_add(lifetime).unwrap_or(created_at),
            _live: LiveGuard::new(&self.live),
        })
    }

    async fn discard(&self, conn: ReservoirConnection<F::Connection>, reason: DiscardReason) {
        if let Some(metrics) = &self.metrics {
            metrics.record_discard(reason.as_str());
        }
        tracing::debug!(reason = reason.as_str(), "discarding connection");
        self.factory.close(conn.into_inner()).await;
    }

    /// Remove ready slots that have entered the guard window.
    fn take_stale(&self, now: Instant) -> Vec<ReservoirConnection<F::Connection>> {
        let guard = self.settings.guard_window;
        let mut ready = self.lock_ready();
        let mut stale = Vec::new();
        let mut keep = VecDeque::with_capacity(ready.len());
        while let Some(slot) = ready.pop_front() {
            if slot.inside_guard(now, guard) {
                stale.push(slot);
            } else {
                keep.push_back(slot);
            }
        }
        *ready = keep;
        self.publish_size(ready.len());
        stale
    }

    async fn refill_once(&self) -> RefillReport {
        let mut report = RefillReport::default();
        if self.is_shut_down() {
            return report;
        }

        let stale = self.take_stale(Instant::now());
        report.swept = stale.len();
        for slot in stale {
            self.discard(slot, DiscardReason::GuardWindow).await;
        }

        let ready = self.lock_ready().len();
        let wanted = self
            .settings
            .target_ready
            .saturating_sub(ready)
            .min(self.settings.max_in_flight);
        if wanted == 0 {
            return report;
        }

        let mut admitted = 0_usize;
        for _ in 0..wanted {
            let open = self.live.load(Ordering::Acquire).saturating_add(admitted);
            match self.gate.admit(open).await {
                Admission::Granted => admitted = admitted.saturating_add(1),
                denied => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_throttled(denied.reason());
                    }
                    tracing::debug!(reason = denied.reason(), "refill deferred by connect gate");
                    report.deferred = Some(denied);
                    break;
                }
            }
        }

        let results = join_all((0..admitted).map(|_| self.create())).await;
        for result in results {
            match result {
                Ok(slot) => {
                    if self.is_shut_down() {
                        self.discard(slot, DiscardReason::Shutdown).await;
                        continue;
                    }
                    let size = {
                        let mut ready = self.lock_ready();
                        ready.push_back(slot);
                        ready.len()
                    };
                    self.publish_size(size);
                    report.created = report.created.saturating_add(1);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_refill();
                    }
                }
                Err(e) => {
                    report.failed = report.failed.saturating_add(1);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_refill_failure();
                    }
                    tracing::warn!(error = %e, "reservoir refill connection failed");
                }
            }
        }
        report
    }
}

/// Builds a [`Reservoir`].
pub struct ReservoirBuilder<F: ConnectionFactory> {
    factory: F,
    settings: ReservoirSettings,
    gate: Arc<dyn ConnectGate>,
    metrics: Option<Metrics>,
}

impl<F: ConnectionFactory> ReservoirBuilder<F> {
    /// Consult `gate` before each background creation.
    #[must_use]
    pub fn with_gate(mut self, gate: Arc<dyn ConnectGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Attach a metrics handle.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the reservoir. The refiller is not started until
    /// [`Reservoir::start`].
    pub fn build(self) -> Reservoir<F> {
        if let Some(metrics) = &self.metrics {
            let target = if self.settings.enabled {
                self.settings.target_ready
            } else {
                0
            };
            metrics.set_reservoir_target(target);
            metrics.set_reservoir_size(0);
        }
        let (shutdown, _) = watch::channel(false);
        Reservoir {
            shared: Arc::new(Shared {
                factory: self.factory,
                gate: self.gate,
                settings: self.settings,
                ready: Mutex::new(VecDeque::new()),
                live: Arc::new(AtomicUsize::new(0)),
                metrics: self.metrics,
                shutdown,
            }),
            refiller: Mutex::new(None),
        }
    }
}

/// A warm buffer of ready backend connections.
pub struct Reservoir<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
    refiller: Mutex<Option<JoinHandle<()>>>,
}

impl<F: ConnectionFactory> std::fmt::Debug for Reservoir<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservoir")
            .field("settings", &self.shared.settings)
            .field("ready", &self.ready_len())
            .field("live", &self.live_connections())
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> Reservoir<F> {
    /// Start building a reservoir over `factory`.
    pub fn builder(factory: F, settings: ReservoirSettings) -> ReservoirBuilder<F> {
        ReservoirBuilder {
            factory,
            settings,
            gate: Arc::new(OpenGate),
            metrics: None,
        }
    }

    /// Spawn the background refiller. Does nothing in on-demand mode or if
    /// already started.
    pub fn start(&self) {
        if !self.shared.settings.enabled {
            tracing::info!("reservoir disabled, connections are created on demand");
            return;
        }
        let mut refiller = self.refiller.lock().unwrap_or_else(PoisonError::into_inner);
        if refiller.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let shutdown = self.shared.shutdown.subscribe();
        *refiller = Some(tokio::spawn(run_refiller(shared, shutdown)));
        tracing::info!(
            target_ready = self.shared.settings.target_ready,
            max_in_flight = self.shared.settings.max_in_flight,
            "reservoir refiller started"
        );
    }

    /// Run one refill pass on the caller's task.
    pub async fn refill_once(&self) -> RefillReport {
        self.shared.refill_once().await
    }

    /// Take a connection with at least `guard_window` lifetime left.
    ///
    /// Ready slots inside the guard window are discarded. If none is
    /// eligible, a connection is created synchronously even when the
    /// connect gate denies it; the denial is only logged and counted.
    ///
    /// # Errors
    ///
    /// Returns [`DsqlError::PoolClosed`] after shutdown, or the factory's
    /// error if synchronous creation fails.
    pub async fn checkout(&self) -> Result<ReservoirConnection<F::Connection>, DsqlError> {
        if self.shared.is_shut_down() {
            return Err(DsqlError::PoolClosed);
        }
        let guard = self.shared.settings.guard_window;
        loop {
            let (slot, size) = {
                let mut ready = self.shared.lock_ready();
                let slot = ready.pop_front();
                (slot, ready.len())
            };
            self.shared.publish_size(size);
            let Some(slot) = slot else { break };
            if slot.inside_guard(Instant::now(), guard) {
                self.shared.discard(slot, DiscardReason::GuardWindow).await;
                continue;
            }
            if let Some(metrics) = &self.shared.metrics {
                metrics.record_checkout();
            }
            return Ok(slot);
        }

        if self.shared.settings.enabled {
            if let Some(metrics) = &self.shared.metrics {
                metrics.record_empty_checkout();
            }
            tracing::warn!("reservoir empty, creating connection synchronously");
        }
        let open = self.shared.live.load(Ordering::Acquire);
        let admission = self.shared.gate.admit(open).await;
        if admission != Admission::Granted {
            if let Some(metrics) = &self.shared.metrics {
                metrics.record_throttled(admission.reason());
            }
            tracing::warn!(
                reason = admission.reason(),
                open,
                "connect gate would have denied synchronous creation, connecting anyway"
            );
        }
        let slot = self.shared.create().await?;
        if let Some(metrics) = &self.shared.metrics {
            metrics.record_checkout();
        }
        Ok(slot)
    }

    /// Close a checked-out connection instead of reusing it.
    pub async fn discard(&self, conn: ReservoirConnection<F::Connection>, reason: DiscardReason) {
        self.shared.discard(conn, reason).await;
    }

    /// Ready connections waiting.
    pub fn ready_len(&self) -> usize {
        self.shared.lock_ready().len()
    }

    /// Connections created by this reservoir and not yet closed, whether
    /// ready or checked out.
    pub fn live_connections(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// The reservoir's settings.
    pub fn settings(&self) -> &ReservoirSettings {
        &self.shared.settings
    }

    /// The connection factory.
    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    /// Stop the refiller and close every ready connection.
    pub async fn shutdown(&self) {
        let _ = self.shared.shutdown.send_replace(true);
        let handle = self
            .refiller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "reservoir refiller task failed");
            }
        }
        let drained: Vec<_> = self.shared.lock_ready().drain(..).collect();
        self.shared.publish_size(0);
        for slot in drained {
            self.shared.discard(slot, DiscardReason::Shutdown).await;
        }
        tracing::info!("reservoir shut down");
    }
}

async fn run_refiller<F: ConnectionFactory>(shared: Arc<Shared<F>>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let report = shared.refill_once().await;
        let pause = match report.deferred {
            Some(Admission::Throttled(wait)) => wait.max(shared.settings.refill_interval),
            _ => shared.settings.refill_interval,
        };
        tokio::select! {
            () = tokio::time::sleep(pause) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("reservoir refiller stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;

    use super::*;
    use crate::testing::FakeFactory;

    fn settings(target: usize, lifetime_secs: u64, guard_secs: u64) -> ReservoirSettings {
        ReservoirSettings {
            enabled: true,
            target_ready: target,
            max_in_flight: target,
            base_lifetime: Duration::from_secs(lifetime_secs),
            lifetime_jitter: Duration::ZERO,
            guard_window: Duration::from_secs(guard_secs),
            refill_interval: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refill_fills_to_target() {
        let reservoir = Reservoir::builder(FakeFactory::default(), settings(3, 600, 45)).build();
        let report = reservoir.refill_once().await;
        assert_eq!(report.created, 3);
        assert_eq!(reservoir.ready_len(), 3);
        assert_eq!(reservoir.live_connections(), 3);
        // Already at target.
        assert_eq!(reservoir.refill_once().await.created, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn max_in_flight_bounds_each_pass() {
        let mut s = settings(5, 600, 45);
        s.max_in_flight = 2;
        let reservoir = Reservoir::builder(FakeFactory::default(), s).build();
        assert_eq!(reservoir.refill_once().await.created, 2);
        assert_eq!(reservoir.refill_once().await.created, 2);
        assert_eq!(reservoir.refill_once().await.created, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn checkout_discards_slots_inside_guard_window() {
        // Lifetime 50s, guard 45s: at t=6s only 44s remain.
        let factory = FakeFactory::default();
        let reservoir = Reservoir::builder(factory.clone(), settings(2, 50, 45)).build();
        reservoir.refill_once().await;
        assert_eq!(factory.connects(), 2);

        tokio::time::advance(Duration::from_secs(6)).await;
        let conn = reservoir.checkout().await.unwrap();

        // Both stale slots discarded, third created synchronously.
        assert_eq!(factory.connects(), 3);
        assert_eq!(factory.closed(), 2);
        assert_eq!(*conn.connection(), 2);
        assert!(conn.remaining_at(Instant::now()) >= Duration::from_secs(45));
        assert_eq!(reservoir.ready_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn checkout_skips_stale_slot_for_fresh_one() {
        let factory = FakeFactory::default();
        let reservoir = Reservoir::builder(factory.clone(), settings(2, 50, 45)).build();
        reservoir.refill_once().await; // slots 0 and 1 at t=0
        let first = reservoir.checkout().await.unwrap();
        assert_eq!(*first.connection(), 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        // 45s left on slot 1: not swept; slot 2 created at t=5.
        assert_eq!(reservoir.refill_once().await.created, 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        let conn = reservoir.checkout().await.unwrap();
        assert_eq!(*conn.connection(), 2);
        assert_eq!(factory.connects(), 3);
        assert_eq!(factory.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_sweeps_slots_entering_guard_window() {
        let factory = FakeFactory::default();
        let reservoir = Reservoir::builder(factory.clone(), settings(1, 50, 45)).build();
        reservoir.refill_once().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        let report = reservoir.refill_once().await;
        assert_eq!(report.swept, 1);
        assert_eq!(report.created, 1);
        assert_eq!(factory.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_checkout_creates_synchronously() {
        let factory = FakeFactory::default();
        let metrics = Metrics::new().unwrap();
        let reservoir = Reservoir::builder(factory.clone(), settings(2, 600, 45))
            .with_metrics(metrics.clone())
            .build();
        let conn = reservoir.checkout().await.unwrap();
        assert_eq!(*conn.connection(), 0);
        assert!(
            metrics
                .encode_text()
                .unwrap()
                .contains("dsql_reservoir_empty_checkouts_total 1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lifetimes_stay_within_jitter() {
        let mut s = settings(1, 3300, 45);
        s.lifetime_jitter = Duration::from_secs(120);
        for _ in 0..200 {
            let lifetime = s.draw_lifetime();
            assert!(lifetime >= Duration::from_secs(3180));
            assert!(lifetime <= Duration::from_secs(3420));
        }
    }

    #[derive(Debug, Default)]
    struct ClosedGate {
        asked: AtomicBool,
    }

    #[async_trait]
    impl ConnectGate for ClosedGate {
        async fn admit(&self, _open: usize) -> Admission {
            self.asked.store(true, Ordering::Release);
            Admission::Throttled(Duration::from_secs(2))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gate_defers_refill_but_not_checkout() {
        let factory = FakeFactory::default();
        let gate = Arc::new(ClosedGate::default());
        let metrics = Metrics::new().unwrap();
        let reservoir = Reservoir::builder(factory.clone(), settings(2, 600, 45))
            .with_gate(gate.clone())
            .with_metrics(metrics.clone())
            .build();
        let report = reservoir.refill_once().await;
        assert!(gate.asked.load(Ordering::Acquire));
        assert_eq!(report.created, 0);
        assert_eq!(report.deferred, Some(Admission::Throttled(Duration::from_secs(2))));

        // Checkout asks the gate but connects despite the denial.
        gate.asked.store(false, Ordering::Release);
        assert!(reservoir.checkout().await.is_ok());
        assert!(gate.asked.load(Ordering::Acquire));
        assert_eq!(factory.connects(), 1);
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("dsql_reservoir_throttled_total{reason=\"rate_limit\"} 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn synchronous_creation_is_counted_by_the_lease() {
        use dsql_coordination::{CoordinatedGate, CoordinationStore, LeaseManager, LeaseSettings, MemoryStore};
        use dsql_core::ManualClock;

        let clock = Arc::new(ManualClock::new(0));
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new(clock.clone()));
        let lease = Arc::new(
            LeaseManager::new(
                store,
                clock,
                LeaseSettings {
                    prefix: "dsql".to_owned(),
                    endpoint: "ep".to_owned(),
                    block_size: 1,
                    block_count: 1,
                    ttl: Duration::from_secs(30),
                    renew_interval: Duration::from_secs(10),
                },
            )
            .unwrap(),
        );
        let gate = Arc::new(CoordinatedGate::new().with_lease(Arc::clone(&lease)));
        let reservoir = Reservoir::builder(FakeFactory::default(), settings(0, 600, 45))
            .with_gate(gate)
            .build();

        let _first = reservoir.checkout().await.unwrap();
        assert_eq!(lease.capacity(), 1);
        // Over the ceiling: still connects.
        let _second = reservoir.checkout().await.unwrap();
        assert_eq!(reservoir.live_connections(), 2);
        assert_eq!(lease.capacity(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_creations_are_counted() {
        let factory = FakeFactory::default();
        factory.fail_next(1);
        let reservoir = Reservoir::builder(factory.clone(), settings(2, 600, 45)).build();
        let report = reservoir.refill_once().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.created, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_refiller_keeps_target_and_stops_on_shutdown() {
        let factory = FakeFactory::default();
        let reservoir = Reservoir::builder(factory.clone(), settings(2, 600, 45)).build();
        reservoir.start();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(reservoir.ready_len(), 2);

        let _conn = reservoir.checkout().await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(reservoir.ready_len(), 2);

        reservoir.shutdown().await;
        assert_eq!(reservoir.ready_len(), 0);
        assert!(matches!(reservoir.checkout().await, Err(DsqlError::PoolClosed)));
        // The checked-out connection is still live.
        assert_eq!(reservoir.live_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_reservoir_creates_on_demand() {
        let factory = FakeFactory::default();
        let mut s = settings(2, 600, 45);
        s.enabled = false;
        let reservoir = Reservoir::builder(factory.clone(), s).build();
        reservoir.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(factory.connects(), 0);
        let _conn = reservoir.checkout().await.unwrap();
        assert_eq!(factory.connects(), 1);
    }
}
