//! Idle-reuse pool over the reservoir.
//!
//! A connection taken from the [`Reservoir`] serves many transactions until
//! its negotiated lifetime or the idle timeout runs out. The pool bounds
//! concurrently open connections with a semaphore; waiting for a permit is
//! limited by the acquire timeout.
//!
//! A [`PooledConnection`] goes back to the idle set when dropped, unless it
//! was marked broken, entered the guard window, still has a transaction
//! open, or the pool was closed. Those are closed instead. Every acquire
//! sweeps the whole idle set, and [`DsqlPool::run_reaper`] sweeps it
//! periodically when no acquires arrive.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dsql_core::Metrics;
use dsql_core::config::PoolConfig;
use sqlx::PgConnection;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::time::Instant;

use crate::error::DsqlError;
use crate::factory::ConnectionFactory;
use crate::reservoir::{DiscardReason, Reservoir, ReservoirConnection};
use crate::retry::TransactionSource;

/// How often [`DsqlPool::drain`] checks for released connections.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Pool sizing parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum concurrently open connections.
    pub max_connections: usize,
    /// Idle time after which a returned connection is closed.
    pub idle_timeout: Duration,
    /// Maximum wait for a free slot.
    pub acquire_timeout: Duration,
}

impl From<&PoolConfig> for PoolSettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_connections: config.max_connections.max(1),
            idle_timeout: config.idle_timeout(),
            acquire_timeout: config.acquire_timeout(),
        }
    }
}

struct IdleConnection<C> {
    conn: ReservoirConnection<C>,
    idle_since: Instant,
}

struct PoolInner<F: ConnectionFactory> {
    reservoir: Arc<Reservoir<F>>,
    idle: Mutex<Vec<IdleConnection<F::Connection>>>,
    permits: Arc<Semaphore>,
    open: AtomicUsize,
    settings: PoolSettings,
    metrics: Option<Metrics>,
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<IdleConnection<F::Connection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn adjust_open(&self, opened: bool) {
        let open = if opened {
            self.open.fetch_add(1, Ordering::AcqRel).saturating_add(1)
        } else {
            self.open
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .map_or(0, |prev| prev.saturating_sub(1))
        };
        if let Some(metrics) = &self.metrics {
            metrics.set_pool_open(open);
        }
    }

    /// Close every idle connection past the idle timeout or inside the
    /// guard window. Returns how many were closed.
    async fn sweep_idle(&self) -> usize {
        let guard = self.reservoir.settings().guard_window;
        let now = Instant::now();
        let expired: Vec<_> = {
            let mut idle = self.lock_idle();
            let mut expired = Vec::new();
            let mut keep = Vec::with_capacity(idle.len());
            for entry in idle.drain(..) {
                if now.saturating_duration_since(entry.idle_since) >= self.settings.idle_timeout {
                    expired.push((entry.conn, DiscardReason::Idle));
                } else if entry.conn.inside_guard(now, guard) {
                    expired.push((entry.conn, DiscardReason::GuardWindow));
                } else {
                    keep.push(entry);
                }
            }
            *idle = keep;
            expired
        };
        let swept = expired.len();
        for (conn, reason) in expired {
            if reason == DiscardReason::Idle {
                if let Some(metrics) = &self.metrics {
                    metrics.record_closed_max_idle_time();
                }
            }
            self.close(conn, reason).await;
        }
        swept
    }

    /// Pop the most recently used idle connection after sweeping.
    async fn take_idle(&self) -> Option<ReservoirConnection<F::Connection>> {
        self.sweep_idle().await;
        self.lock_idle().pop().map(|entry| entry.conn)
    }

    async fn close(&self, conn: ReservoirConnection<F::Connection>, reason: DiscardReason) {
        self.adjust_open(false);
        self.reservoir.discard(conn, reason).await;
    }
}

/// A bounded pool of reusable backend connections.
pub struct DsqlPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for DsqlPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for DsqlPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DsqlPool")
            .field("settings", &self.inner.settings)
            .field("open", &self.open_connections())
            .field("idle", &self.idle_connections())
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> DsqlPool<F> {
    /// Create a pool drawing new connections from `reservoir`.
    pub fn new(reservoir: Arc<Reservoir<F>>, settings: PoolSettings) -> Self {
        Self::with_metrics_opt(reservoir, settings, None)
    }

    /// Create a pool that reports `dsql_pool_*` metrics.
    pub fn with_metrics(reservoir: Arc<Reservoir<F>>, settings: PoolSettings, metrics: Metrics) -> Self {
        Self::with_metrics_opt(reservoir, settings, Some(metrics))
    }

    fn with_metrics_opt(
        reservoir: Arc<Reservoir<F>>,
        settings: PoolSettings,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                reservoir,
                idle: Mutex::new(Vec::new()),
                permits: Arc::new(Semaphore::new(settings.max_connections)),
                open: AtomicUsize::new(0),
                settings,
                metrics,
            }),
        }
    }

    /// Get a connection, reusing an idle one when possible.
    ///
    /// # Errors
    ///
    /// Returns [`DsqlError::PoolTimeout`] if no slot frees up within the
    /// acquire timeout, [`DsqlError::PoolClosed`] after [`close`](Self::close),
    /// or the reservoir's error when a new connection cannot be created.
    pub async fn acquire(&self) -> Result<PooledConnection<F>, DsqlError> {
        let timeout = self.inner.settings.acquire_timeout;
        let permit = tokio::time::timeout(timeout, Arc::clone(&self.inner.permits).acquire_owned())
            .await
            .map_err(|_elapsed| DsqlError::PoolTimeout(timeout))?
            .map_err(|_closed| DsqlError::PoolClosed)?;

        let conn = match self.inner.take_idle().await {
            Some(conn) => conn,
            None => {
                let conn = self.inner.reservoir.checkout().await?;
                self.inner.adjust_open(true);
                conn
            }
        };
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
            broken: false,
            in_transaction: false,
        })
    }

    /// Open connections owned by the pool (idle or in use).
    pub fn open_connections(&self) -> usize {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Idle connections waiting for reuse.
    pub fn idle_connections(&self) -> usize {
        self.inner.lock_idle().len()
    }

    /// The reservoir behind this pool.
    pub fn reservoir(&self) -> &Arc<Reservoir<F>> {
        &self.inner.reservoir
    }

    /// Close idle connections past the idle timeout or inside the guard
    /// window. Returns how many were closed.
    pub async fn sweep_idle(&self) -> usize {
        self.inner.sweep_idle().await
    }

    /// Sweep idle connections every `period` until `shutdown` flips to
    /// `true`.
    pub async fn run_reaper(self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let swept = self.sweep_idle().await;
                    if swept > 0 {
                        tracing::debug!(swept, "idle connections reaped");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("idle reaper stopped");
    }

    /// Refuse new acquisitions and close idle connections.
    ///
    /// Connections still checked out are closed when they are released.
    pub async fn close(&self) {
        self.inner.permits.close();
        let idle: Vec<_> = self.inner.lock_idle().drain(..).collect();
        for entry in idle {
            self.inner.close(entry.conn, DiscardReason::Shutdown).await;
        }
        tracing::info!("connection pool closed");
    }

    /// Close the pool and its reservoir, then wait up to `timeout` for
    /// checked-out connections to be released and closed.
    ///
    /// On return no connection can be opened through this pool. Returns
    /// `false` if connections were still open at the deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.close().await;
        self.inner.reservoir.shutdown().await;
        let reservoir = &self.inner.reservoir;
        let drained = tokio::time::timeout(timeout, async {
            while reservoir.live_connections() > 0 {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await
        .is_ok();
        if drained {
            tracing::info!("all backend connections closed");
        } else {
            tracing::warn!(
                live = reservoir.live_connections(),
                "connections still open after drain timeout"
            );
        }
        drained
    }
}

/// A connection on loan from a [`DsqlPool`].
pub struct PooledConnection<F: ConnectionFactory> {
    conn: Option<ReservoirConnection<F::Connection>>,
    pool: Arc<PoolInner<F>>,
    _permit: OwnedSemaphorePermit,
    broken: bool,
    in_transaction: bool,
}

impl<F: ConnectionFactory> std::fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("broken", &self.broken)
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> PooledConnection<F> {
    /// The underlying connection.
    ///
    /// # Errors
    ///
    /// Returns [`DsqlError::ConnectionReleased`] if the connection was
    /// already given back.
    pub fn connection_mut(&mut self) -> Result<&mut F::Connection, DsqlError> {
        self.conn
            .as_mut()
            .map(ReservoirConnection::connection_mut)
            .ok_or(DsqlError::ConnectionReleased)
    }

    /// Lifetime left on the connection.
    pub fn remaining(&self) -> Duration {
        self.conn
            .as_ref()
            .map_or(Duration::ZERO, |c| c.remaining_at(Instant::now()))
    }

    /// Close the connection on release instead of reusing it.
    pub const fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Whether the connection will be closed on release.
    pub const fn is_broken(&self) -> bool {
        self.broken
    }

    /// Record whether a transaction is open on the connection.
    pub const fn set_in_transaction(&mut self, open: bool) {
        self.in_transaction = open;
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let guard = self.pool.reservoir.settings().guard_window;
        let reason = if self.broken {
            Some(DiscardReason::Error)
        } else if self.pool.permits.is_closed() {
            Some(DiscardReason::Shutdown)
        } else if self.in_transaction {
            Some(DiscardReason::OpenTransaction)
        } else if conn.inside_guard(Instant::now(), guard) {
            Some(DiscardReason::GuardWindow)
        } else {
            None
        };

        let Some(reason) = reason else {
            self.pool.lock_idle().push(IdleConnection {
                conn,
                idle_since: Instant::now(),
            });
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(&self.pool);
                handle.spawn(async move { pool.close(conn, reason).await });
            }
            Err(_no_runtime) => {
                self.pool.adjust_open(false);
                drop(conn);
            }
        }
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// A transaction on a pooled connection, driven with explicit
/// `BEGIN` / `COMMIT` / `ROLLBACK`.
#[derive(Debug)]
pub struct DsqlTransaction<F: ConnectionFactory<Connection = PgConnection>> {
    conn: PooledConnection<F>,
}

impl<F: ConnectionFactory<Connection = PgConnection>> DsqlTransaction<F> {
    /// The connection to run statements on.
    ///
    /// # Errors
    ///
    /// Returns [`DsqlError::ConnectionReleased`] if the connection is gone.
    pub fn connection(&mut self) -> Result<&mut PgConnection, DsqlError> {
        self.conn.connection_mut()
    }

    /// Mark the connection unusable after a transport-level failure.
    pub const fn mark_broken(&mut self) {
        self.conn.mark_broken();
    }
}

/// Access to the `PostgreSQL` connection behind an open transaction.
pub trait PgTransaction: Send {
    /// The connection to run statements on.
    ///
    /// # Errors
    ///
    /// Returns [`DsqlError::ConnectionReleased`] if the connection is gone.
    fn pg(&mut self) -> Result<&mut PgConnection, DsqlError>;
}

impl<F: ConnectionFactory<Connection = PgConnection>> PgTransaction for DsqlTransaction<F> {
    fn pg(&mut self) -> Result<&mut PgConnection, DsqlError> {
        self.connection()
    }
}

async fn run_control<F: ConnectionFactory<Connection = PgConnection>>(
    conn: &mut PooledConnection<F>,
    statement: &'static str,
) -> Result<(), DsqlError> {
    let result = sqlx::query(statement).execute(conn.connection_mut()?).await;
    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            let err = DsqlError::from(e);
            if err.breaks_connection() {
                conn.mark_broken();
            }
            Err(err)
        }
    }
}

#[async_trait]
impl<F: ConnectionFactory<Connection = PgConnection>> TransactionSource for DsqlPool<F> {
    type Tx = DsqlTransaction<F>;
    type Error = DsqlError;

    async fn begin(&self) -> Result<DsqlTransaction<F>, DsqlError> {
        let mut conn = self.acquire().await?;
        run_control(&mut conn, "BEGIN").await?;
        conn.set_in_transaction(true);
        Ok(DsqlTransaction { conn })
    }

    async fn commit(&self, mut tx: DsqlTransaction<F>) -> Result<(), DsqlError> {
        let result = run_control(&mut tx.conn, "COMMIT").await;
        // A failed COMMIT ends the transaction server-side as well.
        tx.conn.set_in_transaction(false);
        result
    }

    async fn rollback(&self, mut tx: DsqlTransaction<F>) {
        match run_control(&mut tx.conn, "ROLLBACK").await {
            Ok(()) => tx.conn.set_in_transaction(false),
            Err(e) => {
                tracing::debug!(error = %e, "rollback failed, closing connection");
                tx.conn.mark_broken();
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::reservoir::ReservoirSettings;
    use crate::testing::FakeFactory;

    fn reservoir(factory: &FakeFactory, lifetime_secs: u64) -> Arc<Reservoir<FakeFactory>> {
        Arc::new(
            Reservoir::builder(
                factory.clone(),
                ReservoirSettings {
                    enabled: false,
                    target_ready: 0,
                    max_in_flight: 1,
                    base_lifetime: Duration::from_secs(lifetime_secs),
                    lifetime_jitter: Duration::ZERO,
                    guard_window: Duration::from_secs(45),
                    refill_interval: Duration::from_millis(100),
                },
            )
            .build(),
        )
    }

    fn settings(max: usize) -> PoolSettings {
        PoolSettings {
            max_connections: max,
            idle_timeout: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn returned_connections_are_reused() {
        let factory = FakeFactory::default();
        let pool = DsqlPool::new(reservoir(&factory, 600), settings(2));
        {
            let mut conn = pool.acquire().await.unwrap();
            assert_eq!(*conn.connection_mut().unwrap(), 0);
        }
        assert_eq!(pool.idle_connections(), 1);
        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(*conn.connection_mut().unwrap(), 0);
        assert_eq!(factory.connects(), 1);
        assert_eq!(pool.open_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_at_max_connections() {
        let factory = FakeFactory::default();
        let pool = DsqlPool::new(reservoir(&factory, 600), settings(1));
        let _held = pool.acquire().await.unwrap();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(DsqlError::PoolTimeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_acquire_gets_released_connection() {
        let factory = FakeFactory::default();
        let pool = DsqlPool::new(reservoir(&factory, 600), settings(1));
        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_c| ()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(factory.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_connections_are_closed() {
        let factory = FakeFactory::default();
        let pool = DsqlPool::new(reservoir(&factory, 600), settings(2));
        let mut conn = pool.acquire().await.unwrap();
        conn.mark_broken();
        drop(conn);
        tokio::task::yield_now().await;
        assert_eq!(pool.idle_connections(), 0);
        assert_eq!(factory.closed(), 1);
        assert_eq!(pool.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_transaction_is_not_reused() {
        let factory = FakeFactory::default();
        let pool = DsqlPool::new(reservoir(&factory, 600), settings(2));
        let mut conn = pool.acquire().await.unwrap();
        conn.set_in_transaction(true);
        drop(conn);
        tokio::task::yield_now().await;
        assert_eq!(pool.idle_connections(), 0);
        assert_eq!(factory.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_closes_connection() {
        let factory = FakeFactory::default();
        let metrics = Metrics::new().unwrap();
        let pool = DsqlPool::with_metrics(reservoir(&factory, 600), settings(2), metrics.clone());
        drop(pool.acquire().await.unwrap());
        tokio::time::advance(Duration::from_secs(61)).await;
        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(*conn.connection_mut().unwrap(), 1);
        assert_eq!(factory.closed(), 1);
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("dsql_pool_closed_max_idle_time_total 1"));
        assert!(text.contains("dsql_pool_open 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn connections_near_end_of_life_are_not_reused() {
        let factory = FakeFactory::default();
        // 100s lifetime, 45s guard window.
        let pool = DsqlPool::new(reservoir(&factory, 100), settings(2));
        let conn = pool.acquire().await.unwrap();
        tokio::time::advance(Duration::from_secs(56)).await;
        drop(conn);
        tokio::task::yield_now().await;
        assert_eq!(pool.idle_connections(), 0);
        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(*conn.connection_mut().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_sweeps_stale_connections_below_the_top() {
        let factory = FakeFactory::default();
        let pool = DsqlPool::new(reservoir(&factory, 600), settings(3));
        let older = pool.acquire().await.unwrap();
        let newer = pool.acquire().await.unwrap();
        drop(older);
        tokio::time::advance(Duration::from_secs(40)).await;
        drop(newer);
        tokio::time::advance(Duration::from_secs(25)).await;

        // Idle 65s and 25s: the older one is reaped even though the newer
        // one is on top of the stack.
        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(*conn.connection_mut().unwrap(), 1);
        assert_eq!(factory.closed(), 1);
        assert_eq!(pool.idle_connections(), 0);
        assert_eq!(pool.open_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_closes_idle_connections_without_acquires() {
        let factory = FakeFactory::default();
        let pool = DsqlPool::new(reservoir(&factory, 600), settings(2));
        drop(pool.acquire().await.unwrap());
        let (stop, stopped) = watch::channel(false);
        let reaper = tokio::spawn(pool.clone().run_reaper(Duration::from_secs(1), stopped));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(pool.idle_connections(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(pool.idle_connections(), 0);
        assert_eq!(pool.open_connections(), 0);
        assert_eq!(factory.closed(), 1);

        stop.send(true).unwrap();
        reaper.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_checked_out_connections() {
        let factory = FakeFactory::default();
        let pool = DsqlPool::new(reservoir(&factory, 600), settings(2));
        let held = pool.acquire().await.unwrap();

        let drain = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.drain(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!drain.is_finished());
        assert_eq!(pool.reservoir().live_connections(), 1);

        // Released after close: closed, not parked in the idle set.
        drop(held);
        assert!(drain.await.unwrap());
        assert_eq!(pool.idle_connections(), 0);
        assert_eq!(pool.reservoir().live_connections(), 0);
        assert_eq!(factory.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_at_timeout() {
        let factory = FakeFactory::default();
        let pool = DsqlPool::new(reservoir(&factory, 600), settings(2));
        let _held = pool.acquire().await.unwrap();
        assert!(!pool.drain(Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_pool_refuses_acquire() {
        let factory = FakeFactory::default();
        let pool = DsqlPool::new(reservoir(&factory, 600), settings(2));
        drop(pool.acquire().await.unwrap());
        pool.close().await;
        assert_eq!(factory.closed(), 1);
        assert!(matches!(pool.acquire().await, Err(DsqlError::PoolClosed)));
    }
}
