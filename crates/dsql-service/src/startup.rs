//! Wiring the data layer together from configuration.
//!
//! ```text
//! TokenProvider --> PgConnectionFactory --> Reservoir --> DsqlPool --> RetryExecutor
//!                                              ^
//!                          ConnectGate --------+
//!                 (rate limiter + lease, via the coordination store)
//! ```

use std::sync::Arc;
use std::time::Duration;

use dsql_coordination::{
    ConnectGate, CoordinatedGate, CoordinationStore, DistributedRateLimiter, LeaseManager,
    LeaseSettings, OpenGate, RedisStore,
};
use dsql_core::config::{AuthMode, ConnectionConfig, LoggingConfig};
use dsql_core::{Clock, DsqlConfig, Metrics, SystemClock};
use dsql_persistence::{
    ConnectionFactory, DsqlPool, PgConnectionFactory, Reservoir, RetryExecutor, RetryPolicy,
    StaticPassword, TokenProvider, check_connectivity, run_migrations,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::ServiceError;

/// Pool type used by the service.
pub type Pool = DsqlPool<PgConnectionFactory>;

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `logging.level`.
pub fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Build the credential source for `connection.auth`.
///
/// # Errors
///
/// Returns [`ServiceError::Config`] if IAM auth is requested without the
/// `iam-auth` feature, or [`ServiceError::Database`] if the IAM token
/// generator cannot be configured.
#[allow(clippy::unused_async)]
pub async fn token_provider(config: &ConnectionConfig) -> Result<Arc<dyn TokenProvider>, ServiceError> {
    match config.auth {
        AuthMode::Static => Ok(Arc::new(StaticPassword::new(
            config.password.clone().unwrap_or_default(),
        ))),
        #[cfg(feature = "iam-auth")]
        AuthMode::Iam => {
            let provider = dsql_persistence::IamTokenProvider::from_env(
                &config.endpoint,
                &config.region,
                &config.user,
                config.token_expiry(),
            )
            .await?;
            Ok(Arc::new(provider))
        }
        #[cfg(not(feature = "iam-auth"))]
        AuthMode::Iam => Err(dsql_core::ConfigError::Invalid(
            "connection.auth is iam but the service was built without the iam-auth feature".to_owned(),
        )
        .into()),
    }
}

/// The admission gate and, when enabled, the lease manager behind it.
#[derive(Debug)]
pub struct Coordination {
    /// Gate consulted by the reservoir refiller.
    pub gate: Arc<dyn ConnectGate>,
    /// Lease manager whose renewal loop must run.
    pub lease: Option<Arc<LeaseManager>>,
    /// Store connection to close on shutdown.
    pub store: Option<RedisStore>,
}

/// Build the connect gate from the `rate_limiter` and `lease` sections.
///
/// With both disabled no coordination store is contacted.
///
/// # Errors
///
/// Returns [`ServiceError::Coordination`] if the store is unreachable or a
/// component's settings are invalid.
pub async fn coordination(config: &DsqlConfig, metrics: &Metrics) -> Result<Coordination, ServiceError> {
    if !config.rate_limiter.enabled && !config.lease.enabled {
        info!("rate limiter and lease disabled, connection creation is ungated");
        return Ok(Coordination {
            gate: Arc::new(OpenGate),
            lease: None,
            store: None,
        });
    }

    let redis = RedisStore::connect(&config.coordination.url).await?;
    let store: Arc<dyn CoordinationStore> = Arc::new(redis.clone());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let endpoint = config.connection.endpoint.as_str();
    let mut gate = CoordinatedGate::new();

    if config.rate_limiter.enabled {
        let rl = &config.rate_limiter;
        let limiter = DistributedRateLimiter::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            &rl.table,
            endpoint,
            rl.limit_per_sec,
            rl.capacity,
        )?
        .with_metrics(metrics.clone());
        info!(
            key = limiter.key(),
            limit_per_sec = rl.limit_per_sec,
            capacity = rl.capacity,
            "distributed rate limiter enabled"
        );
        gate = gate.with_rate_limiter(Arc::new(limiter));
    }

    let lease = if config.lease.enabled {
        let settings = LeaseSettings::from_config(&config.lease, endpoint);
        let lease = Arc::new(LeaseManager::new(store, clock, settings)?.with_metrics(metrics.clone()));
        match lease.acquire_block().await? {
            Some(index) => info!(owner = lease.owner(), block = index, "initial lease block acquired"),
            None => warn!(owner = lease.owner(), "no lease block available at startup"),
        }
        gate = gate.with_lease(Arc::clone(&lease));
        Some(lease)
    } else {
        None
    };

    Ok(Coordination {
        gate: Arc::new(gate),
        lease,
        store: Some(redis),
    })
}

/// How long shutdown waits for checked-out connections before releasing
/// lease blocks anyway.
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// A running data layer: reservoir, pool, and background tasks.
#[derive(Debug)]
pub struct Service {
    pool: Pool,
    retry: RetryPolicy,
    metrics: Metrics,
    store: Option<RedisStore>,
    shutdown: watch::Sender<bool>,
    lease_stop: watch::Sender<bool>,
    lease_task: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Close every connection the pool can open, then stop the lease renewal
/// loop, which releases the held blocks.
///
/// Blocks are released only once no connection remains, so no other
/// instance can claim them while this one still has connections open. The
/// reservoir refiller is stopped by the drain, so no block is claimed after
/// the release.
pub async fn drain_then_release<F: ConnectionFactory>(
    pool: &DsqlPool<F>,
    drain_timeout: Duration,
    lease_stop: &watch::Sender<bool>,
    lease_task: Option<JoinHandle<()>>,
) {
    if !pool.drain(drain_timeout).await {
        warn!("releasing lease blocks with connections still open");
    }
    let _ = lease_stop.send_replace(true);
    if let Some(task) = lease_task {
        if let Err(e) = task.await {
            warn!(error = %e, "lease renewal task failed");
        }
    }
}

impl Service {
    /// Build and start every component described by `config`.
    ///
    /// Runs a connectivity check before returning, and the bundled
    /// migrations when `migrate` is set.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] if any component fails to start.
    pub async fn start(config: &DsqlConfig, metrics: Metrics, migrate: bool) -> Result<Self, ServiceError> {
        let tokens = token_provider(&config.connection).await?;
        let factory =
            PgConnectionFactory::from_config(&config.connection, tokens).with_metrics(metrics.clone());
        info!(
            endpoint = %config.connection.endpoint,
            user = %config.connection.user,
            search_path = factory.search_path(),
            "connection factory configured"
        );

        let coordination = coordination(config, &metrics).await?;
        let reservoir = Arc::new(
            Reservoir::builder(factory, (&config.reservoir).into())
                .with_gate(coordination.gate)
                .with_metrics(metrics.clone())
                .build(),
        );
        reservoir.start();

        let pool = DsqlPool::with_metrics(reservoir, (&config.pool).into(), metrics.clone());

        let (shutdown, _) = watch::channel(false);
        let (lease_stop, _) = watch::channel(false);
        let lease_task = coordination
            .lease
            .map(|lease| tokio::spawn(lease.run_renewal(lease_stop.subscribe())));
        let tasks = vec![tokio::spawn(
            pool.clone()
                .run_reaper(config.reservoir.refill_interval(), shutdown.subscribe()),
        )];

        let service = Self {
            pool,
            retry: (&config.retry).into(),
            metrics,
            store: coordination.store,
            shutdown,
            lease_stop,
            lease_task,
            tasks,
        };

        {
            let mut conn = service.pool.acquire().await?;
            let now = check_connectivity(conn.connection_mut()?).await?;
            info!(server_time = %now, "backend connectivity verified");
            if migrate {
                run_migrations(conn.connection_mut()?).await?;
            }
        }
        Ok(service)
    }

    /// The connection pool.
    pub const fn pool(&self) -> &Pool {
        &self.pool
    }

    /// A retry executor over the pool.
    pub fn executor(&self) -> RetryExecutor<Pool> {
        RetryExecutor::new(self.pool.clone(), self.retry.clone()).with_metrics(self.metrics.clone())
    }

    /// A receiver that flips to `true` when shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop background tasks, close connections, then release lease
    /// blocks.
    pub async fn shutdown(self) {
        info!("shutting down");
        let _ = self.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed");
            }
        }
        drain_then_release(&self.pool, SHUTDOWN_DRAIN_TIMEOUT, &self.lease_stop, self.lease_task).await;
        if let Some(store) = self.store {
            if let Err(e) = store.close().await {
                warn!(error = %e, "error closing coordination store");
            }
        }
        info!("shutdown complete");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use dsql_coordination::MemoryStore;
    use dsql_core::ManualClock;
    use dsql_persistence::{DsqlError, PoolSettings, ReservoirSettings};

    use super::*;

    /// Connections are sequence numbers.
    #[derive(Debug, Default)]
    struct CountingFactory {
        next: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionFactory for CountingFactory {
        type Connection = usize;

        async fn connect(&self) -> Result<usize, DsqlError> {
            Ok(self.next.fetch_add(1, Ordering::AcqRel))
        }
    }

    fn lease(store: &Arc<dyn CoordinationStore>, clock: &Arc<ManualClock>, owner: &str) -> Arc<LeaseManager> {
        let settings = LeaseSettings {
            prefix: "dsql".to_owned(),
            endpoint: "cluster-a".to_owned(),
            block_size: 10,
            block_count: 1,
            ttl: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
        };
        Arc::new(
            LeaseManager::new(Arc::clone(store), clock.clone(), settings)
                .unwrap()
                .with_owner(owner),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn lease_blocks_outlive_open_connections() {
        let clock = Arc::new(ManualClock::new(0));
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new(clock.clone()));
        let a = lease(&store, &clock, "a");
        let b = lease(&store, &clock, "b");
        assert_eq!(a.acquire_block().await.unwrap(), Some(0));

        let reservoir = Arc::new(
            Reservoir::builder(
                CountingFactory::default(),
                ReservoirSettings {
                    enabled: true,
                    target_ready: 2,
                    max_in_flight: 2,
                    base_lifetime: Duration::from_secs(600),
                    lifetime_jitter: Duration::ZERO,
                    guard_window: Duration::from_secs(45),
                    refill_interval: Duration::from_millis(100),
                },
            )
            .with_gate(Arc::new(CoordinatedGate::new().with_lease(Arc::clone(&a))))
            .build(),
        );
        reservoir.start();
        let pool = DsqlPool::new(
            reservoir,
            PoolSettings {
                max_connections: 4,
                idle_timeout: Duration::from_secs(60),
                acquire_timeout: Duration::from_secs(1),
            },
        );
        let held = pool.acquire().await.unwrap();

        let (lease_stop, lease_rx) = watch::channel(false);
        let lease_task = tokio::spawn(Arc::clone(&a).run_renewal(lease_rx));
        let stopping = {
            let pool = pool.clone();
            tokio::spawn(async move {
                drain_then_release(&pool, Duration::from_secs(30), &lease_stop, Some(lease_task)).await;
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!stopping.is_finished());
        // A connection is still open, so the block must stay ours.
        assert_eq!(b.acquire_block().await.unwrap(), None);
        assert_eq!(a.held_blocks(), vec![0]);

        drop(held);
        stopping.await.unwrap();
        assert_eq!(pool.reservoir().live_connections(), 0);
        assert_eq!(a.capacity(), 0);
        assert_eq!(b.acquire_block().await.unwrap(), Some(0));
    }
}
