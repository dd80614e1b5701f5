//! Prometheus instruments for the compatibility layer.
//!
//! A single [`Metrics`] handle is created at startup and cloned into every
//! component. Each component records through the `record_*` / `set_*`
//! methods; the service binary serves [`Metrics::encode_text`] on
//! `/metrics`.

use std::sync::Arc;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Buckets for connection establishment latency (seconds).
const CONNECT_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Buckets for logical transaction duration, retries included (seconds).
const TX_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Metrics handle containing all instruments.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Reservoir
    reservoir_size: IntGauge,
    reservoir_target: IntGauge,
    reservoir_checkouts: IntCounter,
    reservoir_empty_checkouts: IntCounter,
    reservoir_discards: IntCounterVec,
    reservoir_refills: IntCounter,
    reservoir_refill_failures: IntCounter,
    reservoir_throttled: IntCounterVec,
    connect_duration: Histogram,

    // Pool
    pool_open: IntGauge,
    pool_closed_max_idle_time: IntCounter,

    // Transactions
    tx_attempts: IntCounterVec,
    tx_conflicts: IntCounterVec,
    tx_retries_exhausted: IntCounterVec,
    tx_condition_failures: IntCounterVec,
    tx_duration: HistogramVec,

    // Coordination
    rate_limiter_acquired: IntCounterVec,
    lease_blocks_held: IntGauge,
    lease_events: IntCounterVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

/// Register a metric, logging on failure.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

fn gauge_value(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl Metrics {
    /// Create all instruments in a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns a [`prometheus::Error`] if an instrument definition is invalid.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Reservoir
        let reservoir_size = register(
            &registry,
            IntGauge::new("dsql_reservoir_size", "Ready connections in the reservoir")?,
        );
        let reservoir_target = register(
            &registry,
            IntGauge::new("dsql_reservoir_target", "Desired ready connections")?,
        );
        let reservoir_checkouts = register(
            &registry,
            IntCounter::new(
                "dsql_reservoir_checkouts_total",
                "Connections handed out by the reservoir",
            )?,
        );
        let reservoir_empty_checkouts = register(
            &registry,
            IntCounter::new(
                "dsql_reservoir_empty_checkouts_total",
                "Checkouts that found no usable ready connection",
            )?,
        );
        let reservoir_discards = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "dsql_reservoir_discards_total",
                    "Connections closed instead of handed out or reused",
                ),
                &["reason"],
            )?,
        );
        let reservoir_refills = register(
            &registry,
            IntCounter::new(
                "dsql_reservoir_refills_total",
                "Connections added to the reservoir by the refiller",
            )?,
        );
        let reservoir_refill_failures = register(
            &registry,
            IntCounter::new(
                "dsql_reservoir_refill_failures_total",
                "Failed refiller connection attempts",
            )?,
        );
        let reservoir_throttled = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "dsql_reservoir_throttled_total",
                    "Connection creations deferred by the connect gate",
                ),
                &["reason"],
            )?,
        );
        let connect_duration = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new(
                    "dsql_connect_duration_seconds",
                    "Time to establish and initialize a backend connection",
                )
                .buckets(CONNECT_BUCKETS.to_vec()),
            )?,
        );

        // Pool
        let pool_open = register(
            &registry,
            IntGauge::new("dsql_pool_open", "Open connections owned by the pool")?,
        );
        let pool_closed_max_idle_time = register(
            &registry,
            IntCounter::new(
                "dsql_pool_closed_max_idle_time_total",
                "Pooled connections closed after exceeding the idle timeout",
            )?,
        );

        // Transactions
        let tx_attempts = register(
            &registry,
            IntCounterVec::new(
                Opts::new("dsql_tx_attempts_total", "Transaction body invocations"),
                &["operation"],
            )?,
        );
        let tx_conflicts = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "dsql_tx_conflicts_total",
                    "Serialization conflicts observed by the retry executor",
                ),
                &["operation"],
            )?,
        );
        let tx_retries_exhausted = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "dsql_tx_retries_exhausted_total",
                    "Transactions that failed after the final attempt",
                ),
                &["operation"],
            )?,
        );
        let tx_condition_failures = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "dsql_tx_condition_failures_total",
                    "Transactions whose conditional write lost",
                ),
                &["operation"],
            )?,
        );
        let tx_duration = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "dsql_tx_duration_seconds",
                    "Logical transaction duration including retries",
                )
                .buckets(TX_BUCKETS.to_vec()),
                &["operation"],
            )?,
        );

        // Coordination
        let rate_limiter_acquired = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "dsql_rate_limiter_acquired_total",
                    "Rate limiter decisions by outcome",
                ),
                &["outcome"],
            )?,
        );
        let lease_blocks_held = register(
            &registry,
            IntGauge::new("dsql_lease_blocks_held", "Lease blocks held by this instance")?,
        );
        let lease_events = register(
            &registry,
            IntCounterVec::new(
                Opts::new("dsql_lease_events_total", "Lease lifecycle events"),
                &["event"],
            )?,
        );

        Ok(Self {
            registry: Arc::new(registry),
            reservoir_size,
            reservoir_target,
            reservoir_checkouts,
            reservoir_empty_checkouts,
            reservoir_discards,
            reservoir_refills,
            reservoir_refill_failures,
            reservoir_throttled,
            connect_duration,
            pool_open,
            pool_closed_max_idle_time,
            tx_attempts,
            tx_conflicts,
            tx_retries_exhausted,
            tx_condition_failures,
            tx_duration,
            rate_limiter_acquired,
            lease_blocks_held,
            lease_events,
        })
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns a [`prometheus::Error`] if encoding fails.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }

    // -------------------------------------------------------------------------
    // Reservoir
    // -------------------------------------------------------------------------

    /// Set the current ready count.
    pub fn set_reservoir_size(&self, size: usize) {
        self.reservoir_size.set(gauge_value(size));
    }

    /// Set the desired ready count.
    pub fn set_reservoir_target(&self, target: usize) {
        self.reservoir_target.set(gauge_value(target));
    }

    /// Record a checkout served from the ready set.
    pub fn record_checkout(&self) {
        self.reservoir_checkouts.inc();
    }

    /// Record a checkout that had to create a connection synchronously.
    pub fn record_empty_checkout(&self) {
        self.reservoir_empty_checkouts.inc();
    }

    /// Record a discarded connection.
    pub fn record_discard(&self, reason: &str) {
        self.reservoir_discards.with_label_values(&[reason]).inc();
    }

    /// Record a successful refill.
    pub fn record_refill(&self) {
        self.reservoir_refills.inc();
    }

    /// Record a failed refill attempt.
    pub fn record_refill_failure(&self) {
        self.reservoir_refill_failures.inc();
    }

    /// Record a creation deferred by the connect gate.
    pub fn record_throttled(&self, reason: &str) {
        self.reservoir_throttled.with_label_values(&[reason]).inc();
    }

    /// Record connection establishment latency.
    pub fn record_connect_duration(&self, elapsed: Duration) {
        self.connect_duration.observe(elapsed.as_secs_f64());
    }

    // -------------------------------------------------------------------------
    // Pool
    // -------------------------------------------------------------------------

    /// Set the number of open pooled connections.
    pub fn set_pool_open(&self, open: usize) {
        self.pool_open.set(gauge_value(open));
    }

    /// Record a pooled connection closed for idleness.
    pub fn record_closed_max_idle_time(&self) {
        self.pool_closed_max_idle_time.inc();
    }

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    /// Record one body invocation.
    pub fn record_tx_attempt(&self, operation: &str) {
        self.tx_attempts.with_label_values(&[operation]).inc();
    }

    /// Record a serialization conflict.
    pub fn record_tx_conflict(&self, operation: &str) {
        self.tx_conflicts.with_label_values(&[operation]).inc();
    }

    /// Record a transaction that ran out of attempts.
    pub fn record_tx_retries_exhausted(&self, operation: &str) {
        self.tx_retries_exhausted.with_label_values(&[operation]).inc();
    }

    /// Record a lost conditional write.
    pub fn record_tx_condition_failure(&self, operation: &str) {
        self.tx_condition_failures
            .with_label_values(&[operation])
            .inc();
    }

    /// Record total logical transaction duration.
    pub fn record_tx_duration(&self, operation: &str, elapsed: Duration) {
        self.tx_duration
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    // -------------------------------------------------------------------------
    // Coordination
    // -------------------------------------------------------------------------

    /// Record a rate limiter decision (`acquired`, `throttled`, `error`).
    pub fn record_rate_limit(&self, outcome: &str) {
        self.rate_limiter_acquired
            .with_label_values(&[outcome])
            .inc();
    }

    /// Set the number of lease blocks held.
    pub fn set_lease_blocks_held(&self, held: usize) {
        self.lease_blocks_held.set(gauge_value(held));
    }

    /// Record a lease event (`acquired`, `renewed`, `lost`, `released`, `exhausted`).
    pub fn record_lease_event(&self, event: &str) {
        self.lease_events.with_label_values(&[event]).inc();
    }
}
