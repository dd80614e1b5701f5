//! Configuration loading and typed config structures.
//!
//! The canonical configuration lives in `dsql-config.yaml`. This module
//! defines strongly-typed structs that mirror the YAML structure, fills in
//! defaults for every omitted field, applies environment overrides for the
//! connection and coordination endpoints, and validates the result.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// An environment override could not be parsed.
    #[error("invalid environment override {name}: {message}")]
    Env {
        /// The environment variable name.
        name: &'static str,
        /// Why the value was rejected.
        message: String,
    },

    /// The configuration is internally inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DsqlConfig {
    /// Backend endpoint and credentials.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Warm connection buffer.
    #[serde(default)]
    pub reservoir: ReservoirConfig,

    /// Idle-reuse pool on top of the reservoir.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Transaction retry policy.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Cross-instance connect-rate coordination.
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,

    /// Cross-instance connection-count ceiling.
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Shared key-value store used by the rate limiter and lease.
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Prometheus endpoint.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DsqlConfig {
    /// Load configuration from a YAML file, then apply environment
    /// overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if it is not valid YAML, and
    /// [`ConfigError::Env`] / [`ConfigError::Invalid`] for bad values.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string, then apply environment
    /// overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if parsing, overriding, or validation fails.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config = Self::parse_without_env(yaml)?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML only; no environment overrides, no validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse_without_env(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not to a mapping.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yml::from_str(yaml)?)
    }

    /// Override connection and coordination settings from a variable
    /// lookup (normally the process environment).
    ///
    /// Recognized variables: `CLUSTER_ENDPOINT`, `CLUSTER_USER`, `REGION`,
    /// `DB_PORT`, `DB_NAME`, `DB_PASSWORD`, `TOKEN_EXPIRY_SECS`,
    /// `DRAGONFLY_URL`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] if a numeric variable does not parse.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("CLUSTER_ENDPOINT") {
            self.connection.endpoint = val;
        }
        if let Some(val) = lookup("CLUSTER_USER") {
            self.connection.user = val;
        }
        if let Some(val) = lookup("REGION") {
            self.connection.region = val;
        }
        if let Some(val) = lookup("DB_NAME") {
            self.connection.database = val;
        }
        if let Some(val) = lookup("DB_PASSWORD") {
            self.connection.password = Some(val);
        }
        if let Some(val) = lookup("DB_PORT") {
            self.connection.port = val.parse().map_err(|e| ConfigError::Env {
                name: "DB_PORT",
                message: format!("{e}"),
            })?;
        }
        if let Some(val) = lookup("TOKEN_EXPIRY_SECS") {
            self.connection.token_expiry_secs = val.parse().map_err(|e| ConfigError::Env {
                name: "TOKEN_EXPIRY_SECS",
                message: format!("{e}"),
            })?;
        }
        if let Some(val) = lookup("DRAGONFLY_URL") {
            self.coordination.url = val;
        }
        Ok(())
    }

    /// Check cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.reservoir;
        let min_lifetime = r.base_lifetime_secs.saturating_sub(r.lifetime_jitter_secs);
        if r.guard_window_secs >= min_lifetime {
            return Err(ConfigError::Invalid(format!(
                "reservoir.guard_window_secs ({}) must be below base_lifetime_secs - lifetime_jitter_secs ({min_lifetime})",
                r.guard_window_secs
            )));
        }
        if r.enabled && r.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "reservoir.max_in_flight must be at least 1".to_owned(),
            ));
        }
        if self.pool.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_connections must be at least 1".to_owned(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_owned(),
            ));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid(format!(
                "retry.jitter ({}) must be in [0, 1)",
                self.retry.jitter
            )));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_owned(),
            ));
        }
        if self.rate_limiter.enabled
            && (self.rate_limiter.limit_per_sec == 0 || self.rate_limiter.capacity == 0)
        {
            return Err(ConfigError::Invalid(
                "rate_limiter.limit_per_sec and rate_limiter.capacity must be positive".to_owned(),
            ));
        }
        if self.lease.enabled {
            if self.lease.block_size == 0 || self.lease.block_count == 0 {
                return Err(ConfigError::Invalid(
                    "lease.block_size and lease.block_count must be positive".to_owned(),
                ));
            }
            if self.lease.renew_interval_secs >= self.lease.ttl_secs {
                return Err(ConfigError::Invalid(format!(
                    "lease.renew_interval_secs ({}) must be below lease.ttl_secs ({})",
                    self.lease.renew_interval_secs, self.lease.ttl_secs
                )));
            }
        }
        Ok(())
    }
}

/// How connection credentials are produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// A fixed password (local `PostgreSQL`).
    #[default]
    Static,
    /// A short-lived IAM token minted per connection attempt.
    Iam,
}

/// Backend endpoint and credential settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionConfig {
    /// Cluster endpoint host name.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// TCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database name.
    #[serde(default = "default_database")]
    pub database: String,

    /// Database user. `admin` gets the admin token and `public` schema.
    #[serde(default = "default_user")]
    pub user: String,

    /// Region used when minting IAM tokens.
    #[serde(default = "default_region")]
    pub region: String,

    /// `search_path` for non-admin users.
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Static password, used when `auth` is `static`.
    #[serde(default)]
    pub password: Option<String>,

    /// Credential mode.
    #[serde(default)]
    pub auth: AuthMode,

    /// Lifetime of minted IAM tokens in seconds.
    #[serde(default = "default_token_expiry_secs")]
    pub token_expiry_secs: u64,

    /// Whether to require TLS.
    #[serde(default = "default_true")]
    pub require_tls: bool,

    /// Per-attempt connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl ConnectionConfig {
    /// Token lifetime as a [`Duration`].
    pub const fn token_expiry(&self) -> Duration {
        Duration::from_secs(self.token_expiry_secs)
    }

    /// Connect timeout as a [`Duration`].
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Whether the configured user is the cluster admin.
    pub fn is_admin(&self) -> bool {
        self.user == "admin"
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            port: default_port(),
            database: default_database(),
            user: default_user(),
            region: default_region(),
            schema: default_schema(),
            password: None,
            auth: AuthMode::default(),
            token_expiry_secs: default_token_expiry_secs(),
            require_tls: true,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Warm connection buffer settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReservoirConfig {
    /// Background pre-creation (`true`) or on-demand creation (`false`).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Desired number of ready connections.
    #[serde(default = "default_target_ready")]
    pub target_ready: usize,

    /// Maximum concurrent connection creations by the refiller.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Base connection lifetime in seconds.
    #[serde(default = "default_base_lifetime_secs")]
    pub base_lifetime_secs: u64,

    /// Uniform jitter applied to the lifetime, in seconds (either direction).
    #[serde(default = "default_lifetime_jitter_secs")]
    pub lifetime_jitter_secs: u64,

    /// Minimum remaining lifetime required at handoff, in seconds.
    #[serde(default = "default_guard_window_secs")]
    pub guard_window_secs: u64,

    /// Refiller poll period in milliseconds.
    #[serde(default = "default_refill_interval_ms")]
    pub refill_interval_ms: u64,
}

impl ReservoirConfig {
    /// Base lifetime as a [`Duration`].
    pub const fn base_lifetime(&self) -> Duration {
        Duration::from_secs(self.base_lifetime_secs)
    }

    /// Lifetime jitter as a [`Duration`].
    pub const fn lifetime_jitter(&self) -> Duration {
        Duration::from_secs(self.lifetime_jitter_secs)
    }

    /// Guard window as a [`Duration`].
    pub const fn guard_window(&self) -> Duration {
        Duration::from_secs(self.guard_window_secs)
    }

    /// Refill interval as a [`Duration`].
    pub const fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }
}

impl Default for ReservoirConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_ready: default_target_ready(),
            max_in_flight: default_max_in_flight(),
            base_lifetime_secs: default_base_lifetime_secs(),
            lifetime_jitter_secs: default_lifetime_jitter_secs(),
            guard_window_secs: default_guard_window_secs(),
            refill_interval_ms: default_refill_interval_ms(),
        }
    }
}

/// Idle-reuse pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PoolConfig {
    /// Maximum concurrently open pool connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle time after which a returned connection is closed, in seconds.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Maximum wait for a free pool slot, in milliseconds.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl PoolConfig {
    /// Idle timeout as a [`Duration`].
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Acquire timeout as a [`Duration`].
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            idle_timeout_secs: default_idle_timeout_secs(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

/// Transaction retry policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryConfig {
    /// Total body invocations allowed per logical transaction.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Jitter fraction: each delay is scaled by a factor in `[1 - j, 1 + j]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl RetryConfig {
    /// Base delay as a [`Duration`].
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Maximum delay as a [`Duration`].
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

/// Distributed rate limiter settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimiterConfig {
    /// Whether connection creation consults the shared bucket.
    #[serde(default)]
    pub enabled: bool,

    /// Key namespace in the coordination store.
    #[serde(default = "default_table")]
    pub table: String,

    /// Refill rate in tokens (connections) per second.
    #[serde(default = "default_limit_per_sec")]
    pub limit_per_sec: u32,

    /// Bucket capacity (maximum burst).
    #[serde(default = "default_limit_per_sec")]
    pub capacity: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            table: default_table(),
            limit_per_sec: default_limit_per_sec(),
            capacity: default_limit_per_sec(),
        }
    }
}

/// Distributed connection lease settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LeaseConfig {
    /// Whether the global connection ceiling is enforced.
    #[serde(default)]
    pub enabled: bool,

    /// Key namespace in the coordination store.
    #[serde(default = "default_table")]
    pub table: String,

    /// Connection slots per block.
    #[serde(default = "default_block_size")]
    pub block_size: u32,

    /// Number of blocks per endpoint (ceiling = `block_size * block_count`).
    #[serde(default = "default_block_count")]
    pub block_count: u32,

    /// Block expiry when not renewed, in seconds.
    #[serde(default = "default_lease_ttl_secs")]
    pub ttl_secs: u64,

    /// Renewal period, in seconds.
    #[serde(default = "default_renew_interval_secs")]
    pub renew_interval_secs: u64,
}

impl LeaseConfig {
    /// TTL as a [`Duration`].
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Renewal interval as a [`Duration`].
    pub const fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_interval_secs)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            table: default_table(),
            block_size: default_block_size(),
            block_count: default_block_count(),
            ttl_secs: default_lease_ttl_secs(),
            renew_interval_secs: default_renew_interval_secs(),
        }
    }
}

/// Coordination store connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CoordinationConfig {
    /// Redis/Dragonfly URL.
    #[serde(default = "default_coordination_url")]
    pub url: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            url: default_coordination_url(),
        }
    }
}

/// Prometheus endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MetricsConfig {
    /// Whether to serve `/metrics`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address for the metrics server.
    #[serde(default = "default_metrics_listen_addr")]
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_metrics_listen_addr(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// =============================================================================
// Defaults
// =============================================================================

fn default_endpoint() -> String {
    "localhost".to_owned()
}

const fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "postgres".to_owned()
}

fn default_user() -> String {
    "admin".to_owned()
}

fn default_region() -> String {
    "us-east-1".to_owned()
}

fn default_schema() -> String {
    "public".to_owned()
}

const fn default_token_expiry_secs() -> u64 {
    30
}

const fn default_connect_timeout_ms() -> u64 {
    5000
}

const fn default_target_ready() -> usize {
    4
}

const fn default_max_in_flight() -> usize {
    2
}

const fn default_base_lifetime_secs() -> u64 {
    3300
}

const fn default_lifetime_jitter_secs() -> u64 {
    120
}

const fn default_guard_window_secs() -> u64 {
    45
}

const fn default_refill_interval_ms() -> u64 {
    100
}

const fn default_max_connections() -> usize {
    10
}

const fn default_idle_timeout_secs() -> u64 {
    1800
}

const fn default_acquire_timeout_ms() -> u64 {
    30_000
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay_ms() -> u64 {
    100
}

const fn default_max_delay_ms() -> u64 {
    5000
}

const fn default_jitter() -> f64 {
    0.25
}

fn default_table() -> String {
    "dsql".to_owned()
}

const fn default_limit_per_sec() -> u32 {
    100
}

const fn default_block_size() -> u32 {
    100
}

const fn default_block_count() -> u32 {
    100
}

const fn default_lease_ttl_secs() -> u64 {
    30
}

const fn default_renew_interval_secs() -> u64 {
    10
}

fn default_coordination_url() -> String {
    "redis://localhost:6379".to_owned()
}

fn default_metrics_listen_addr() -> String {
    "0.0.0.0:9090".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

const fn default_true() -> bool {
    true
}
