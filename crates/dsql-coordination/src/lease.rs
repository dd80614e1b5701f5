//! Block-based allocation of a cluster-wide connection ceiling.
//!
//! The ceiling `block_size * block_count` is split into blocks stored at
//! `{prefix}:lease:{endpoint}:{index}`. An instance may open
//! `held_blocks * block_size` connections and claims another block only when
//! it runs out. Held blocks are renewed periodically; a block whose expiry
//! passed without renewal is free for anyone to claim, which is the only
//! crash-recovery path.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dsql_core::config::LeaseConfig;
use dsql_core::{Clock, Metrics};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::CoordinationError;
use crate::store::{CoordinationStore, Versioned, load_json, next_version, store_json_if};

/// Store records outlive the lease TTL by this factor so that expiry is
/// always decided by `expires_at_ms`, not by the store dropping the key.
const RECORD_TTL_FACTOR: u32 = 4;

/// A lease block record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseBlock {
    /// Connection slots in this block.
    pub slots: u32,
    /// Owning instance id; empty when unowned.
    pub owner: String,
    /// When the current owner claimed the block (epoch ms).
    pub acquired_at_ms: u64,
    /// Last renewal (epoch ms).
    pub renewed_at_ms: u64,
    /// Last clean release (epoch ms), 0 if never released.
    pub released_at_ms: u64,
    /// The block is free once `now >= expires_at_ms`.
    pub expires_at_ms: u64,
}

impl LeaseBlock {
    /// Whether another instance may claim this block at `now_ms`.
    pub fn is_claimable(&self, now_ms: u64) -> bool {
        self.owner.is_empty() || now_ms >= self.expires_at_ms
    }

    /// Whether `owner` still holds this block at `now_ms`.
    pub fn is_held_by(&self, owner: &str, now_ms: u64) -> bool {
        self.owner == owner && now_ms < self.expires_at_ms
    }
}

/// Lease parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseSettings {
    /// Key namespace.
    pub prefix: String,
    /// Backend endpoint the ceiling applies to.
    pub endpoint: String,
    /// Slots per block.
    pub block_size: u32,
    /// Number of blocks.
    pub block_count: u32,
    /// Expiry of an unrenewed block.
    pub ttl: Duration,
    /// Renewal period.
    pub renew_interval: Duration,
}

impl LeaseSettings {
    /// Build settings from the `lease` config section.
    pub fn from_config(config: &LeaseConfig, endpoint: &str) -> Self {
        Self {
            prefix: config.table.clone(),
            endpoint: endpoint.to_owned(),
            block_size: config.block_size,
            block_count: config.block_count,
            ttl: config.ttl(),
            renew_interval: config.renew_interval(),
        }
    }
}

/// Claims, renews, and releases lease blocks for one instance.
#[derive(Debug)]
pub struct LeaseManager {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    settings: LeaseSettings,
    owner: String,
    /// Held block index -> record version of our last write.
    held: Mutex<BTreeMap<u32, u64>>,
    metrics: Option<Metrics>,
}

impl LeaseManager {
    /// Create a manager with a fresh owner id.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::Config`] if the block size or count is
    /// zero, or the renewal interval is not shorter than the TTL.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        settings: LeaseSettings,
    ) -> Result<Self, CoordinationError> {
        if settings.block_size == 0 || settings.block_count == 0 {
            return Err(CoordinationError::Config(
                "lease block size and count must be positive".to_owned(),
            ));
        }
        if settings.renew_interval >= settings.ttl {
            return Err(CoordinationError::Config(
                "lease renewal interval must be shorter than the TTL".to_owned(),
            ));
        }
        Ok(Self {
            store,
            clock,
            settings,
            owner: uuid::Uuid::now_v7().to_string(),
            held: Mutex::new(BTreeMap::new()),
            metrics: None,
        })
    }

    /// Attach a metrics handle.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Override the owner id (tests, or a stable instance name).
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// This instance's owner id.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The store key for block `index`.
    pub fn block_key(&self, index: u32) -> String {
        format!(
            "{}:lease:{}:{index}",
            self.settings.prefix, self.settings.endpoint
        )
    }

    /// Indices of held blocks.
    pub fn held_blocks(&self) -> Vec<u32> {
        self.lock_held().keys().copied().collect()
    }

    /// Connections this instance may open under its held blocks.
    pub fn capacity(&self) -> u64 {
        let held = u64::try_from(self.lock_held().len()).unwrap_or(u64::MAX);
        held.saturating_mul(u64::from(self.settings.block_size))
    }

    /// Make sure capacity exceeds `open_connections`, claiming a block if
    /// needed. Returns `false` when every block is held elsewhere.
    ///
    /// # Errors
    ///
    /// Returns any store error.
    pub async fn ensure_capacity(&self, open_connections: usize) -> Result<bool, CoordinationError> {
        let open = u64::try_from(open_connections).unwrap_or(u64::MAX);
        if open < self.capacity() {
            return Ok(true);
        }
        Ok(self.acquire_block().await?.is_some())
    }

    /// Claim one more block. Returns its index, or `None` if no block is
    /// claimable.
    ///
    /// Scanning starts at a random index so that instances starting together
    /// do not all contend for block 0.
    ///
    /// # Errors
    ///
    /// Returns any store error.
    pub async fn acquire_block(&self) -> Result<Option<u32>, CoordinationError> {
        let count = self.settings.block_count;
        let start = rand::rng().random_range(0..count);
        for step in 0..count {
            let index = start.wrapping_add(step).checked_rem(count).unwrap_or(step);
            if self.lock_held().contains_key(&index) {
                continue;
            }
            if let Some(version) = self.try_claim(index).await? {
                let held = {
                    let mut held = self.lock_held();
                    held.insert(index, version);
                    held.len()
                };
                tracing::info!(block = index, owner = %self.owner, held, "lease block acquired");
                self.record_event("acquired");
                self.record_held(held);
                return Ok(Some(index));
            }
        }
        tracing::warn!(
            endpoint = %self.settings.endpoint,
            blocks = count,
            "no lease block available, connection ceiling reached"
        );
        self.record_event("exhausted");
        Ok(None)
    }

    async fn try_claim(&self, index: u32) -> Result<Option<u64>, CoordinationError> {
        let key = self.block_key(index);
        let now = self.clock.now_ms();
        let current: Option<Versioned<LeaseBlock>> = load_json(self.store.as_ref(), &key).await?;
        let (expected, released_at_ms) = match &current {
            Some(rec) if rec.value.is_claimable(now) => (Some(rec.version), rec.value.released_at_ms),
            Some(_) => return Ok(None),
            None => (None, 0),
        };
        let block = LeaseBlock {
            slots: self.settings.block_size,
            owner: self.owner.clone(),
            acquired_at_ms: now,
            renewed_at_ms: now,
            released_at_ms,
            expires_at_ms: now.saturating_add(duration_ms(self.settings.ttl)),
        };
        let written =
            store_json_if(self.store.as_ref(), &key, expected, &block, self.record_ttl()).await?;
        Ok(written.then(|| next_version(expected)))
    }

    /// Extend the expiry of every held block. Blocks that were lost are
    /// dropped locally. Returns the number of blocks still held.
    ///
    /// # Errors
    ///
    /// Returns the first store error; blocks not yet visited stay held and
    /// are retried on the next renewal.
    pub async fn renew(&self) -> Result<usize, CoordinationError> {
        let snapshot: Vec<(u32, u64)> = self.lock_held().iter().map(|(i, v)| (*i, *v)).collect();
        for (index, version) in snapshot {
            match self.try_renew(index, version).await? {
                Some(new_version) => {
                    self.lock_held().insert(index, new_version);
                    self.record_event("renewed");
                }
                None => {
                    self.lock_held().remove(&index);
                    tracing::warn!(block = index, owner = %self.owner, "lease block lost");
                    self.record_event("lost");
                }
            }
        }
        let held = self.lock_held().len();
        self.record_held(held);
        Ok(held)
    }

    async fn try_renew(&self, index: u32, version: u64) -> Result<Option<u64>, CoordinationError> {
        let key = self.block_key(index);
        let now = self.clock.now_ms();
        let Some(rec) = load_json::<LeaseBlock>(self.store.as_ref(), &key).await? else {
            return Ok(None);
        };
        if rec.version != version || !rec.value.is_held_by(&self.owner, now) {
            return Ok(None);
        }
        let block = LeaseBlock {
            renewed_at_ms: now,
            expires_at_ms: now.saturating_add(duration_ms(self.settings.ttl)),
            ..rec.value
        };
        let written = store_json_if(
            self.store.as_ref(),
            &key,
            Some(version),
            &block,
            self.record_ttl(),
        )
        .await?;
        Ok(written.then(|| next_version(Some(version))))
    }

    /// Release every held block immediately.
    ///
    /// # Errors
    ///
    /// Returns the first store error. Local state is cleared regardless;
    /// unreleased blocks recover through expiry.
    pub async fn release(&self) -> Result<(), CoordinationError> {
        let snapshot: Vec<(u32, u64)> = {
            let mut held = self.lock_held();
            let taken = held.iter().map(|(i, v)| (*i, *v)).collect();
            held.clear();
            taken
        };
        self.record_held(0);
        let mut first_error = None;
        for (index, version) in snapshot {
            match self.try_release(index, version).await {
                Ok(true) => {
                    tracing::info!(block = index, owner = %self.owner, "lease block released");
                    self.record_event("released");
                }
                Ok(false) => {
                    tracing::debug!(block = index, "lease block already taken over, skipping release");
                }
                Err(e) => {
                    tracing::warn!(block = index, error = %e, "lease block release failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn try_release(&self, index: u32, version: u64) -> Result<bool, CoordinationError> {
        let key = self.block_key(index);
        let now = self.clock.now_ms();
        let Some(rec) = load_json::<LeaseBlock>(self.store.as_ref(), &key).await? else {
            return Ok(false);
        };
        if rec.version != version || rec.value.owner != self.owner {
            return Ok(false);
        }
        let block = LeaseBlock {
            owner: String::new(),
            released_at_ms: now,
            expires_at_ms: now,
            ..rec.value
        };
        store_json_if(
            self.store.as_ref(),
            &key,
            Some(version),
            &block,
            self.record_ttl(),
        )
        .await
    }

    /// Renew held blocks every `renew_interval` until `shutdown` flips to
    /// `true`, then release them.
    pub async fn run_renewal(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.renew_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.renew().await {
                        tracing::warn!(error = %e, "lease renewal failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        if let Err(e) = self.release().await {
            tracing::warn!(error = %e, "lease release on shutdown failed");
        }
        tracing::info!(owner = %self.owner, "lease renewal loop stopped");
    }

    fn record_ttl(&self) -> Duration {
        self.settings.ttl.saturating_mul(RECORD_TTL_FACTOR)
    }

    fn lock_held(&self) -> std::sync::MutexGuard<'_, BTreeMap<u32, u64>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_event(&self, event: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_lease_event(event);
        }
    }

    fn record_held(&self, held: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_lease_blocks_held(held);
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use dsql_core::ManualClock;

    use super::*;
    use crate::store::MemoryStore;

    const TTL: Duration = Duration::from_secs(30);

    fn settings(block_count: u32) -> LeaseSettings {
        LeaseSettings {
            prefix: "dsql".to_owned(),
            endpoint: "cluster-a".to_owned(),
            block_size: 10,
            block_count,
            ttl: TTL,
            renew_interval: Duration::from_secs(10),
        }
    }

    fn manager(
        store: &Arc<dyn CoordinationStore>,
        clock: &Arc<ManualClock>,
        owner: &str,
        block_count: u32,
    ) -> LeaseManager {
        LeaseManager::new(Arc::clone(store), clock.clone(), settings(block_count))
            .unwrap()
            .with_owner(owner)
    }

    fn shared() -> (Arc<ManualClock>, Arc<dyn CoordinationStore>) {
        let clock = Arc::new(ManualClock::new(100_000));
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new(clock.clone()));
        (clock, store)
    }

    #[tokio::test]
    async fn capacity_grows_one_block_at_a_time() {
        let (clock, store) = shared();
        let lease = manager(&store, &clock, "a", 3);
        assert_eq!(lease.capacity(), 0);
        assert!(lease.ensure_capacity(0).await.unwrap());
        assert_eq!(lease.capacity(), 10);
        // Still below capacity: no new block.
        assert!(lease.ensure_capacity(9).await.unwrap());
        assert_eq!(lease.held_blocks().len(), 1);
        assert!(lease.ensure_capacity(10).await.unwrap());
        assert_eq!(lease.capacity(), 20);
    }

    #[tokio::test]
    async fn blocks_are_exclusive_across_owners() {
        let (clock, store) = shared();
        let a = manager(&store, &clock, "a", 2);
        let b = manager(&store, &clock, "b", 2);
        assert!(a.acquire_block().await.unwrap().is_some());
        assert!(b.acquire_block().await.unwrap().is_some());
        assert!(a.acquire_block().await.unwrap().is_none());
        assert!(!b.ensure_capacity(10).await.unwrap());
        let mut all = a.held_blocks();
        all.extend(b.held_blocks());
        all.sort_unstable();
        assert_eq!(all, vec![0, 1]);
    }

    #[tokio::test]
    async fn crashed_owner_block_is_claimable_exactly_at_ttl() {
        let (clock, store) = shared();
        let crashed = manager(&store, &clock, "crashed", 1);
        let survivor = manager(&store, &clock, "survivor", 1);
        assert_eq!(crashed.acquire_block().await.unwrap(), Some(0));

        clock.advance(TTL - Duration::from_millis(1));
        assert!(survivor.acquire_block().await.unwrap().is_none());

        clock.advance(Duration::from_millis(1));
        assert_eq!(survivor.acquire_block().await.unwrap(), Some(0));

        // The crashed owner discovers the loss on its next renewal.
        assert_eq!(crashed.renew().await.unwrap(), 0);
        assert_eq!(crashed.capacity(), 0);
    }

    #[tokio::test]
    async fn renewal_extends_expiry() {
        let (clock, store) = shared();
        let a = manager(&store, &clock, "a", 1);
        let b = manager(&store, &clock, "b", 1);
        a.acquire_block().await.unwrap();
        for _ in 0..5 {
            clock.advance(Duration::from_secs(10));
            assert_eq!(a.renew().await.unwrap(), 1);
        }
        // 50s in, well past the original TTL, still held.
        assert!(b.acquire_block().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_frees_blocks_immediately() {
        let (clock, store) = shared();
        let a = manager(&store, &clock, "a", 1);
        let b = manager(&store, &clock, "b", 1);
        a.acquire_block().await.unwrap();
        a.release().await.unwrap();
        assert_eq!(a.capacity(), 0);
        assert_eq!(b.acquire_block().await.unwrap(), Some(0));
        let rec: Versioned<LeaseBlock> = load_json(store.as_ref(), &b.block_key(0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.value.owner, "b");
        assert_eq!(rec.value.released_at_ms, 100_000);
    }

    #[tokio::test]
    async fn release_does_not_clobber_new_owner() {
        let (clock, store) = shared();
        let a = manager(&store, &clock, "a", 1);
        let b = manager(&store, &clock, "b", 1);
        a.acquire_block().await.unwrap();
        clock.advance(TTL);
        b.acquire_block().await.unwrap();
        a.release().await.unwrap();
        let rec: Versioned<LeaseBlock> = load_json(store.as_ref(), &b.block_key(0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.value.owner, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_loop_releases_on_shutdown() {
        let (clock, store) = shared();
        let a = Arc::new(manager(&store, &clock, "a", 1));
        a.acquire_block().await.unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&a).run_renewal(rx));
        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(a.capacity(), 0);
        let rec: Versioned<LeaseBlock> = load_json(store.as_ref(), &a.block_key(0))
            .await
            .unwrap()
            .unwrap();
        assert!(rec.value.owner.is_empty());
    }

    #[test]
    fn invalid_settings_rejected() {
        let (_, store) = shared();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let mut s = settings(1);
        s.renew_interval = TTL;
        assert!(LeaseManager::new(Arc::clone(&store), Arc::clone(&clock), s).is_err());
        assert!(LeaseManager::new(store, clock, settings(0)).is_err());
    }
}
