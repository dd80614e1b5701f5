//! Integration tests for the `Dragonfly`/Redis coordination store.
//!
//! These tests require a live Redis-compatible server. Run with:
//!
//! ```bash
//! docker run -d -p 6379:6379 docker.dragonflydb.io/dragonflydb/dragonfly
//! cargo test -p dsql-coordination -- --ignored
//! ```
//!
//! All tests are marked `#[ignore]` so they are skipped during normal
//! `cargo test` runs.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::arithmetic_side_effects)]

use std::sync::Arc;
use std::time::Duration;

use dsql_coordination::{
    CoordinationStore, DistributedRateLimiter, LeaseManager, LeaseSettings, RateDecision,
    RedisStore,
};
use dsql_core::SystemClock;

/// Redis connection URL for the local Docker instance.
const REDIS_URL: &str = "redis://localhost:6379";

async fn connect() -> RedisStore {
    RedisStore::connect(REDIS_URL)
        .await
        .expect("Failed to connect to Redis -- is Docker running?")
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::now_v7())
}

// =============================================================================
// Store CAS
// =============================================================================

#[tokio::test]
#[ignore = "requires live Redis"]
async fn cas_versions_increase_and_stale_writes_lose() {
    let store = connect().await;
    let key = unique("dsql-test:cas");
    let ttl = Duration::from_secs(30);

    assert!(store.store_if(&key, None, "a", ttl).await.unwrap());
    assert!(!store.store_if(&key, None, "b", ttl).await.unwrap());
    assert!(store.store_if(&key, Some(1), "c", ttl).await.unwrap());
    assert!(!store.store_if(&key, Some(1), "d", ttl).await.unwrap());

    let rec = store.load(&key).await.unwrap().unwrap();
    assert_eq!(rec.version, 2);
    assert_eq!(rec.value, "c");

    store.delete(&key).await.unwrap();
    assert!(store.load(&key).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires live Redis"]
async fn concurrent_cas_has_single_winner() {
    let store = Arc::new(connect().await);
    let key = unique("dsql-test:race");
    let ttl = Duration::from_secs(30);
    store.store_if(&key, None, "seed", ttl).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let store = Arc::clone(&store);
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            store
                .store_if(&key, Some(1), &format!("writer-{i}"), ttl)
                .await
                .unwrap()
        }));
    }
    let mut winners = 0;
    for h in handles {
        if h.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    store.delete(&key).await.unwrap();
}

#[tokio::test]
#[ignore = "requires live Redis"]
async fn records_expire() {
    let store = connect().await;
    let key = unique("dsql-test:ttl");
    assert!(
        store
            .store_if(&key, None, "x", Duration::from_millis(200))
            .await
            .unwrap()
    );
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(store.load(&key).await.unwrap().is_none());
}

// =============================================================================
// Rate limiter and lease over Redis
// =============================================================================

#[tokio::test]
#[ignore = "requires live Redis"]
async fn rate_limiter_burst_over_redis() {
    let store: Arc<dyn CoordinationStore> = Arc::new(connect().await);
    let endpoint = unique("cluster");
    let limiter =
        DistributedRateLimiter::new(store, Arc::new(SystemClock), "dsql-test", &endpoint, 1, 3)
            .unwrap();
    let mut acquired = 0;
    for _ in 0..5 {
        if limiter.try_acquire().await.unwrap() == RateDecision::Acquired {
            acquired += 1;
        }
    }
    assert_eq!(acquired, 3);
}

#[tokio::test]
#[ignore = "requires live Redis"]
async fn lease_blocks_are_exclusive_over_redis() {
    let store: Arc<dyn CoordinationStore> = Arc::new(connect().await);
    let settings = LeaseSettings {
        prefix: "dsql-test".to_owned(),
        endpoint: unique("cluster"),
        block_size: 5,
        block_count: 2,
        ttl: Duration::from_secs(10),
        renew_interval: Duration::from_secs(3),
    };
    let a = LeaseManager::new(Arc::clone(&store), Arc::new(SystemClock), settings.clone()).unwrap();
    let b = LeaseManager::new(store, Arc::new(SystemClock), settings).unwrap();

    assert!(a.acquire_block().await.unwrap().is_some());
    assert!(a.acquire_block().await.unwrap().is_some());
    assert!(b.acquire_block().await.unwrap().is_none());

    assert_eq!(a.renew().await.unwrap(), 2);
    a.release().await.unwrap();
    assert!(b.acquire_block().await.unwrap().is_some());
    b.release().await.unwrap();
}
