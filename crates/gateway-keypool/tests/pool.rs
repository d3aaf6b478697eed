use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use gateway_keypool::{
    FailureClass, KeyPool, KeyStore, KeyStoreError, NewPersistedKey, NewUpstreamKey, PersistedKey,
    PoolConfig, ReturnOutcome,
};
use tokio::sync::Mutex;

#[derive(Default)]
struct MemoryStore {
    rows: Mutex<Vec<PersistedKey>>,
    next_id: AtomicI64,
}

#[async_trait::async_trait]
impl KeyStore for MemoryStore {
    async fn load_all_keys(&self) -> Result<Vec<PersistedKey>, KeyStoreError> {
        Ok(self.rows.lock().await.clone())
    }

    async fn insert_key(&self, key: NewPersistedKey) -> Result<PersistedKey, KeyStoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let row = PersistedKey {
            id,
            identifier: key.identifier,
            secret: key.secret,
            brief: key.brief,
            state: gateway_keypool::KeyState::Active,
            failure_count: 0,
            cooldown_entry_count: 0,
            current_cooldown_secs: 0,
            cooldown_until: None,
            in_use_since: None,
        };
        self.rows.lock().await.push(row.clone());
        Ok(row)
    }

    async fn upsert_key(&self, key: &PersistedKey) -> Result<(), KeyStoreError> {
        let mut rows = self.rows.lock().await;
        if let Some(existing) = rows.iter_mut().find(|r| r.id == key.id) {
            *existing = key.clone();
        } else {
            rows.push(key.clone());
        }
        Ok(())
    }

    async fn delete_key(&self, id: i64) -> Result<(), KeyStoreError> {
        self.rows.lock().await.retain(|r| r.id != id);
        Ok(())
    }
}

fn config() -> PoolConfig {
    PoolConfig {
        base_cooldown_secs: 10,
        max_cooldown_secs: 80,
        failure_threshold: 3,
        rate_limit_default_wait_secs: 30,
        stuck_timeout_secs: 3600,
        sweep_interval_secs: 3600,
    }
}

async fn pool_with_keys(n: usize) -> KeyPool {
    let store = Arc::new(MemoryStore::default());
    let pool = KeyPool::bootstrap(config(), store).await.unwrap();
    for i in 0..n {
        pool.insert_key(NewUpstreamKey {
            secret: format!("secret-{i}"),
        })
        .await
        .unwrap();
    }
    pool
}

#[tokio::test]
async fn round_robin_rotates_across_active_keys() {
    let pool = pool_with_keys(3).await;

    let l1 = pool.acquire(Duration::from_millis(100)).await.unwrap();
    let id1 = l1.id;
    pool.return_lease(l1, ReturnOutcome::Success).await;

    let l2 = pool.acquire(Duration::from_millis(100)).await.unwrap();
    let id2 = l2.id;
    pool.return_lease(l2, ReturnOutcome::Success).await;

    let l3 = pool.acquire(Duration::from_millis(100)).await.unwrap();
    let id3 = l3.id;
    pool.return_lease(l3, ReturnOutcome::Success).await;

    assert_ne!(id1, id2);
    assert_ne!(id2, id3);
    assert_eq!(id1, id3, "ring should wrap back to the first key on the third acquire");
}

#[tokio::test]
async fn failure_threshold_enters_cooldown_with_exponential_backoff() {
    let pool = pool_with_keys(1).await;

    for _ in 0..2 {
        let lease = pool.acquire(Duration::from_millis(100)).await.unwrap();
        pool.return_lease(lease, ReturnOutcome::Failure(FailureClass::Upstream5xx))
            .await;
        let status = pool.status();
        assert_eq!(status.keys[0].state, "active", "below threshold stays active");
    }

    let lease = pool.acquire(Duration::from_millis(100)).await.unwrap();
    pool.return_lease(lease, ReturnOutcome::Failure(FailureClass::Upstream5xx))
        .await;
    let status = pool.status();
    assert_eq!(status.keys[0].state, "cooling_down");
    assert_eq!(status.keys[0].current_cooldown_secs, 10);

    assert!(
        pool.acquire(Duration::from_millis(30)).await.is_err(),
        "only key is cooling down, acquire should time out"
    );
}

#[tokio::test]
async fn auth_rejection_forces_immediate_cooldown() {
    let pool = pool_with_keys(1).await;

    let lease = pool.acquire(Duration::from_millis(100)).await.unwrap();
    pool.return_lease(lease, ReturnOutcome::Failure(FailureClass::AuthRejected))
        .await;

    let status = pool.status();
    assert_eq!(
        status.keys[0].state, "cooling_down",
        "auth rejection cools down on the first failure, below the normal threshold"
    );
    assert_eq!(status.keys[0].failure_count, 1);
}

#[tokio::test]
async fn dropped_lease_without_return_reclaims_as_transient_failure() {
    let pool = pool_with_keys(1).await;

    {
        let _lease = pool.acquire(Duration::from_millis(100)).await.unwrap();
        // lease goes out of scope here without return_lease
    }

    tokio::task::yield_now().await;
    let status = pool.status();
    assert_eq!(status.keys[0].failure_count, 1);
    assert_eq!(status.keys[0].state, "active", "single transient miss stays below threshold");
}

#[tokio::test]
async fn rate_limit_retry_after_overrides_computed_backoff_once_cooldown_entered() {
    let pool = pool_with_keys(1).await;

    // rate_limited is threshold-gated like upstream_5xx; the first two stay active.
    for _ in 0..2 {
        let lease = pool.acquire(Duration::from_millis(100)).await.unwrap();
        pool.return_lease(
            lease,
            ReturnOutcome::Failure(FailureClass::RateLimited { retry_after: None }),
        )
        .await;
    }
    assert_eq!(pool.status().keys[0].state, "active");

    let lease = pool.acquire(Duration::from_millis(100)).await.unwrap();
    pool.return_lease(
        lease,
        ReturnOutcome::Failure(FailureClass::RateLimited {
            retry_after: Some(Duration::from_secs(120)),
        }),
    )
    .await;

    let status = pool.status();
    assert_eq!(status.keys[0].state, "cooling_down");
    assert_eq!(status.keys[0].current_cooldown_secs, 80, "retry_after overrides the computed backoff but is still capped at max_cooldown_secs");
}

#[tokio::test]
async fn delete_busy_key_is_rejected() {
    let pool = pool_with_keys(1).await;
    let lease = pool.acquire(Duration::from_millis(100)).await.unwrap();

    let err = pool.delete_key(lease.id).await.unwrap_err();
    assert!(matches!(err, gateway_keypool::KeyPoolError::KeyBusy));

    pool.return_lease(lease, ReturnOutcome::Success).await;
}
