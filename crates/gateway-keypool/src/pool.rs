use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration as StdDuration;

use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::Notify;

use crate::error::{AcquireError, KeyPoolError};
use crate::key::{
    KeyEntry, KeyId, KeyState, KeyStatusEntry, NewUpstreamKey, PoolStatus, derive_brief,
    derive_identifier,
};
use crate::lease::{FailureClass, Lease, ReturnOutcome};
use crate::store::{KeyStore, KeyStoreError, NewPersistedKey, PersistedKey};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub base_cooldown_secs: u64,
    pub max_cooldown_secs: u64,
    pub failure_threshold: u32,
    pub rate_limit_default_wait_secs: u64,
    pub stuck_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

/// Shared pool state. Kept behind `std::sync::Mutex` rather than an async
/// `tokio::sync::RwLock` so `Lease`'s `Drop` fallback can reclaim a forgotten
/// lease synchronously — see `emergency_reclaim`.
pub struct PoolInner {
    keys: StdMutex<HashMap<KeyId, KeyEntry>>,
    ring: StdMutex<Vec<KeyId>>,
    cursor: AtomicUsize,
    waiters: StdMutex<VecDeque<Arc<Notify>>>,
    config: PoolConfig,
    store: Arc<dyn KeyStore>,
}

/// Round-robin pool of upstream credentials with exponential-backoff
/// cooldown on repeated failure, a bounded wait queue for `acquire`, and a
/// background sweep that reclaims leases abandoned past their deadline.
#[derive(Clone)]
pub struct KeyPool {
    inner: Arc<PoolInner>,
}

impl KeyPool {
    /// Loads persisted keys, reclaims stale `Leased`/`Cooling` rows per the
    /// spec's load-time recovery rule, builds the round-robin ring, and
    /// spawns the stuck-lease sweep task.
    pub async fn bootstrap(
        config: PoolConfig,
        store: Arc<dyn KeyStore>,
    ) -> Result<Self, KeyStoreError> {
        let rows = store.load_all_keys().await?;
        let now = OffsetDateTime::now_utc();

        let mut keys = HashMap::with_capacity(rows.len());
        let mut ring = Vec::with_capacity(rows.len());
        for row in rows {
            let mut entry = KeyEntry {
                id: row.id,
                identifier: row.identifier,
                secret: Arc::from(row.secret.as_str()),
                brief: row.brief,
                state: row.state,
                failure_count: row.failure_count,
                cooldown_entry_count: row.cooldown_entry_count,
                current_cooldown_secs: row.current_cooldown_secs,
                cooldown_until: row.cooldown_until,
                in_use_since: row.in_use_since,
            };
            match entry.state {
                KeyState::Leased => {
                    tracing::warn!(key_id = entry.id, "reclaiming key left Leased across restart");
                    entry.state = KeyState::Active;
                    entry.in_use_since = None;
                }
                KeyState::Cooling => {
                    if entry.cooldown_until.is_none_or(|until| until <= now) {
                        entry.state = KeyState::Active;
                        entry.cooldown_until = None;
                    }
                }
                KeyState::Active => {}
            }
            ring.push(entry.id);
            keys.insert(entry.id, entry);
        }

        let inner = Arc::new(PoolInner {
            keys: StdMutex::new(keys),
            ring: StdMutex::new(ring),
            cursor: AtomicUsize::new(0),
            waiters: StdMutex::new(VecDeque::new()),
            config,
            store,
        });
        inner.clone().spawn_sweep();
        Ok(Self { inner })
    }

    pub async fn acquire(&self, timeout: StdDuration) -> Result<Lease, AcquireError> {
        let deadline = tokio::time::Instant::now() + timeout;
        if let Some(lease) = self.inner.try_acquire_once().await {
            return Ok(lease);
        }

        let notify = Arc::new(Notify::new());
        self.inner.waiters.lock().unwrap().push_back(Arc::clone(&notify));

        loop {
            // A return_lease/reset/sweep may have raced the registration above
            // (or a prior spurious wakeup below) — check again now that we're
            // queued, before waiting.
            if let Some(lease) = self.inner.try_acquire_once().await {
                self.inner.remove_waiter(&notify);
                return Ok(lease);
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                self.inner.remove_waiter(&notify);
                return Err(AcquireError::NoKeyAvailable);
            }
            if tokio::time::timeout(remaining, notify.notified())
                .await
                .is_err()
            {
                self.inner.remove_waiter(&notify);
                return Err(AcquireError::NoKeyAvailable);
            }

            // Woken, but another acquirer may have beaten us to the key.
            // `wake_one_waiter` already popped us off the queue; rejoin at the
            // front rather than the back so losing that race never costs us
            // our place behind waiters that queued after us.
            self.inner.waiters.lock().unwrap().push_front(Arc::clone(&notify));
        }
    }

    pub async fn return_lease(&self, lease: Lease, outcome: ReturnOutcome) {
        lease.released_flag().store(true, Ordering::SeqCst);
        let id = lease.id;
        let persisted = self.inner.apply_outcome(id, outcome);
        drop(lease);
        if let Some(persisted) = persisted
            && let Err(err) = self.inner.store.upsert_key(&persisted).await
        {
            tracing::error!(key_id = id, error = %err, "failed to persist key state after return_lease");
        }
    }

    pub fn status(&self) -> PoolStatus {
        let keys = self.inner.keys.lock().unwrap();
        let now = OffsetDateTime::now_utc();
        let mut entries = Vec::with_capacity(keys.len());
        let (mut active, mut leased, mut cooling) = (0, 0, 0);
        for entry in keys.values() {
            match entry.state {
                KeyState::Active => active += 1,
                KeyState::Leased => leased += 1,
                KeyState::Cooling => cooling += 1,
            }
            let remaining = entry
                .cooldown_until
                .map(|until| (until - now).whole_seconds().max(0) as u64)
                .unwrap_or(0);
            entries.push(KeyStatusEntry {
                identifier: entry.identifier.clone(),
                brief: entry.brief.clone(),
                state: match entry.state {
                    KeyState::Active => "active",
                    KeyState::Leased => "in_use",
                    KeyState::Cooling => "cooling_down",
                },
                cooldown_seconds_remaining: remaining,
                failure_count: entry.failure_count,
                cooldown_entry_count: entry.cooldown_entry_count,
                current_cooldown_secs: entry.current_cooldown_secs,
            });
        }
        entries.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        PoolStatus {
            keys: entries,
            active_count: active,
            leased_count: leased,
            cooling_count: cooling,
        }
    }

    pub async fn insert_key(&self, new: NewUpstreamKey) -> Result<KeyId, KeyStoreError> {
        let identifier = derive_identifier(&new.secret);
        let brief = derive_brief(&new.secret);
        let persisted = self
            .inner
            .store
            .insert_key(NewPersistedKey {
                identifier: identifier.clone(),
                secret: new.secret.clone(),
                brief: brief.clone(),
            })
            .await?;
        let entry = KeyEntry {
            id: persisted.id,
            identifier,
            secret: Arc::from(new.secret.as_str()),
            brief,
            state: KeyState::Active,
            failure_count: 0,
            cooldown_entry_count: 0,
            current_cooldown_secs: 0,
            cooldown_until: None,
            in_use_since: None,
        };
        let id = entry.id;
        self.inner.keys.lock().unwrap().insert(id, entry);
        self.inner.ring.lock().unwrap().push(id);
        self.inner.wake_one_waiter();
        Ok(id)
    }

    pub async fn delete_key(&self, id: KeyId) -> Result<(), KeyPoolError> {
        {
            let keys = self.inner.keys.lock().unwrap();
            match keys.get(&id) {
                None => return Err(KeyPoolError::NotFound),
                Some(entry) if entry.state == KeyState::Leased => {
                    return Err(KeyPoolError::KeyBusy);
                }
                Some(_) => {}
            }
        }
        self.inner.keys.lock().unwrap().remove(&id);
        self.inner.ring.lock().unwrap().retain(|k| *k != id);
        if let Err(err) = self.inner.store.delete_key(id).await {
            tracing::error!(key_id = id, error = %err, "failed to persist key deletion");
        }
        Ok(())
    }

    pub async fn reset_key(&self, id: KeyId) -> Result<(), KeyPoolError> {
        let persisted = {
            let mut keys = self.inner.keys.lock().unwrap();
            let entry = keys.get_mut(&id).ok_or(KeyPoolError::NotFound)?;
            if entry.state == KeyState::Leased {
                return Err(KeyPoolError::KeyBusy);
            }
            entry.reset_fields();
            self.inner.to_persisted(entry)
        };
        self.inner.wake_one_waiter();
        if let Err(err) = self.inner.store.upsert_key(&persisted).await {
            tracing::error!(key_id = id, error = %err, "failed to persist key reset");
        }
        Ok(())
    }

    pub async fn reset_all(&self) {
        let persisted: Vec<PersistedKey> = {
            let mut keys = self.inner.keys.lock().unwrap();
            keys.values_mut()
                .filter(|e| e.state != KeyState::Leased)
                .map(|e| {
                    e.reset_fields();
                    self.inner.to_persisted(e)
                })
                .collect()
        };
        self.inner.wake_one_waiter();
        for row in persisted {
            if let Err(err) = self.inner.store.upsert_key(&row).await {
                tracing::error!(key_id = row.id, error = %err, "failed to persist key reset");
            }
        }
    }

    /// Resolves the admin-facing `identifier` to the internal `KeyId` used by
    /// `delete_key`/`reset_key`. `identifier` is a display convenience, not
    /// a primary key, so this is a linear scan rather than a second index.
    pub fn find_id_by_identifier(&self, identifier: &str) -> Option<KeyId> {
        self.inner
            .keys
            .lock()
            .unwrap()
            .values()
            .find(|entry| entry.identifier == identifier)
            .map(|entry| entry.id)
    }
}

impl PoolInner {
    async fn try_acquire_once(self: &Arc<Self>) -> Option<Lease> {
        let now = OffsetDateTime::now_utc();
        let (found, expired_cooldowns) = {
            let ring = self.ring.lock().unwrap();
            if ring.is_empty() {
                return None;
            }
            let mut keys = self.keys.lock().unwrap();
            let len = ring.len();
            let start = self.cursor.load(Ordering::Relaxed) % len;
            let mut found: Option<(KeyId, String, String, Arc<str>)> = None;
            let mut expired_cooldowns = Vec::new();
            for offset in 0..len {
                let idx = (start + offset) % len;
                let id = ring[idx];
                let Some(entry) = keys.get_mut(&id) else {
                    continue;
                };
                if entry.state == KeyState::Cooling
                    && entry.cooldown_until.is_some_and(|until| until <= now)
                {
                    entry.state = KeyState::Active;
                    entry.cooldown_until = None;
                    expired_cooldowns.push(self.to_persisted(entry));
                }
                if found.is_none() && entry.state == KeyState::Active {
                    entry.state = KeyState::Leased;
                    entry.in_use_since = Some(now);
                    self.cursor.store((idx + 1) % len, Ordering::Relaxed);
                    found = Some((entry.id, entry.identifier.clone(), entry.brief.clone(), Arc::clone(&entry.secret)));
                }
            }
            (found, expired_cooldowns)
        };
        if !expired_cooldowns.is_empty() {
            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                for row in expired_cooldowns {
                    if let Err(err) = store.upsert_key(&row).await {
                        tracing::error!(key_id = row.id, error = %err, "failed to persist lazy cooldown expiry");
                    }
                }
            });
        }
        let (id, identifier, brief, secret) = found?;
        let persisted = self.to_persisted(self.keys.lock().unwrap().get(&id).unwrap());
        if let Err(err) = self.store.upsert_key(&persisted).await {
            tracing::error!(key_id = id, error = %err, "failed to persist lease acquisition");
        }
        Some(Lease::new(id, identifier, brief, secret, Arc::clone(self)))
    }

    fn apply_outcome(&self, id: KeyId, outcome: ReturnOutcome) -> Option<PersistedKey> {
        let mut keys = self.keys.lock().unwrap();
        let entry = keys.get_mut(&id)?;
        let became_active = match outcome {
            ReturnOutcome::Success => {
                entry.reset_fields();
                true
            }
            ReturnOutcome::Failure(class) => self.apply_failure(entry, class),
        };
        let persisted = self.to_persisted(entry);
        drop(keys);
        if became_active {
            self.wake_one_waiter();
        }
        Some(persisted)
    }

    /// All three threshold-gated classifications (`rate_limited`,
    /// `upstream_5xx`, `auth_rejected`) increment `failure_count` and enter
    /// cooldown once it crosses `FAILURE_THRESHOLD`; `auth_rejected` forces
    /// entry immediately since retrying the same credential cannot succeed.
    /// `transient_client_or_network` never forces cooldown by itself — a
    /// single forgotten/dropped lease costs at most one failure count.
    fn apply_failure(&self, entry: &mut KeyEntry, class: FailureClass) -> bool {
        entry.in_use_since = None;
        entry.failure_count += 1;
        let (forced, override_wait) = match class {
            FailureClass::AuthRejected => (true, None),
            FailureClass::RateLimited { retry_after } => (
                false,
                Some(override_or_default(retry_after, self.config.rate_limit_default_wait_secs)),
            ),
            FailureClass::Upstream5xx => (false, None),
            FailureClass::TransientClientOrNetwork => (false, None),
        };
        let enter_cooldown = forced || entry.failure_count >= self.config.failure_threshold;
        if !enter_cooldown {
            entry.state = KeyState::Active;
            return true;
        }
        entry.cooldown_entry_count += 1;
        let shift = (entry.cooldown_entry_count - 1).min(63);
        let backoff = self.config.base_cooldown_secs.saturating_mul(1u64 << shift);
        let secs = override_wait.map_or(backoff, |wait| backoff.max(wait));
        let secs = secs.min(self.config.max_cooldown_secs);
        entry.current_cooldown_secs = secs;
        entry.cooldown_until = Some(OffsetDateTime::now_utc() + TimeDuration::seconds(secs as i64));
        entry.state = KeyState::Cooling;
        false
    }

    fn to_persisted(&self, entry: &KeyEntry) -> PersistedKey {
        PersistedKey {
            id: entry.id,
            identifier: entry.identifier.clone(),
            secret: entry.secret.to_string(),
            brief: entry.brief.clone(),
            state: entry.state,
            failure_count: entry.failure_count,
            cooldown_entry_count: entry.cooldown_entry_count,
            current_cooldown_secs: entry.current_cooldown_secs,
            cooldown_until: entry.cooldown_until,
            in_use_since: entry.in_use_since,
        }
    }

    fn wake_one_waiter(&self) {
        if let Some(notify) = self.waiters.lock().unwrap().pop_front() {
            notify.notify_one();
        }
    }

    fn remove_waiter(&self, notify: &Arc<Notify>) {
        let mut waiters = self.waiters.lock().unwrap();
        if let Some(pos) = waiters.iter().position(|n| Arc::ptr_eq(n, notify)) {
            waiters.remove(pos);
        }
    }

    /// Synchronous best-effort reclaim invoked from `Lease::drop` when a
    /// caller forgot to return the lease. Treated as a transient-network
    /// failure so a forgotten lease never leaves the key stuck `Leased`
    /// forever, without forcing a cooldown on its own.
    pub(crate) fn emergency_reclaim(self: &Arc<Self>, id: KeyId) {
        let persisted = self.apply_outcome(id, ReturnOutcome::Failure(FailureClass::TransientClientOrNetwork));
        let Some(persisted) = persisted else { return };
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(err) = store.upsert_key(&persisted).await {
                tracing::error!(key_id = persisted.id, error = %err, "failed to persist emergency reclaim");
            }
        });
    }

    fn spawn_sweep(self: Arc<Self>) {
        let stuck_timeout = self.config.stuck_timeout_secs;
        let interval = StdDuration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now = OffsetDateTime::now_utc();
                let stuck: Vec<PersistedKey> = {
                    let mut keys = self.keys.lock().unwrap();
                    keys.values_mut()
                        .filter_map(|entry| {
                            let since = entry.in_use_since?;
                            if entry.state != KeyState::Leased {
                                return None;
                            }
                            if (now - since).whole_seconds() < stuck_timeout as i64 {
                                return None;
                            }
                            tracing::warn!(key_id = entry.id, "sweep reclaiming stuck lease");
                            entry.state = KeyState::Active;
                            entry.in_use_since = None;
                            entry.failure_count += 1;
                            Some(self.to_persisted(entry))
                        })
                        .collect()
                };
                if !stuck.is_empty() {
                    self.wake_one_waiter();
                }
                for row in stuck {
                    if let Err(err) = self.store.upsert_key(&row).await {
                        tracing::error!(key_id = row.id, error = %err, "failed to persist stuck-lease reclaim");
                    }
                }
            }
        });
    }
}

fn override_or_default(retry_after: Option<StdDuration>, default_secs: u64) -> u64 {
    retry_after.map(|d| d.as_secs()).unwrap_or(default_secs)
}
