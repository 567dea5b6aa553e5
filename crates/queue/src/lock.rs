//! Best-effort distributed lock over a shared cache.
//!
//! The lock is a single key created with an atomic add-if-absent. It has no
//! fencing token: a holder that outlives the key's TTL may overlap with the
//! next holder. Only guard operations that tolerate rare double execution.
//!
//! ## Lifecycle
//!
//! ```text
//! acquire() ──▶ held ──release()/clean()──▶ not held
//!     │
//!     └── timeout elapsed ──▶ Ok(false)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, warn};

use davq_core::{Clock, QueueConfig, QueueResult};

use crate::transaction::Transaction;

/// Cache offering an atomic create-if-absent.
#[async_trait]
pub trait LockCache: Send + Sync {
    /// Store `key` if it is absent (or expired). Returns `true` when this
    /// call created it.
    async fn add(&self, key: &str, ttl: Option<Duration>) -> QueueResult<bool>;

    async fn delete(&self, key: &str) -> QueueResult<()>;
}

/// Process-local lock cache with clock-driven expiry.
pub struct InMemoryLockCache {
    entries: Mutex<HashMap<String, Option<DateTime<Utc>>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLockCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .is_some_and(|expires| expires.is_none_or(|at| at > now))
    }
}

#[async_trait]
impl LockCache for InMemoryLockCache {
    async fn add(&self, key: &str, ttl: Option<Duration>) -> QueueResult<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let live = entries
            .get(key)
            .is_some_and(|expires| expires.is_none_or(|at| at > now));
        if live {
            return Ok(false);
        }

        let expires = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| now + ttl);
        entries.insert(key.to_string(), expires);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> QueueResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

/// A named lock in a shared [`LockCache`].
pub struct DistributedLock {
    cache: Arc<dyn LockCache>,
    key: String,
    timeout: Duration,
    retry_interval: Duration,
    expire: Option<Duration>,
    held: bool,
}

impl DistributedLock {
    /// Lock `name` within `namespace`, with default timings.
    pub fn new(cache: Arc<dyn LockCache>, namespace: &str, name: &str) -> Self {
        Self::from_config(cache, namespace, name, &QueueConfig::default())
    }

    pub fn from_config(
        cache: Arc<dyn LockCache>,
        namespace: &str,
        name: &str,
        config: &QueueConfig,
    ) -> Self {
        Self {
            cache,
            key: format!("{namespace}:{name}"),
            timeout: config.lock_timeout,
            retry_interval: config.lock_retry_interval,
            expire: config.lock_expire,
            held: false,
        }
    }

    /// How long `acquire` keeps trying. Zero means a single attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// TTL of the lock key; `None` keeps it until released.
    pub fn expire(mut self, expire: Option<Duration>) -> Self {
        self.expire = expire;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Try to take the lock until the timeout elapses.
    ///
    /// `Ok(false)` on timeout; errors only when the cache itself fails.
    pub async fn acquire(&mut self) -> QueueResult<bool> {
        if self.held {
            return Ok(true);
        }

        // `None` when the timeout is past the end of the clock: wait forever.
        let deadline = tokio::time::Instant::now().checked_add(self.timeout);
        loop {
            if self.cache.add(&self.key, self.expire).await? {
                self.held = true;
                debug!(key = %self.key, "lock acquired");
                return Ok(true);
            }

            let now = tokio::time::Instant::now();
            let pause = match deadline {
                Some(deadline) if now >= deadline => {
                    warn!(key = %self.key, timeout = ?self.timeout, "lock acquisition timed out");
                    return Ok(false);
                }
                Some(deadline) => self.retry_interval.min(deadline - now),
                None => self.retry_interval,
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// Delete the lock key. Safe to call whether or not the lock is held.
    pub async fn release(&mut self) -> QueueResult<()> {
        self.cache.delete(&self.key).await?;
        if self.held {
            debug!(key = %self.key, "lock released");
        }
        self.held = false;
        Ok(())
    }

    /// Release the lock only if this handle holds it. Called when the
    /// guarded transaction commits or aborts.
    pub async fn clean(&mut self) -> QueueResult<()> {
        if self.held {
            self.release().await?;
        }
        Ok(())
    }

    /// Keep the lock until `txn` commits or aborts, then clean it.
    ///
    /// If `txn` is dropped instead, the key stays until its TTL runs out.
    pub fn clean_on_finish(mut self, txn: &mut dyn Transaction) {
        txn.on_finish(Box::new(move |_committed: bool| {
            async move {
                if let Err(e) = self.clean().await {
                    warn!(key = %self.key, error = %e, "failed to release lock");
                }
            }
            .boxed()
        }));
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("timeout", &self.timeout)
            .field("expire", &self.expire)
            .field("held", &self.held)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use davq_core::ManualClock;

    fn cache() -> (ManualClock, Arc<InMemoryLockCache>) {
        let clock = ManualClock::default();
        let cache = Arc::new(InMemoryLockCache::new(Arc::new(clock.clone())));
        (clock, cache)
    }

    fn lock(cache: &Arc<InMemoryLockCache>) -> DistributedLock {
        DistributedLock::new(cache.clone(), "ImplicitUIDLock", "user01")
            .timeout(Duration::from_millis(50))
            .retry_interval(Duration::from_millis(10))
    }

    #[tokio::test(start_paused = true)]
    async fn second_acquire_times_out() {
        let (_clock, cache) = cache();
        let mut first = lock(&cache);
        let mut second = lock(&cache);

        assert!(first.acquire().await.unwrap());
        assert!(!second.acquire().await.unwrap());
        assert!(first.is_held());
        assert!(!second.is_held());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_admit_one_holder() {
        let (_clock, cache) = cache();
        let start = Arc::new(tokio::sync::Barrier::new(8));

        let contenders: Vec<_> = (0..8)
            .map(|_| {
                let mut lock = lock(&cache).timeout(Duration::ZERO);
                let start = Arc::clone(&start);
                tokio::spawn(async move {
                    start.wait().await;
                    lock.acquire().await.unwrap()
                })
            })
            .collect();

        let mut winners = 0;
        for contender in contenders {
            if contender.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(cache.contains("ImplicitUIDLock:user01"));
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_timeout_does_not_overflow() {
        let (_clock, cache) = cache();
        let mut holder = lock(&cache).timeout(Duration::MAX);
        assert!(holder.acquire().await.unwrap());

        let mut waiter = lock(&cache).timeout(Duration::MAX);
        let waiting = tokio::spawn(async move { waiter.acquire().await.unwrap() });
        tokio::time::sleep(Duration::from_secs(1)).await;
        holder.release().await.unwrap();
        assert!(waiting.await.unwrap());
    }

    #[tokio::test]
    async fn lock_is_held_until_the_transaction_finishes() {
        use crate::memory::InMemoryDatabase;
        use crate::transaction::Database;

        let (_clock, cache) = cache();
        let db = InMemoryDatabase::new();

        for commit in [true, false] {
            let mut txn = db.begin().await.unwrap();
            let mut holder = lock(&cache).timeout(Duration::ZERO);
            assert!(holder.acquire().await.unwrap());
            holder.clean_on_finish(&mut *txn);

            assert!(cache.contains("ImplicitUIDLock:user01"));
            if commit {
                txn.commit().await.unwrap();
            } else {
                txn.abort().await.unwrap();
            }
            assert!(!cache.contains("ImplicitUIDLock:user01"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn release_lets_next_acquire_succeed() {
        let (_clock, cache) = cache();
        let mut first = lock(&cache);
        let mut second = lock(&cache).timeout(Duration::ZERO);

        assert!(first.acquire().await.unwrap());
        first.release().await.unwrap();
        first.release().await.unwrap();
        assert!(second.acquire().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_key_can_be_taken() {
        let (clock, cache) = cache();
        let mut first = lock(&cache).expire(Some(Duration::from_secs(300)));
        let mut second = lock(&cache).timeout(Duration::ZERO);

        assert!(first.acquire().await.unwrap());
        assert!(!second.acquire().await.unwrap());

        clock.advance(chrono::Duration::seconds(301));
        assert!(second.acquire().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn clean_only_releases_when_held() {
        let (_clock, cache) = cache();
        let mut holder = lock(&cache);
        let mut loser = lock(&cache).timeout(Duration::ZERO);

        assert!(holder.acquire().await.unwrap());
        assert!(!loser.acquire().await.unwrap());
        loser.clean().await.unwrap();
        assert!(cache.contains("ImplicitUIDLock:user01"));

        holder.clean().await.unwrap();
        assert!(!cache.contains("ImplicitUIDLock:user01"));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_acquire_succeeds_after_release() {
        let (_clock, cache) = cache();
        let mut holder = lock(&cache);
        assert!(holder.acquire().await.unwrap());

        let mut waiter = lock(&cache).timeout(Duration::from_secs(5));
        let waiting = tokio::spawn(async move { waiter.acquire().await.unwrap() });

        tokio::time::sleep(Duration::from_millis(25)).await;
        holder.release().await.unwrap();
        assert!(waiting.await.unwrap());
    }
}
