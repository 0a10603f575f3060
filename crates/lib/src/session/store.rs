//! Session store: cache-first reads, versioned read-modify-write against the durable store.
//!
//! Writers sharing one `SessionStore` (or its clones) are serialized per key. Writers on other
//! handles over the same durable store are reconciled by compare-and-set with a bounded number
//! of conflict retries. Durable calls that report unavailability are retried with exponential
//! backoff; cache failures only cost latency.

use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{
    Cache, CasOutcome, DurableStore, FileStore, MemoryCache, MemoryStore, Session, SessionKey,
    StoreError, Versioned,
};
use crate::config::{RetryConfig, StoreBackend, StoreConfig};

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
const DEFAULT_CONFLICT_RETRIES: u32 = 5;
const LOCK_TABLE_PRUNE_AT: usize = 1024;

/// Bounded exponential backoff: `base * 2^(attempt-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            max_attempts: c.max_attempts.max(1),
            base_delay: Duration::from_millis(c.base_delay_ms),
            max_delay: Duration::from_millis(c.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Clone)]
pub struct SessionStore {
    durable: Arc<dyn DurableStore>,
    cache: Option<Arc<dyn Cache>>,
    retry: RetryPolicy,
    max_conflict_retries: u32,
    cache_ttl: Duration,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SessionStore {
    pub fn new(durable: Arc<dyn DurableStore>) -> Self {
        Self {
            durable,
            cache: None,
            retry: RetryPolicy::default(),
            max_conflict_retries: DEFAULT_CONFLICT_RETRIES,
            cache_ttl: DEFAULT_CACHE_TTL,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build the configured backend and, unless disabled, an in-process cache in front of it.
    pub fn from_config(config: &StoreConfig) -> Self {
        let durable: Arc<dyn DurableStore> = match &config.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::File { path } => Arc::new(FileStore::new(path.clone())),
        };
        let mut store = Self::new(durable)
            .with_retry_policy(RetryPolicy::from(&config.retry))
            .with_max_conflict_retries(config.max_conflict_retries)
            .with_cache_ttl(Duration::from_secs(config.cache_ttl_secs));
        if config.cache {
            store = store.with_cache(Arc::new(MemoryCache::new()));
        }
        store
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Run a durable call, retrying only `Unavailable` errors per the retry policy.
    async fn with_retry<T, F, Fut>(&self, op: &str, key: &str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Err(StoreError::Unavailable(reason)) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    log::debug!(
                        "session store {} {} unavailable (attempt {}/{}), retrying in {:?}: {}",
                        op,
                        key,
                        attempt,
                        self.retry.max_attempts,
                        delay,
                        reason
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(StoreError::Unavailable(reason)) => {
                    log::warn!(
                        "session store {} {} still unavailable after {} attempts: {}",
                        op,
                        key,
                        attempt,
                        reason
                    );
                    return Err(StoreError::Unavailable(reason));
                }
                other => return other,
            }
        }
    }

    async fn key_lock(&self, storage_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        if locks.len() >= LOCK_TABLE_PRUNE_AT {
            locks.retain(|_, l| Arc::strong_count(l) > 1);
        }
        locks
            .entry(storage_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn cache_ttl_for(&self, session: &Session) -> Duration {
        match session.expires_at() {
            Some(at) => (at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.cache_ttl),
            None => self.cache_ttl,
        }
    }

    async fn cache_put(&self, storage_key: &str, session: &Session) {
        let Some(cache) = &self.cache else {
            return;
        };
        let bytes = match session.encode() {
            Ok(b) => b,
            Err(e) => {
                log::debug!("session cache: not caching {}: {}", storage_key, e);
                return;
            }
        };
        if let Err(e) = cache
            .set(storage_key, bytes, Some(self.cache_ttl_for(session)))
            .await
        {
            log::debug!("session cache set {} failed: {}", storage_key, e);
        }
    }

    async fn cache_evict(&self, storage_key: &str) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.delete(storage_key).await {
                log::debug!("session cache delete {} failed: {}", storage_key, e);
            }
        }
    }

    async fn cache_get(&self, storage_key: &str) -> Option<Session> {
        let cache = self.cache.as_ref()?;
        match cache.get(storage_key).await {
            Ok(Some(bytes)) => match Session::decode(storage_key, &bytes) {
                Ok(s) if !s.is_expired(Utc::now()) => Some(s),
                Ok(_) => {
                    self.cache_evict(storage_key).await;
                    None
                }
                Err(e) => {
                    log::debug!("session cache: discarding {}", e);
                    self.cache_evict(storage_key).await;
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("{}; reading durable store directly", e);
                None
            }
        }
    }

    async fn durable_get(&self, storage_key: &str) -> Result<Option<Versioned>, StoreError> {
        self.with_retry("get", storage_key, || self.durable.get(storage_key))
            .await
    }

    /// Fetch a session: cache first, then the durable store (populating the cache).
    /// `Ok(None)` when no live session exists.
    pub async fn get(&self, key: &SessionKey) -> Result<Option<Session>, StoreError> {
        let storage_key = key.storage_key();
        if let Some(s) = self.cache_get(&storage_key).await {
            return Ok(Some(s));
        }
        let Some(record) = self.durable_get(&storage_key).await? else {
            return Ok(None);
        };
        let session = Session::decode(&storage_key, &record.value)?.with_version(record.version);
        if session.is_expired(Utc::now()) {
            self.cleanup_expired(&storage_key, record.version).await;
            return Ok(None);
        }
        self.cache_put(&storage_key, &session).await;
        Ok(Some(session))
    }

    /// Best-effort removal of an expired durable record, skipped if it was rewritten meanwhile.
    async fn cleanup_expired(&self, storage_key: &str, version: u64) {
        let lock = self.key_lock(storage_key).await;
        let _guard = lock.lock().await;
        match self.durable.get(storage_key).await {
            Ok(Some(current)) if current.version == version => {
                if let Err(e) = self.durable.delete(storage_key).await {
                    log::debug!("session store: cleanup of expired {} failed: {}", storage_key, e);
                }
            }
            Ok(_) => {}
            Err(e) => log::debug!("session store: cleanup of expired {} skipped: {}", storage_key, e),
        }
    }

    /// Read-modify-write a session, creating it when absent (or expired). The mutator may run
    /// more than once if another writer wins a race; only the last run is stored.
    pub async fn create_or_update<F>(&self, key: &SessionKey, mutator: F) -> Result<Session, StoreError>
    where
        F: FnMut(&mut Session),
    {
        self.read_modify_write(key, true, mutator)
            .await?
            .ok_or_else(|| StoreError::Unavailable("session vanished during update".to_string()))
    }

    async fn read_modify_write<F>(
        &self,
        key: &SessionKey,
        create: bool,
        mut mutator: F,
    ) -> Result<Option<Session>, StoreError>
    where
        F: FnMut(&mut Session),
    {
        let storage_key = key.storage_key();
        let lock = self.key_lock(&storage_key).await;
        let _guard = lock.lock().await;

        let attempts = self.max_conflict_retries + 1;
        for attempt in 1..=attempts {
            let now = Utc::now();
            let current = self.durable_get(&storage_key).await?;
            let (mut session, expected) = match current {
                Some(record) => {
                    let stored = Session::decode(&storage_key, &record.value)?;
                    if stored.is_expired(now) {
                        if !create {
                            return Ok(None);
                        }
                        (Session::new(key.clone(), now), Some(record.version))
                    } else {
                        (stored.with_version(record.version), Some(record.version))
                    }
                }
                None if create => (Session::new(key.clone(), now), None),
                None => return Ok(None),
            };

            mutator(&mut session);
            session.touch(now);
            let bytes = session.encode()?;

            let outcome = self
                .with_retry("write", &storage_key, || {
                    self.durable
                        .compare_and_set(&storage_key, expected, bytes.clone())
                })
                .await?;
            match outcome {
                CasOutcome::Written(version) => {
                    let session = session.with_version(version);
                    self.cache_put(&storage_key, &session).await;
                    return Ok(Some(session));
                }
                CasOutcome::Conflict => {
                    log::debug!(
                        "session store: write conflict on {} (attempt {}/{})",
                        storage_key,
                        attempt,
                        attempts
                    );
                    // A concurrent writer may also have refreshed the cache; drop our view.
                    self.cache_evict(&storage_key).await;
                }
            }
        }
        Err(StoreError::Conflict {
            key: storage_key,
            attempts,
        })
    }

    /// Remove a session from the durable store and the cache. Removing an absent session succeeds.
    pub async fn delete(&self, key: &SessionKey) -> Result<(), StoreError> {
        let storage_key = key.storage_key();
        let lock = self.key_lock(&storage_key).await;
        let _guard = lock.lock().await;
        self.with_retry("delete", &storage_key, || self.durable.delete(&storage_key))
            .await?;
        self.cache_evict(&storage_key).await;
        Ok(())
    }

    /// Expire a session after `ttl`. The cache entry expires natively; the durable copy is
    /// stamped with `expires_at` so later reads treat it as gone. The durable stamp is
    /// best-effort when the cache accepted the expiry.
    pub async fn expire(&self, key: &SessionKey, ttl: Duration) -> Result<(), StoreError> {
        let storage_key = key.storage_key();
        let cached = match &self.cache {
            Some(cache) => match cache.expire(&storage_key, ttl).await {
                Ok(hit) => hit,
                Err(e) => {
                    log::warn!("{}; expiring durable copy only", e);
                    false
                }
            },
            None => false,
        };
        let at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        let stamped = self
            .read_modify_write(key, false, |s| s.set_expires_at(at))
            .await;
        match stamped {
            Ok(_) => Ok(()),
            Err(e) if cached => {
                log::warn!(
                    "session store: expiry of durable {} not recorded (cache copy will still expire): {}",
                    storage_key,
                    e
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(300),
        };
        assert_eq!(p.delay(1), Duration::from_millis(50));
        assert_eq!(p.delay(2), Duration::from_millis(100));
        assert_eq!(p.delay(3), Duration::from_millis(200));
        assert_eq!(p.delay(4), Duration::from_millis(300));
        assert_eq!(p.delay(40), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn get_populates_cache_from_durable() {
        let durable = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let store = SessionStore::new(durable.clone())
            .with_cache(cache.clone())
            .with_retry_policy(fast_retry());
        let key = SessionKey::new("sms1", "+2783", "1234");

        // Written through a second handle without a cache.
        SessionStore::new(durable.clone())
            .create_or_update(&key, |s| s.set("lang", json!("en")))
            .await
            .unwrap();
        assert!(cache.get(&key.storage_key()).await.unwrap().is_none());

        let got = store.get(&key).await.unwrap().unwrap();
        assert_eq!(got.get("lang"), Some(&json!("en")));
        assert_eq!(got.version(), 1);
        assert!(cache.get(&key.storage_key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_increments_version_and_keeps_created_at() {
        let store = SessionStore::new(Arc::new(MemoryStore::new()));
        let key = SessionKey::new("sms1", "a", "b");
        let first = store
            .create_or_update(&key, |s| {
                assert!(s.is_new());
                s.increment("n");
            })
            .await
            .unwrap();
        let second = store
            .create_or_update(&key, |s| {
                assert!(!s.is_new());
                s.increment("n");
            })
            .await
            .unwrap();
        assert_eq!(first.version(), 1);
        assert_eq!(second.version(), 2);
        assert_eq!(second.counter("n"), 2);
        assert_eq!(second.created_at(), first.created_at());
    }

    #[tokio::test]
    async fn expire_hides_session_from_later_reads() {
        let store = SessionStore::new(Arc::new(MemoryStore::new()))
            .with_cache(Arc::new(MemoryCache::new()));
        let key = SessionKey::new("sms1", "a", "b");
        store.create_or_update(&key, |s| { s.increment("n"); }).await.unwrap();
        store.expire(&key, Duration::ZERO).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());

        // Expiring an absent session is not an error.
        store
            .expire(&SessionKey::new("sms1", "x", "y"), Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expired_session_is_recreated_on_update() {
        let store = SessionStore::new(Arc::new(MemoryStore::new()));
        let key = SessionKey::new("sms1", "a", "b");
        store.create_or_update(&key, |s| { s.increment("n"); }).await.unwrap();
        store.expire(&key, Duration::ZERO).await.unwrap();
        let fresh = store.create_or_update(&key, |s| { s.increment("n"); }).await.unwrap();
        assert_eq!(fresh.counter("n"), 1);
        assert_eq!(fresh.expires_at(), None);
    }
}
