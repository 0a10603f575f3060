//! Volatile cache in front of the durable store. Purely an optimisation: callers treat any
//! cache error as a miss.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone, thiserror::Error)]
#[error("session cache unavailable: {0}")]
pub struct CacheError(pub String);

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Schedule removal after `ttl`. Returns false when the key is not cached.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;
}

struct Entry {
    value: Vec<u8>,
    expires: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires.map_or(true, |at| at > now)
    }
}

/// In-process TTL cache. Expired entries are dropped lazily on access.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        {
            let g = self.entries.read().await;
            match g.get(key) {
                None => return Ok(None),
                Some(e) if e.live(now) => return Ok(Some(e.value.clone())),
                Some(_) => {}
            }
        }
        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires = ttl.map(|d| Instant::now() + d);
        self.entries
            .write()
            .await
            .insert(key.to_string(), Entry { value, expires });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut g = self.entries.write().await;
        match g.get_mut(key) {
            Some(e) if e.live(now) => {
                e.expires = Some(now + ttl);
                Ok(true)
            }
            Some(_) => {
                g.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = MemoryCache::new();
        cache.set("a", b"1".to_vec(), Some(Duration::from_secs(10))).await.unwrap();
        cache.set("b", b"2".to_vec(), None).await.unwrap();
        assert!(cache.expire("b", Duration::from_secs(5)).await.unwrap());
        assert!(!cache.expire("missing", Duration::from_secs(5)).await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(cache.get("b").await.unwrap(), None);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.get("a").await.unwrap(), None);
    }
}
