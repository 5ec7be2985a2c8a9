//! The two-tier cache proper.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use prm_schemas::{CacheStats, CacheStrategy};

use crate::l1::MemoryCache;
use crate::l2::RedisStore;

const KEY_PREFIX: &str = "disc:";
/// Keys longer than this are replaced by a digest to stay backend-safe.
const MAX_RAW_KEY: usize = 200;
/// Hot data stays at most this long in L1 regardless of the logical TTL.
const L1_TTL_CAP: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Counters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
}

/// L1 in-memory + optional Redis L2, ETag-aware.
pub struct DiscoveryCache {
    default_ttl: Duration,
    l1: Mutex<MemoryCache>,
    /// `None` once unconfigured, unreachable, or closed.
    l2: std::sync::RwLock<Option<RedisStore>>,
    counters: Counters,
}

impl DiscoveryCache {
    /// L1-only cache.
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            l1: Mutex::new(MemoryCache::new(max_entries)),
            l2: std::sync::RwLock::new(None),
            counters: Counters::default(),
        }
    }

    /// Attach a Redis L2 when a URL is configured. A connection failure
    /// degrades to L1-only with a warning, not an error.
    pub async fn with_redis(
        redis_url: Option<&str>,
        max_entries: usize,
        default_ttl: Duration,
    ) -> Self {
        let l2 = match redis_url {
            None => None,
            Some(url) => match RedisStore::connect(url).await {
                Ok(store) => Some(store),
                Err(e) => {
                    warn!(error = %e, "redis unavailable, running L1-only");
                    None
                }
            },
        };
        Self {
            default_ttl,
            l1: Mutex::new(MemoryCache::new(max_entries)),
            l2: std::sync::RwLock::new(l2),
            counters: Counters::default(),
        }
    }

    /// Cheap clone of the L2 handle for one operation.
    fn l2_store(&self) -> Option<RedisStore> {
        self.l2.read().expect("l2 lock poisoned").clone()
    }

    /// Release the L2 connection. Subsequent operations run L1-only; safe
    /// to call more than once.
    pub fn close(&self) {
        if self.l2.write().expect("l2 lock poisoned").take().is_some() {
            debug!("redis connection released");
        }
    }

    /// `disc:<key>`, or `disc:<sha256[:16]>` for oversized keys.
    fn normalize_key(key: &str) -> String {
        if key.len() > MAX_RAW_KEY {
            let digest = hex::encode(Sha256::digest(key.as_bytes()));
            format!("{KEY_PREFIX}{}", &digest[..16])
        } else {
            format!("{KEY_PREFIX}{key}")
        }
    }

    fn l1_ttl(ttl: Duration) -> Duration {
        ttl.min(L1_TTL_CAP)
    }

    fn bump_error(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Total entries across both tiers (L2 count is approximate).
    pub async fn entry_count(&self) -> usize {
        let mut total = self.l1.lock().await.len();
        if let Some(l2) = self.l2_store() {
            match l2.count_matching("disc:*").await {
                Ok(n) => total += n,
                Err(e) => {
                    debug!(error = %e, "l2 entry count failed");
                    self.bump_error();
                }
            }
        }
        total
    }

    /// Bulk-load entries, each optionally with an ETag.
    pub async fn warm(&self, entries: Vec<(String, Value, Option<String>)>, ttl: Option<Duration>) {
        for (key, value, etag) in entries {
            match etag {
                Some(tag) => self.set_with_etag(&key, value, &tag, ttl).await,
                None => self.set(&key, value, ttl).await,
            }
        }
    }

    /// Round-trip probe of each tier.
    pub async fn health_check(&self) -> CacheHealth {
        let probe_key = "disc:health_probe";

        let l1 = {
            let mut l1 = self.l1.lock().await;
            l1.set(probe_key.into(), Value::from("ok"), Duration::from_secs(1));
            let ok = l1.get(probe_key) == Some(Value::from("ok"));
            l1.remove(probe_key);
            LayerHealth {
                healthy: ok,
                error: (!ok).then(|| "round trip failed".to_string()),
            }
        };

        let l2_store = self.l2_store();
        let l2 = match &l2_store {
            None => LayerHealth {
                healthy: false,
                error: Some("not configured".into()),
            },
            Some(store) => {
                let outcome = async {
                    store.set_ex(probe_key, b"ok".to_vec(), 1).await?;
                    let got = store.get(probe_key).await?;
                    store.del(probe_key).await?;
                    Ok::<_, redis::RedisError>(got == Some(b"ok".to_vec()))
                }
                .await;
                match outcome {
                    Ok(true) => LayerHealth {
                        healthy: true,
                        error: None,
                    },
                    Ok(false) => LayerHealth {
                        healthy: false,
                        error: Some("round trip mismatch".into()),
                    },
                    Err(e) => LayerHealth {
                        healthy: false,
                        error: Some(e.to_string()),
                    },
                }
            }
        };

        // An unconfigured L2 degrades to L1-only without failing the cache.
        let healthy = l1.healthy && (l2_store.is_none() || l2.healthy);
        CacheHealth { healthy, l1, l2 }
    }
}

#[async_trait]
impl CacheStrategy for DiscoveryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        let cache_key = Self::normalize_key(key);

        if let Some(value) = self.l1.lock().await.get(&cache_key) {
            self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        if let Some(l2) = self.l2_store() {
            match l2.get(&cache_key).await {
                Ok(Some(bytes)) => match serde_json::from_slice::<Value>(&bytes) {
                    Ok(value) => {
                        self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                        // Back-fill L1 with the short cap so hot data stays
                        // bounded-stale.
                        self.l1
                            .lock()
                            .await
                            .set(cache_key, value.clone(), L1_TTL_CAP);
                        return Some(value);
                    }
                    Err(e) => {
                        debug!(error = %e, "l2 value decode failed");
                        self.bump_error();
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "l2 get failed");
                    self.bump_error();
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let cache_key = Self::normalize_key(key);
        self.counters.sets.fetch_add(1, Ordering::Relaxed);

        self.l1
            .lock()
            .await
            .set(cache_key.clone(), value.clone(), Self::l1_ttl(ttl));

        if let Some(l2) = self.l2_store() {
            match serde_json::to_vec(&value) {
                Ok(bytes) => {
                    if let Err(e) = l2.set_ex(&cache_key, bytes, ttl.as_secs().max(1)).await {
                        warn!(error = %e, "l2 set failed");
                        self.bump_error();
                    }
                }
                Err(e) => {
                    debug!(error = %e, "value serialize failed");
                    self.bump_error();
                }
            }
        }
    }

    async fn invalidate(&self, pattern: &str) -> usize {
        let full_pattern = format!("{KEY_PREFIX}*{pattern}*");
        let mut removed = self.l1.lock().await.invalidate(&full_pattern);

        if let Some(l2) = self.l2_store() {
            match l2.del_matching(&full_pattern).await {
                Ok(n) => removed += n,
                Err(e) => {
                    warn!(error = %e, "l2 invalidate failed");
                    self.bump_error();
                }
            }
        }
        removed
    }

    async fn get_with_etag(&self, key: &str) -> (Option<Value>, Option<String>) {
        let value = self.get(key).await;
        let etag = self
            .get(&format!("{key}:etag"))
            .await
            .and_then(|v| v.as_str().map(String::from));
        (value, etag)
    }

    async fn set_with_etag(&self, key: &str, value: Value, etag: &str, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let cache_key = Self::normalize_key(key);
        let etag_key = Self::normalize_key(&format!("{key}:etag"));
        self.counters.sets.fetch_add(2, Ordering::Relaxed);

        // Both companions land under one L1 lock acquisition.
        {
            let mut l1 = self.l1.lock().await;
            l1.set(cache_key.clone(), value.clone(), Self::l1_ttl(ttl));
            l1.set(etag_key.clone(), Value::from(etag), Self::l1_ttl(ttl));
        }

        if let Some(l2) = self.l2_store() {
            let secs = ttl.as_secs().max(1);
            let value_bytes = serde_json::to_vec(&value).unwrap_or_default();
            let etag_bytes = serde_json::to_vec(&Value::from(etag)).unwrap_or_default();
            if let Err(e) = l2.set_ex(&cache_key, value_bytes, secs).await {
                warn!(error = %e, "l2 set failed");
                self.bump_error();
            }
            if let Err(e) = l2.set_ex(&etag_key, etag_bytes, secs).await {
                warn!(error = %e, "l2 etag set failed");
                self.bump_error();
            }
        }
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            l1_hits: self.counters.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.counters.l2_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }
}

/// Per-layer health verdict.
#[derive(Debug, Clone, Serialize)]
pub struct LayerHealth {
    pub healthy: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheHealth {
    pub healthy: bool,
    pub l1: LayerHealth,
    pub l2: LayerHealth,
}

// ---------------------------------------------------------------------------
// Tests (L1-only; the Redis tier needs a live server)
// ---------------------------------------------------------------------------
