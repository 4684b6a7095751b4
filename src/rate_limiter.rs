// =============================================================================
// Rate Limiter + TTL response cache
// =============================================================================
//
// Two cooperating pieces:
//
//   RateLimiter — per-key minimum-interval throttle. Keys are
//     `(account_id, endpoint)` strings; distinct keys are independent, calls
//     on one key are serialized behind its mutex. A small jitter (<= 10% of
//     the remaining wait) decorrelates callers. A global semaphore caps
//     concurrent outbound calls across all keys so that many accounts waking
//     at once cannot burst the venues.
//
//   TtlCache — response cache keyed by request identity. Candles are cached
//     for one scan cycle, product lists for an hour.
// =============================================================================

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

#[derive(Default)]
struct KeySlot {
    last_called: Option<Instant>,
}

/// Permit covering one outbound call. Holding it counts against the global
/// concurrency cap; drop it when the HTTP call completes.
pub struct RatePermit {
    _global: OwnedSemaphorePermit,
}

/// Per-key minimum-interval limiter with a global concurrency cap.
pub struct RateLimiter {
    global: Arc<Semaphore>,
    keys: parking_lot::Mutex<HashMap<String, Arc<AsyncMutex<KeySlot>>>>,
}

impl RateLimiter {
    /// `global_concurrency` bounds in-flight outbound calls across all keys.
    pub fn new(global_concurrency: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global_concurrency.max(1))),
            keys: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<KeySlot>> {
        let mut keys = self.keys.lock();
        keys.entry(key.to_string()).or_default().clone()
    }

    /// Block until at least `min_interval` has passed since the previous call
    /// on `key`, then return a permit the caller holds for the duration of
    /// the outbound call.
    pub async fn acquire(&self, key: &str, min_interval: Duration) -> RatePermit {
        let slot = self.slot(key);

        {
            let mut guard = slot.lock().await;

            if let Some(last) = guard.last_called {
                let elapsed = last.elapsed();
                if elapsed < min_interval {
                    let remainder = min_interval - elapsed;
                    // Jitter up to 10% of the remaining wait.
                    let jitter_ms = {
                        let cap = (remainder.as_millis() as u64) / 10;
                        if cap == 0 {
                            0
                        } else {
                            rand::thread_rng().gen_range(0..=cap)
                        }
                    };
                    let wait = remainder + Duration::from_millis(jitter_ms);
                    trace!(key, wait_ms = wait.as_millis() as u64, "rate limiter waiting");
                    tokio::time::sleep(wait).await;
                }
            }

            guard.last_called = Some(Instant::now());
        }

        let permit = self
            .global
            .clone()
            .acquire_owned()
            .await
            .expect("rate limiter semaphore never closed");

        RatePermit { _global: permit }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("tracked_keys", &self.keys.lock().len())
            .field("available_permits", &self.global.available_permits())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TtlCache
// ---------------------------------------------------------------------------

struct CacheEntry<V> {
    stored_at: Instant,
    value: V,
}

/// Read-mostly cache whose entries expire after a fixed TTL.
pub struct TtlCache<K, V> {
    ttl: Duration,
    map: parking_lot::RwLock<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            map: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    /// Return the cached value for `key` if it is still fresh.
    pub fn get(&self, key: &K) -> Option<V> {
        let map = self.map.read();
        let entry = map.get(key)?;
        if entry.stored_at.elapsed() < self.ttl {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    /// Store a value, evicting any expired entries while the write lock is
    /// held.
    pub fn insert(&self, key: K, value: V) {
        let mut map = self.map.write();
        let ttl = self.ttl;
        map.retain(|_, e| e.stored_at.elapsed() < ttl);
        map.insert(
            key,
            CacheEntry {
                stored_at: Instant::now(),
                value,
            },
        );
        debug!(entries = map.len(), "ttl cache updated");
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_enforces_min_interval() {
        let limiter = RateLimiter::new(4);
        let start = Instant::now();

        let _ = limiter.acquire("acct:candles", Duration::from_millis(50)).await;
        let _ = limiter.acquire("acct:candles", Duration::from_millis(50)).await;

        // Second call had to wait at least the minimum interval.
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn rate_limiter_keys_are_independent() {
        let limiter = RateLimiter::new(4);
        let start = Instant::now();

        let _ = limiter.acquire("a:candles", Duration::from_millis(200)).await;
        let _ = limiter.acquire("b:candles", Duration::from_millis(200)).await;

        // Different keys never wait on each other.
        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn rate_limiter_first_call_is_immediate() {
        let limiter = RateLimiter::new(1);
        let start = Instant::now();
        let _ = limiter.acquire("fresh", Duration::from_secs(5)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn ttl_cache_returns_fresh_values() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        cache.insert("BTC-USD".into(), 7);
        assert_eq!(cache.get(&"BTC-USD".to_string()), Some(7));
        assert_eq!(cache.get(&"ETH-USD".to_string()), None);
    }

    #[test]
    fn ttl_cache_expires_values() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_millis(0));
        cache.insert("BTC-USD".into(), 7);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&"BTC-USD".to_string()), None);
    }

    #[test]
    fn ttl_cache_insert_evicts_expired() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_millis(10));
        cache.insert("a".into(), 1);
        std::thread::sleep(Duration::from_millis(20));
        cache.insert("b".into(), 2);
        assert_eq!(cache.len(), 1);
    }
}
