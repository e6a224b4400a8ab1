//! Key/value cache with per-entry expiry
//!
//! Records that a unit of work has already been done (e.g. a pod was evicted)
//! so repeated callers can skip it until the entry expires. Lookups never
//! block on the sweep; the sweep only reclaims memory.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Default entry lifetime (5 minutes)
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(5 * 60);

/// Default sweep period (1 minute)
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Shortest accepted sweep period; smaller values are raised to it
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache has been shut down")]
    Closed,
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Concurrent cache whose entries expire after a TTL
#[derive(Debug)]
pub struct ExpireCache<K, V>
where
    K: Eq + Hash,
{
    items: DashMap<K, Entry<V>>,
    default_ttl: Duration,
    sweep_interval: Duration,
    closed: AtomicBool,
}

impl<K, V> ExpireCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(default_ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            items: DashMap::new(),
            default_ttl,
            sweep_interval: sweep_interval.max(MIN_SWEEP_INTERVAL),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_EXPIRATION, DEFAULT_SWEEP_INTERVAL)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Insert or refresh an entry with the default TTL
    pub fn set_default(&self, key: K, value: V) -> Result<(), CacheError> {
        self.set(key, value, self.default_ttl)
    }

    /// Insert or refresh an entry with an explicit TTL
    pub fn set(&self, key: K, value: V, ttl: Duration) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        self.items.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    /// Look up a live entry. Expired entries read as absent even before the
    /// sweep has removed them.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.items
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Number of stored entries, expired ones included until the next sweep
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn delete_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.items.len();
        self.items.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.items.len())
    }

    /// Start the background sweep. Must be called once before first use;
    /// the task exits and closes the cache when `shutdown` fires.
    pub fn run(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                ttl_secs = cache.default_ttl.as_secs(),
                sweep_ms = cache.sweep_interval.as_millis() as u64,
                "Starting expire cache sweep"
            );
            let mut ticker = interval(cache.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.delete_expired();
                        if removed > 0 {
                            debug!(removed, remaining = cache.len(), "Swept expired cache entries");
                        }
                    }
                    _ = shutdown.recv() => {
                        cache.closed.store(true, Ordering::Release);
                        info!("Shutting down expire cache sweep");
                        break;
                    }
                }
            }
        })
    }
}
