//! LRU caching wrapper for state providers.
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::{StateProvider, StateRef};
use crate::{Error, Message};

type EvictHook = Box<dyn Fn(&str) + Send + Sync>;

struct CachedEntry {
    reference: StateRef,
    stored_at: Instant,
}

/// Caches state references by key in front of an inner provider.
///
/// Reads hand out clones, isolating caller mutations from the cache.
/// Explicit invalidation removes entries silently; only organic eviction
/// (capacity pressure or TTL expiry) fires the registered eviction hooks.
pub struct CachingStateProvider {
    inner: Arc<dyn StateProvider>,
    cache: Mutex<LruCache<String, CachedEntry>>,
    max_ttl: Option<Duration>,
    evict_hooks: Mutex<Vec<EvictHook>>,
}

impl CachingStateProvider {
    /// Wraps `inner` with a cache of the given capacity and optional
    /// per-entry time-to-live.
    pub fn new(inner: Arc<dyn StateProvider>, capacity: usize, max_ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        CachingStateProvider {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            max_ttl,
            evict_hooks: Mutex::new(Vec::new()),
        }
    }

    /// Registers a hook fired when the cache organically evicts a key
    /// (capacity pressure or TTL), but not on explicit invalidation.
    pub fn on_evicted(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.evict_hooks.lock().expect("hook lock").push(Box::new(hook));
    }

    fn fire_evicted(&self, key: &str) {
        for hook in self.evict_hooks.lock().expect("hook lock").iter() {
            hook(key);
        }
    }

    fn expired(&self, entry: &CachedEntry) -> bool {
        match self.max_ttl {
            Some(ttl) => entry.stored_at.elapsed() >= ttl,
            None => false,
        }
    }

    /// Looks up a key, handling TTL expiry. Returns a clone.
    fn lookup(&self, key: &str) -> Option<StateRef> {
        let mut cache = self.cache.lock().expect("cache lock");
        let expired = match cache.get(key) {
            Some(entry) if self.expired(entry) => true,
            Some(entry) => return Some(entry.reference.clone()),
            None => return None,
        };
        if expired {
            let _ = cache.pop(key);
            drop(cache);
            trace!(key, "cache entry expired");
            self.fire_evicted(key);
        }
        None
    }

    /// Inserts a reference unless the cache already holds a higher sequence
    /// number for the key. Fires eviction hooks for entries displaced by
    /// capacity pressure.
    fn store(&self, reference: StateRef) {
        let displaced = {
            let mut cache = self.cache.lock().expect("cache lock");
            if let Some(existing) = cache.peek(&reference.key) {
                if existing.reference.seq_num > reference.seq_num && !self.expired(existing) {
                    trace!(
                        key = reference.key,
                        cached_sn = existing.reference.seq_num,
                        offered_sn = reference.seq_num,
                        "skipping write-back of older state"
                    );
                    return;
                }
            }
            let key = reference.key.clone();
            cache
                .push(
                    key.clone(),
                    CachedEntry {
                        reference,
                        stored_at: Instant::now(),
                    },
                )
                .filter(|(displaced_key, _)| *displaced_key != key)
        };
        if let Some((key, _)) = displaced {
            debug!(key, "cache evicted entry under capacity pressure");
            self.fire_evicted(&key);
        }
    }

    /// Removes entries for the keys without firing eviction hooks.
    pub(crate) fn invalidate_sync(&self, keys: &[String]) {
        let mut cache = self.cache.lock().expect("cache lock");
        for key in keys {
            if cache.pop(key).is_some() {
                trace!(key, "cache entry invalidated");
            }
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.cache.lock().expect("cache lock").len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateProvider for CachingStateProvider {
    async fn get(&self, key: &str, at_sn: Option<u64>) -> Result<StateRef, Error> {
        if let Some(cached) = self.lookup(key) {
            match at_sn {
                Some(sn) if cached.seq_num != sn => {
                    debug!(
                        key,
                        cached_sn = cached.seq_num,
                        requested_sn = sn,
                        "cached state does not match requested sequence"
                    );
                }
                _ => return Ok(cached),
            }
        }
        let loaded = self.inner.get(key, at_sn).await?;
        self.store(loaded.clone());
        Ok(loaded)
    }

    fn compute(&self, base: &StateRef, events: &[Message]) -> Result<StateRef, Error> {
        self.inner.compute(base, events)
    }

    async fn set(&self, reference: StateRef) {
        self.store(reference);
    }

    async fn invalidate(&self, keys: &[String]) {
        self.invalidate_sync(keys);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::state::test_support::{tally_aggregator, MemoryStreams};
    use crate::state::EventSourcedStateProvider;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn provider_over(streams: Arc<MemoryStreams>, capacity: usize) -> CachingStateProvider {
        let inner = EventSourcedStateProvider::new(streams, Arc::new(tally_aggregator()));
        CachingStateProvider::new(Arc::new(inner), capacity, None)
    }

    #[tokio::test]
    async fn second_get_is_served_from_cache() {
        let streams = Arc::new(MemoryStreams::default());
        streams.append("tally-1", Message::new("ledger.Increment", json!({ "count": 4 })));
        let cache = provider_over(Arc::clone(&streams), 10);

        let first = cache.get("tally-1", None).await.expect("get");
        assert_eq!(first.seq_num, 1);

        // a write the cache has not seen is not observed on the cached path
        streams.append("tally-1", Message::new("ledger.Increment", json!({ "count": 7 })));
        let second = cache.get("tally-1", None).await.expect("get");
        assert_eq!(second.seq_num, 1);
    }

    #[tokio::test]
    async fn mismatched_at_sn_consults_inner_provider() {
        let streams = Arc::new(MemoryStreams::default());
        streams.append("tally-1", Message::new("ledger.Increment", json!({ "count": 4 })));
        let cache = provider_over(Arc::clone(&streams), 10);

        let _ = cache.get("tally-1", None).await.expect("get");
        streams.append("tally-1", Message::new("ledger.Increment", json!({ "count": 7 })));

        let pinned = cache.get("tally-1", Some(2)).await.expect("get");
        assert_eq!(pinned.seq_num, 2);
        assert_eq!(pinned.state["total"], json!(11));
    }

    #[tokio::test]
    async fn cached_state_is_cloned_out() {
        let streams = Arc::new(MemoryStreams::default());
        streams.append("tally-1", Message::new("ledger.Increment", json!({ "count": 4 })));
        let cache = provider_over(streams, 10);

        let mut first = cache.get("tally-1", None).await.expect("get");
        first.state["total"] = json!(999);

        let second = cache.get("tally-1", None).await.expect("get");
        assert_eq!(second.state["total"], json!(4));
    }

    #[tokio::test]
    async fn set_keeps_newest_sequence() {
        let streams = Arc::new(MemoryStreams::default());
        let cache = provider_over(streams, 10);

        cache.set(StateRef::new(json!({ "total": 11 }), "tally-1", 2)).await;
        cache.set(StateRef::new(json!({ "total": 4 }), "tally-1", 1)).await;

        let cached = cache.lookup("tally-1").expect("entry");
        assert_eq!(cached.seq_num, 2);
        assert_eq!(cached.state["total"], json!(11));
    }

    #[tokio::test]
    async fn invalidate_removes_without_firing_hooks() {
        let streams = Arc::new(MemoryStreams::default());
        let cache = provider_over(streams, 10);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        cache.on_evicted(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cache.set(StateRef::new(json!({}), "tally-1", 1)).await;
        cache.invalidate(&["tally-1".to_string()]).await;

        assert!(cache.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn capacity_pressure_fires_eviction_hook() {
        let streams = Arc::new(MemoryStreams::default());
        let cache = provider_over(streams, 2);
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&evicted);
        cache.on_evicted(move |key| seen.lock().expect("lock").push(key.to_string()));

        cache.set(StateRef::new(json!({}), "a", 1)).await;
        cache.set(StateRef::new(json!({}), "b", 1)).await;
        cache.set(StateRef::new(json!({}), "c", 1)).await;

        assert_eq!(*evicted.lock().expect("lock"), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn expired_entries_fire_hook_and_reload() {
        let streams = Arc::new(MemoryStreams::default());
        streams.append("tally-1", Message::new("ledger.Increment", json!({ "count": 4 })));
        let inner = EventSourcedStateProvider::new(
            Arc::clone(&streams) as Arc<dyn state::AggregationSource>,
            Arc::new(tally_aggregator()),
        );
        let cache =
            CachingStateProvider::new(Arc::new(inner), 10, Some(Duration::from_millis(10)));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        cache.on_evicted(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let _ = cache.get("tally-1", None).await.expect("get");
        streams.append("tally-1", Message::new("ledger.Increment", json!({ "count": 7 })));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reloaded = cache.get("tally-1", None).await.expect("get");
        assert_eq!(reloaded.seq_num, 2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
