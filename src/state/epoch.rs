//! Epoch tracking for concurrent reprocessing.
//!
//! An epoch is a monotonic generation counter per state key. Writers record
//! the epoch their read was made under; once a key is invalidated, writes
//! carrying the old epoch are dropped as stale.
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

use super::cache::CachingStateProvider;
use super::{StateProvider, StateRef};
use crate::{Error, Message};

/// Epoch value every key starts at, and returns to after eviction.
pub const INITIAL_EPOCH: u64 = 1;

type InvalidateHook = Box<dyn Fn(&str, u64) + Send + Sync>;

/// Shared map from state key to generation counter.
#[derive(Default)]
pub struct EpochManager {
    epochs: Mutex<FxHashMap<String, u64>>,
    hooks: Mutex<Vec<InvalidateHook>>,
}

impl EpochManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        EpochManager::default()
    }

    /// Current epoch of a key; keys start at [INITIAL_EPOCH].
    pub fn get(&self, key: &str) -> u64 {
        self.epochs
            .lock()
            .expect("epoch lock")
            .get(key)
            .copied()
            .unwrap_or(INITIAL_EPOCH)
    }

    /// Increments the epoch of a key and notifies invalidation hooks.
    /// Returns the new epoch.
    pub fn invalidate(&self, key: &str) -> u64 {
        let next = {
            let mut epochs = self.epochs.lock().expect("epoch lock");
            let entry = epochs.entry(key.to_string()).or_insert(INITIAL_EPOCH);
            *entry += 1;
            *entry
        };
        debug!(key, epoch = next, "epoch invalidated");
        for hook in self.hooks.lock().expect("hook lock").iter() {
            hook(key, next);
        }
        next
    }

    /// Drops the entry for a key; the epoch resets to [INITIAL_EPOCH] on
    /// next use.
    pub fn evict(&self, key: &str) {
        if self.epochs.lock().expect("epoch lock").remove(key).is_some() {
            trace!(key, "epoch entry evicted");
        }
    }

    /// Registers a hook fired after each invalidation with the key and its
    /// new epoch.
    pub fn on_invalidate(&self, hook: impl Fn(&str, u64) + Send + Sync + 'static) {
        self.hooks.lock().expect("hook lock").push(Box::new(hook));
    }
}

impl std::fmt::Debug for EpochManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochManager")
            .field("epochs", &self.epochs.lock().expect("epoch lock"))
            .finish()
    }
}

/// Wrapper binding a caching provider to an [EpochManager].
///
/// Reads attach the key's current epoch to the returned reference; write-backs
/// carrying an older epoch are dropped. The two lifecycles are bridged with
/// one-way hooks: cache eviction evicts the epoch entry, and epoch
/// invalidation drops the cached entry.
pub struct EpochAwareStateProvider {
    cache: Arc<CachingStateProvider>,
    epochs: Arc<EpochManager>,
}

impl EpochAwareStateProvider {
    /// Builds the wrapper and registers the lifecycle bridge on both sides.
    pub fn new(cache: Arc<CachingStateProvider>, epochs: Arc<EpochManager>) -> Self {
        let weak_epochs = Arc::downgrade(&epochs);
        cache.on_evicted(move |key| {
            if let Some(epochs) = weak_epochs.upgrade() {
                epochs.evict(key);
            }
        });
        let weak_cache = Arc::downgrade(&cache);
        epochs.on_invalidate(move |key, _epoch| {
            if let Some(cache) = weak_cache.upgrade() {
                cache.invalidate_sync(&[key.to_string()]);
            }
        });
        EpochAwareStateProvider { cache, epochs }
    }

    /// The epoch manager this provider consults.
    pub fn epochs(&self) -> Arc<EpochManager> {
        Arc::clone(&self.epochs)
    }
}

#[async_trait]
impl StateProvider for EpochAwareStateProvider {
    async fn get(&self, key: &str, at_sn: Option<u64>) -> Result<StateRef, Error> {
        let mut reference = self.cache.get(key, at_sn).await?;
        reference.epoch = Some(self.epochs.get(key));
        Ok(reference)
    }

    fn compute(&self, base: &StateRef, events: &[Message]) -> Result<StateRef, Error> {
        self.cache.compute(base, events)
    }

    async fn set(&self, reference: StateRef) {
        let current = self.epochs.get(&reference.key);
        match reference.epoch {
            Some(epoch) if epoch != current => {
                debug!(
                    key = reference.key,
                    epoch,
                    current,
                    "dropping write-back from a stale epoch"
                );
            }
            _ => self.cache.set(reference).await,
        }
    }

    async fn invalidate(&self, keys: &[String]) {
        for key in keys {
            // the invalidation hook drops the cached entry
            let _ = self.epochs.invalidate(key);
        }
    }
}
