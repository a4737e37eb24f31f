//! Key-indexed counter registry.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use super::key::LimitKey;
use crate::error::Result;

/// Per-key capacity state managed by a [`Registry`].
pub trait Counter: Send + Sync + 'static {
    /// Release background resources. Must be safe to call more than once.
    fn retire(&self);

    /// Whether the counter can be dropped without changing any future decision.
    fn is_idle(&self) -> bool {
        false
    }
}

type Factory<C> = dyn Fn(&LimitKey) -> C + Send + Sync;

/// Maps keys to counters, creating them on first use.
///
/// The map is sharded, so lookups for different keys rarely contend and a key is
/// only write-locked while its counter is being created.
pub struct Registry<C: Counter> {
    counters: DashMap<LimitKey, Arc<C>>,
    factory: Box<Factory<C>>,
}

impl<C: Counter> Registry<C> {
    /// Create an empty registry that builds counters with `factory`.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&LimitKey) -> C + Send + Sync + 'static,
    {
        Self {
            counters: DashMap::new(),
            factory: Box::new(factory),
        }
    }

    /// Validate `key` and return its counter, creating it if needed.
    pub fn get_or_create(&self, key: &str) -> Result<Arc<C>> {
        let key = LimitKey::new(key)?;
        Ok(self.get_or_create_key(&key))
    }

    /// Return the counter for an already validated key, creating it if needed.
    ///
    /// Racing callers for the same unseen key all receive the same counter. The
    /// returned handle is not pinned: an eviction sweep may drop it from the map
    /// afterwards. Use [`Registry::with`] to act on a counter that must stay live.
    pub fn get_or_create_key(&self, key: &LimitKey) -> Arc<C> {
        if let Some(counter) = self.counters.get(key) {
            return counter.clone();
        }

        self.counters
            .entry(key.clone())
            .or_insert_with(|| self.create(key))
            .clone()
    }

    /// Validate `key` and run `f` against its counter, creating it if needed.
    ///
    /// The entry stays locked for the duration of `f`, so an eviction sweep cannot
    /// retire the counter between lookup and use. `f` must not call back into this
    /// registry.
    pub fn with<T>(&self, key: &str, f: impl FnOnce(&C) -> T) -> Result<T> {
        let key = LimitKey::new(key)?;

        if let Some(counter) = self.counters.get(&key) {
            return Ok(f(&counter));
        }

        let counter = self
            .counters
            .entry(key.clone())
            .or_insert_with(|| self.create(&key))
            .downgrade();
        Ok(f(&counter))
    }

    fn create(&self, key: &LimitKey) -> Arc<C> {
        debug!(key = %key, "Creating new rate limit counter");
        Arc::new((self.factory)(key))
    }

    /// Look up a counter without creating one.
    pub fn get(&self, key: &LimitKey) -> Option<Arc<C>> {
        self.counters.get(key).map(|c| c.clone())
    }

    /// Whether a counter exists for `key`.
    pub fn contains(&self, key: &LimitKey) -> bool {
        self.counters.contains_key(key)
    }

    /// Retire and remove every idle counter. Returns how many were evicted.
    ///
    /// Idle keys are collected first, then each is removed only if it is still idle
    /// under its entry lock, so a key touched mid-sweep survives.
    pub fn evict_idle(&self) -> usize {
        let candidates: Vec<LimitKey> = self
            .counters
            .iter()
            .filter(|entry| entry.value().is_idle())
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for key in candidates {
            if let Some((key, counter)) = self.counters.remove_if(&key, |_, c| c.is_idle()) {
                counter.retire();
                trace!(key = %key, "Evicted idle rate limit counter");
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!(
                evicted = evicted,
                remaining = self.counters.len(),
                "Evicted idle rate limit counters"
            );
        }
        evicted
    }

    /// Retire and remove every counter.
    pub fn destroy_all(&self) {
        let keys: Vec<LimitKey> = self.counters.iter().map(|e| e.key().clone()).collect();

        for key in keys {
            if let Some((_, counter)) = self.counters.remove(&key) {
                counter.retire();
            }
        }
    }

    /// Get the number of active counters.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the registry holds no counters.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl<C: Counter> Drop for Registry<C> {
    fn drop(&mut self) {
        self.destroy_all();
    }
}
