// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Cache
//!
//! Remembers which exchanges (or RPC request types) were already declared on
//! the current connection generation so the hot publish path does not repeat
//! declare calls. Concurrent callers racing on the same name wait for a single
//! declaration; a failed declaration leaves the name undeclared so the next
//! caller tries again.

use crate::errors::AmqpError;
use dashmap::DashMap;
use std::{borrow::Borrow, future::Future, hash::Hash, sync::Arc};
use tokio::sync::OnceCell;

/// A value computed at most once per key and connection generation.
pub(crate) struct GenerationMap<K, T> {
    entries: DashMap<K, Arc<Slot<T>>>,
}

struct Slot<T> {
    generation: u64,
    value: OnceCell<T>,
}

impl<K: Eq + Hash, T: Clone> GenerationMap<K, T> {
    pub(crate) fn new() -> Self {
        GenerationMap {
            entries: DashMap::new(),
        }
    }

    fn slot(&self, key: K, generation: u64) -> Arc<Slot<T>> {
        let fresh = || {
            Arc::new(Slot {
                generation,
                value: OnceCell::new(),
            })
        };

        let mut entry = self.entries.entry(key).or_insert_with(fresh);
        if entry.generation < generation {
            *entry = fresh();
        } else if entry.generation > generation {
            // stale caller: its connection is gone, let it fail on its own
            return fresh();
        }
        Arc::clone(entry.value())
    }

    /// Returns the cached value, running `init` if this generation has none.
    /// The flag is true only for the call whose `init` produced the value.
    pub(crate) async fn get_or_try_init<F, Fut>(
        &self,
        key: K,
        generation: u64,
        init: F,
    ) -> Result<(T, bool), AmqpError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
    {
        let slot = self.slot(key, generation);
        let mut initialized = false;
        let flag = &mut initialized;

        let value = slot
            .value
            .get_or_try_init(move || async move {
                let value = init().await?;
                *flag = true;
                Ok::<T, AmqpError>(value)
            })
            .await?
            .clone();

        Ok((value, initialized))
    }

    pub(crate) fn get<Q>(&self, key: &Q, generation: u64) -> Option<T>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries
            .get(key)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.value.get().cloned())
    }

    /// Drops the entry for `key` if it still belongs to `generation`.
    pub(crate) fn invalidate<Q>(&self, key: &Q, generation: u64)
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries
            .remove_if(key, |_, slot| slot.generation == generation);
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }

    /// Drops every entry created on `generation` or earlier.
    pub(crate) fn clear_through(&self, generation: u64) {
        self.entries.retain(|_, slot| slot.generation > generation);
    }

    /// Removes the initialized entries `evict` selects and returns their values.
    pub(crate) fn evict<F>(&self, mut evict: F) -> Vec<T>
    where
        F: FnMut(&K, &T) -> bool,
    {
        let mut evicted = vec![];
        self.entries.retain(|key, slot| match slot.value.get() {
            Some(value) if evict(key, value) => {
                evicted.push(value.clone());
                false
            }
            _ => true,
        });
        evicted
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|slot| slot.value.initialized())
            .count()
    }
}

/// Names declared on the current connection generation.
pub struct TopologyCache {
    declared: GenerationMap<String, ()>,
}

impl Default for TopologyCache {
    fn default() -> Self {
        TopologyCache::new()
    }
}

impl TopologyCache {
    pub fn new() -> TopologyCache {
        TopologyCache {
            declared: GenerationMap::new(),
        }
    }

    /// Runs `declare` unless `name` is already declared for `generation`.
    ///
    /// Returns true only for the call that performed the declaration.
    pub async fn declare_once<F, Fut>(
        &self,
        name: &str,
        generation: u64,
        declare: F,
    ) -> Result<bool, AmqpError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), AmqpError>>,
    {
        let ((), performed) = self
            .declared
            .get_or_try_init(name.to_owned(), generation, declare)
            .await?;
        Ok(performed)
    }

    pub fn is_declared(&self, name: &str, generation: u64) -> bool {
        self.declared.get(name, generation).is_some()
    }

    /// Forgets every declaration; called when the connection is lost.
    pub fn clear(&self) {
        self.declared.clear();
    }

    /// Forgets declarations made on `generation` or earlier, keeping those of
    /// a connection that came up before the loss was processed.
    pub fn clear_through(&self, generation: u64) {
        self.declared.clear_through(generation);
    }

    pub fn len(&self) -> usize {
        self.declared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn declare_counting(
        cache: &TopologyCache,
        name: &str,
        generation: u64,
        calls: &AtomicUsize,
    ) -> Result<bool, AmqpError> {
        cache
            .declare_once(name, generation, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Ok(())
            })
            .await
    }

    #[tokio::test]
    async fn concurrent_callers_declare_exactly_once() {
        let cache = TopologyCache::new();
        let calls = AtomicUsize::new(0);

        let results = join_all((0..32).map(|_| declare_counting(&cache, "orders", 1, &calls))).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let performed = results.into_iter().filter(|r| *r == Ok(true)).count();
        assert_eq!(performed, 1);
        assert!(cache.is_declared("orders", 1));
    }

    #[tokio::test]
    async fn clear_forces_a_new_declaration() {
        let cache = TopologyCache::new();
        let calls = AtomicUsize::new(0);

        assert_eq!(declare_counting(&cache, "orders", 1, &calls).await, Ok(true));
        assert_eq!(declare_counting(&cache, "orders", 1, &calls).await, Ok(false));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(declare_counting(&cache, "orders", 2, &calls).await, Ok(true));
        assert_eq!(declare_counting(&cache, "orders", 2, &calls).await, Ok(false));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn a_newer_generation_redeclares_without_clear() {
        let cache = TopologyCache::new();
        let calls = AtomicUsize::new(0);

        declare_counting(&cache, "orders", 1, &calls).await.unwrap();
        assert!(declare_counting(&cache, "orders", 2, &calls).await.unwrap());
        assert!(!cache.is_declared("orders", 1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clear_through_keeps_newer_generations() {
        let cache = TopologyCache::new();
        let calls = AtomicUsize::new(0);

        declare_counting(&cache, "orders", 1, &calls).await.unwrap();
        declare_counting(&cache, "invoices", 2, &calls).await.unwrap();
        cache.clear_through(1);

        assert!(!cache.is_declared("orders", 1));
        assert!(cache.is_declared("invoices", 2));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn failed_declarations_are_not_cached() {
        let cache = TopologyCache::new();

        let failed = cache
            .declare_once("orders", 1, || async {
                Err(AmqpError::DeclareExchangeError("orders".into()))
            })
            .await;
        assert!(failed.is_err());
        assert!(!cache.is_declared("orders", 1));

        let calls = AtomicUsize::new(0);
        assert_eq!(declare_counting(&cache, "orders", 1, &calls).await, Ok(true));
    }
}
