//! In-process key/value cache shared between request workers.
//!
//! Memory is bounded by a total cost budget: every entry is stored with a
//! caller-supplied cost, least recently used entries are evicted until the
//! budget holds again, and an entry that alone exceeds the budget is refused.
//! Nothing is persisted; callers must be able to rebuild any value on a miss.

use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lru::LruCache;

struct Entry<V> {
    value: V,
    cost: u64,
}

struct Inner<K: Hash + Eq, V> {
    entries: LruCache<K, Entry<V>>,
    total_cost: u64,
}

pub struct Cache<K: Hash + Eq, V> {
    inner: Mutex<Inner<K, V>>,
    max_cost: u64,
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    pub fn new(max_cost: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_cost: 0,
            }),
            max_cost,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().entries.get(key).map(|entry| entry.value.clone())
    }

    /// Stores `value` under `key`. Returns `false` when the entry was refused
    /// because its cost alone exceeds the budget.
    pub fn set(&self, key: K, value: V, cost: u64) -> bool {
        if cost > self.max_cost {
            return false;
        }

        let mut inner = self.lock();
        if let Some(previous) = inner.entries.put(key, Entry { value, cost }) {
            inner.total_cost -= previous.cost;
        }
        inner.total_cost += cost;

        while inner.total_cost > self.max_cost {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => inner.total_cost -= evicted.cost,
                None => break,
            }
        }

        true
    }

    pub fn invalidate(&self, key: &K) -> bool {
        let mut inner = self.lock();
        match inner.entries.pop(key) {
            Some(removed) => {
                inner.total_cost -= removed.cost;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_cost(&self) -> u64 {
        self.lock().total_cost
    }
}
