//! Reusable buffer pools for the per-tick hot path.
//!
//! Every set, list, tree and dictionary used during tick processing is
//! checked out of a pool and returned once the tick (or the retaining cache
//! entry) is done with it, keeping steady-state ticks allocation-free.
//! Ownership is enforced by move semantics: a checked-out buffer is a plain
//! value, and returning it is the only way to hand it back.

use parking_lot::Mutex;

use crate::util::{FxHashMap, FxHashSet};

/// Maximum number of objects retained per pool. Excess returns are dropped.
pub const MAX_POOL_SIZE: usize = 1024;

/// A poolable buffer: can be wiped for reuse and inspected for emptiness.
pub trait Recycle: Default {
    fn recycle(&mut self);
    fn is_clear(&self) -> bool;
}

impl<T> Recycle for Vec<T> {
    fn recycle(&mut self) {
        self.clear();
    }

    fn is_clear(&self) -> bool {
        self.is_empty()
    }
}

impl<T: Eq + std::hash::Hash> Recycle for FxHashSet<T> {
    fn recycle(&mut self) {
        self.clear();
    }

    fn is_clear(&self) -> bool {
        self.is_empty()
    }
}

impl<K: Eq + std::hash::Hash, V> Recycle for FxHashMap<K, V> {
    fn recycle(&mut self) {
        self.clear();
    }

    fn is_clear(&self) -> bool {
        self.is_empty()
    }
}

/// Capacity-capped checkout/return pool, shared across worker threads.
pub struct Pool<T: Recycle> {
    items: Mutex<Vec<T>>,
    max: usize,
}

impl<T: Recycle> Pool<T> {
    pub fn new(max: usize) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            max,
        }
    }

    /// Check out a buffer, allocating a fresh one if the pool is empty.
    ///
    /// Panics if the pooled buffer is not empty: that means the same buffer
    /// was returned twice and is aliased by a live user. Corrupting viewer
    /// state silently would be worse than dying here.
    pub fn get(&self) -> T {
        let item = self.items.lock().pop().unwrap_or_default();
        if !item.is_clear() {
            panic!("non-empty object taken from pool; was the same buffer returned more than once?");
        }
        item
    }

    /// Return a buffer. It is wiped before being retained.
    pub fn put(&self, mut item: T) {
        item.recycle();
        let mut items = self.items.lock();
        if items.len() < self.max {
            items.push(item);
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T: Recycle> Default for Pool<T> {
    fn default() -> Self {
        Self::new(MAX_POOL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::NetworkId;

    #[test]
    fn test_get_put_round_trip() {
        let pool: Pool<Vec<NetworkId>> = Pool::default();
        let mut list = pool.get();
        list.push(NetworkId::new(1));
        pool.put(list);
        assert_eq!(pool.len(), 1);

        // Returned buffer comes back wiped.
        let list = pool.get();
        assert!(list.is_empty());
    }

    #[test]
    fn test_capacity_cap() {
        let pool: Pool<Vec<NetworkId>> = Pool::new(2);
        pool.put(Vec::new());
        pool.put(Vec::new());
        pool.put(Vec::new());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    #[should_panic(expected = "non-empty object taken from pool")]
    fn test_dirty_pool_entry_is_fatal() {
        let pool: Pool<Vec<NetworkId>> = Pool::default();
        // Simulate a double-return bug by smuggling a non-empty buffer in.
        pool.items.lock().push(vec![NetworkId::new(7)]);
        let _ = pool.get();
    }

    #[test]
    fn test_set_pool() {
        let pool: Pool<crate::util::FxHashSet<NetworkId>> = Pool::default();
        let mut set = pool.get();
        set.insert(NetworkId::new(3));
        pool.put(set);
        assert!(pool.get().is_empty());
    }
}
