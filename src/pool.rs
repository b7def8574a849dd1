//! Concurrent interning pools.
//!
//! Each structural category gets one pool mapping a structural key to a small
//! integer handle. Interning is idempotent: structurally equal keys always
//! resolve to the same handle, including under concurrent racing producers,
//! where the map's entry-level insert-if-absent picks exactly one winner and
//! losers' candidates are dropped unreferenced. There is no global lock;
//! contention is limited to the map shard owning the key.
//!
//! Offsets live in a side table indexed by handle, written once by the
//! layout engine after the producing phase has joined.

use ahash::RandomState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::hash::Hash;

/// Sentinel offset for absent or empty items that own no serialized record.
pub const NO_OFFSET: u32 = 0;

/// Sentinel index for absent references in fixed-width records.
pub const NO_INDEX: u32 = u32::MAX;

/// A deduplicating store for one structural category.
pub struct InternPool<K> {
    indices: DashMap<K, u32, RandomState>,
    items: RwLock<Vec<K>>,
    offsets: RwLock<Vec<u32>>,
}

impl<K: Eq + Hash + Clone> InternPool<K> {
    pub fn new() -> Self {
        InternPool {
            indices: DashMap::with_hasher(RandomState::new()),
            items: RwLock::new(Vec::new()),
            offsets: RwLock::new(Vec::new()),
        }
    }

    /// Return the canonical handle for `key`, creating it if absent.
    ///
    /// Racing inserts of equal keys converge on one handle; the shard lock
    /// held by the vacant entry makes the index assignment and map insert a
    /// single atomic step for that key.
    pub fn intern(&self, key: K) -> u32 {
        if let Some(existing) = self.indices.get(&key) {
            return *existing.value();
        }
        match self.indices.entry(key.clone()) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                let mut items = self.items.write();
                let index = items.len() as u32;
                items.push(key);
                drop(items);
                entry.insert(index);
                index
            }
        }
    }

    /// Handle for an already-interned key, if any. The write engine resolves
    /// references through this; a miss there is an internal-consistency bug.
    pub fn lookup(&self, key: &K) -> Option<u32> {
        self.indices.get(key).map(|entry| *entry.value())
    }

    /// The key behind `handle`.
    pub fn get(&self, handle: u32) -> K {
        self.items.read()[handle as usize].clone()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// All items in intern order, indexed by handle. Layout sorts this
    /// snapshot into the format's collation before assigning offsets.
    pub fn snapshot(&self) -> Vec<K> {
        self.items.read().clone()
    }

    /// Record the final byte offsets, indexed by handle. Called exactly once
    /// per layout run.
    pub fn set_offsets(&self, offsets: Vec<u32>) {
        assert_eq!(
            offsets.len(),
            self.items.read().len(),
            "offset table must cover every interned item"
        );
        *self.offsets.write() = offsets;
    }

    /// Final byte offset of `handle`.
    ///
    /// Panics if layout has not run; asking for an offset before the write
    /// engine assigned one is a caller contract violation.
    pub fn offset(&self, handle: u32) -> u32 {
        let offsets = self.offsets.read();
        assert!(
            !offsets.is_empty() || self.items.read().is_empty(),
            "offset requested before layout"
        );
        offsets[handle as usize]
    }

    /// Offset of an optional item; absent items report [`NO_OFFSET`] without
    /// requiring layout to have run.
    pub fn nullable_offset(&self, handle: Option<u32>) -> u32 {
        match handle {
            Some(handle) => self.offset(handle),
            None => NO_OFFSET,
        }
    }
}

impl<K: Eq + Hash + Clone> Default for InternPool<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_idempotent() {
        let pool = InternPool::new();
        let a = pool.intern("Ljava/lang/Object;".to_string());
        let b = pool.intern("Ljava/lang/Object;".to_string());
        assert_eq!(a, b);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_distinct_keys_distinct_handles() {
        let pool = InternPool::new();
        let a = pool.intern("LA;".to_string());
        let b = pool.intern("LB;".to_string());
        assert_ne!(a, b);
        assert_eq!(pool.get(a), "LA;");
        assert_eq!(pool.get(b), "LB;");
    }

    #[test]
    fn test_lookup_without_insert() {
        let pool = InternPool::new();
        assert_eq!(pool.lookup(&"LA;".to_string()), None);
        let a = pool.intern("LA;".to_string());
        assert_eq!(pool.lookup(&"LA;".to_string()), Some(a));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    #[should_panic(expected = "before layout")]
    fn test_offset_before_layout_panics() {
        let pool = InternPool::new();
        let a = pool.intern(1u32);
        pool.offset(a);
    }

    #[test]
    fn test_offsets_after_layout() {
        let pool = InternPool::new();
        let a = pool.intern("a".to_string());
        let b = pool.intern("b".to_string());
        pool.set_offsets(vec![0x70, 0x80]);
        assert_eq!(pool.offset(a), 0x70);
        assert_eq!(pool.offset(b), 0x80);
        assert_eq!(pool.nullable_offset(None), NO_OFFSET);
        assert_eq!(pool.nullable_offset(Some(b)), 0x80);
    }

    #[test]
    fn test_concurrent_intern_converges() {
        let pool = InternPool::new();
        crossbeam::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|_| {
                    for i in 0..100 {
                        pool.intern(format!("item-{}", i % 10));
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(pool.len(), 10);
        // Every handle maps back to a distinct key.
        let items = pool.snapshot();
        let unique: std::collections::HashSet<_> = items.iter().collect();
        assert_eq!(unique.len(), 10);
    }
}
