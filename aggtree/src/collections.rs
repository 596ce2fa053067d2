//! Bounded collections that shrink when underutilized.
//!
//! Every protocol table has a fixed capacity from `NodeConfig`. The wrappers
//! track removals since the last addition; after 1/16 of the capacity worth of
//! removals the backing storage is shrunk, so bursts (a flood of children
//! reporting, a queue filling during a parent outage) don't pin memory.

use alloc::collections::VecDeque;
use core::hash::Hash;

use hashbrown::{HashMap, HashSet};

/// Calculate shrink threshold from max capacity (1/16, minimum 1).
const fn shrink_threshold(max_capacity: usize) -> u8 {
    let threshold = max_capacity / 16;
    if threshold == 0 {
        1
    } else if threshold > u8::MAX as usize {
        u8::MAX
    } else {
        threshold as u8
    }
}

/// Removal counter shared by the collections below.
#[derive(Debug, Clone)]
struct ShrinkTracker {
    removals_since_add: u8,
    threshold: u8,
}

impl ShrinkTracker {
    const fn new(capacity: usize) -> Self {
        Self {
            removals_since_add: 0,
            threshold: shrink_threshold(capacity),
        }
    }

    fn added(&mut self) {
        self.removals_since_add = 0;
    }

    /// Record `n` removals; returns true when the owner should shrink.
    fn removed(&mut self, n: usize) -> bool {
        if n == 0 {
            return false;
        }
        let n = n.min(u8::MAX as usize) as u8;
        self.removals_since_add = self.removals_since_add.saturating_add(n);
        if self.removals_since_add >= self.threshold {
            self.removals_since_add = 0;
            true
        } else {
            false
        }
    }
}

/// FIFO queue with a hard capacity.
#[derive(Debug, Clone)]
pub struct BoundedQueue<T> {
    inner: VecDeque<T>,
    capacity: usize,
    tracker: ShrinkTracker,
}

impl<T> BoundedQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: VecDeque::new(),
            capacity,
            tracker: ShrinkTracker::new(capacity),
        }
    }

    /// Append to the back. Returns the value if the queue is full.
    pub fn try_push(&mut self, value: T) -> Result<(), T> {
        if self.is_full() {
            return Err(value);
        }
        self.tracker.added();
        self.inner.push_back(value);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<T> {
        let result = self.inner.pop_front();
        if result.is_some() && self.tracker.removed(1) {
            self.inner.shrink_to_fit();
        }
        result
    }

    pub fn front(&self) -> Option<&T> {
        self.inner.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut T> {
        self.inner.front_mut()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.inner.iter()
    }

    /// Retain elements matching predicate. Returns the number removed.
    pub fn retain<F>(&mut self, f: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let before = self.inner.len();
        self.inner.retain(f);
        let removed = before - self.inner.len();
        if self.tracker.removed(removed) {
            self.inner.shrink_to_fit();
        }
        removed
    }

    /// Remove everything. Returns the number removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.inner.len();
        self.inner.clear();
        if self.tracker.removed(removed) {
            self.inner.shrink_to_fit();
        }
        removed
    }
}

/// Hash map with a hard capacity.
///
/// `insert` refuses new keys when full; callers pick a victim with
/// `remove_min_by_key` first.
#[derive(Debug, Clone)]
pub struct BoundedMap<K, V> {
    inner: HashMap<K, V>,
    capacity: usize,
    tracker: ShrinkTracker,
}

impl<K, V> BoundedMap<K, V>
where
    K: Eq + Hash + Copy,
{
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: HashMap::new(),
            capacity,
            tracker: ShrinkTracker::new(capacity),
        }
    }

    /// Insert or replace. Returns `Err` with the pair when the key is new
    /// and the map is full.
    pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>, (K, V)> {
        if !self.inner.contains_key(&key) && self.is_full() {
            return Err((key, value));
        }
        self.tracker.added();
        Ok(self.inner.insert(key, value))
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let result = self.inner.remove(key);
        if result.is_some() && self.tracker.removed(1) {
            self.inner.shrink_to_fit();
        }
        result
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.len() >= self.capacity
    }

    pub fn iter(&self) -> hashbrown::hash_map::Iter<'_, K, V> {
        self.inner.iter()
    }

    pub fn values(&self) -> hashbrown::hash_map::Values<'_, K, V> {
        self.inner.values()
    }

    /// Retain entries matching predicate. Returns the number removed.
    pub fn retain<F>(&mut self, f: F) -> usize
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        let before = self.inner.len();
        self.inner.retain(f);
        let removed = before - self.inner.len();
        if self.tracker.removed(removed) {
            self.inner.shrink_to_fit();
        }
        removed
    }

    pub fn clear(&mut self) {
        let removed = self.inner.len();
        self.inner.clear();
        if self.tracker.removed(removed) {
            self.inner.shrink_to_fit();
        }
    }

    /// Remove the entry with the minimum value according to a key function,
    /// considering only entries accepted by `filter`.
    ///
    /// Useful for evicting the stalest entry when at capacity.
    pub fn remove_min_by_key<B, P, F>(&mut self, mut filter: P, mut f: F) -> Option<(K, V)>
    where
        B: Ord,
        P: FnMut(&K, &V) -> bool,
        F: FnMut(&V) -> B,
    {
        let key = self
            .inner
            .iter()
            .filter(|&(k, v)| filter(k, v))
            .min_by_key(|(_, v)| f(v))
            .map(|(k, _)| *k)?;
        let value = self.remove(&key)?;
        Some((key, value))
    }
}

/// Set of recently seen keys, evicting the oldest beyond capacity.
#[derive(Debug, Clone)]
pub struct RecentSet<K> {
    seen: HashSet<K>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K> RecentSet<K>
where
    K: Eq + Hash + Copy,
{
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Remember `key`. Returns false if it was already present.
    pub fn insert(&mut self, key: K) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
        self.seen.shrink_to_fit();
        self.order.shrink_to_fit();
    }
}
