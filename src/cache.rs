//! A small fixed-capacity LRU cache. One instance backs each lazy list
//! kind in a handle: one for materialized chunk groups, one for chunk data.
//!
//! Values are owned by the cache and dropped on eviction. Delta chunks
//! never pass through here; they are owned by their range list.

/// Identifies a cached element: which list it belongs to, its index within
/// that list, and the list's generation at the time of caching. Bumping a
/// list's generation implicitly invalidates its cached values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheKey {
    pub list_id: u64,
    pub index: usize,
    pub generation: u64,
}

#[derive(Debug)]
struct Slot<V> {
    key: CacheKey,
    value: V,
    last_used: u64,
}

/// LRU cache with a hard capacity. Capacities are small (single digits per
/// list kind), so lookups are linear scans over a vector.
#[derive(Debug)]
pub struct Cache<V> {
    capacity: usize,
    clock: u64,
    slots: Vec<Slot<V>>,
}

impl<V> Cache<V> {
    /// Capacity zero is rounded up to one so an insert can always succeed.
    pub fn new(capacity: usize) -> Self {
        Cache {
            capacity: capacity.max(1),
            clock: 0,
            slots: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.slots.iter().any(|slot| slot.key == *key)
    }

    /// Fetch a cached value, marking it most recently used.
    pub fn get_mut(&mut self, key: &CacheKey) -> Option<&mut V> {
        self.clock += 1;
        let clock = self.clock;
        self.slots.iter_mut().find(|slot| slot.key == *key).map(|slot| {
            slot.last_used = clock;
            &mut slot.value
        })
    }

    /// Insert a value, replacing any entry with the same key and evicting
    /// the least recently used entry when at capacity.
    pub fn insert(&mut self, key: CacheKey, value: V) {
        self.clock += 1;
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.key == key) {
            slot.value = value;
            slot.last_used = self.clock;
            return;
        }
        if self.slots.len() >= self.capacity {
            if let Some(victim) = self
                .slots
                .iter()
                .enumerate()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(i, _)| i)
            {
                self.slots.swap_remove(victim);
            }
        }
        self.slots.push(Slot {
            key,
            value,
            last_used: self.clock,
        });
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<V> {
        let index = self.slots.iter().position(|slot| slot.key == *key)?;
        Some(self.slots.swap_remove(index).value)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Cached keys in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.slots.iter().map(|slot| &slot.key)
    }
}
