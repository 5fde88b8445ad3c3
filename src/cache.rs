//! Generic keyed cache with FIFO or LRU eviction
//!
//! Entries live in a slab and are threaded onto two structures at once:
//! - a hash bucket chain, searched by full key comparison (the bucket hash
//!   only narrows the search, it never decides equality)
//! - a global ordering list (front = oldest, back = newest)
//!
//! Several entries may share a key. The resolver relies on this to park
//! more than one read-mode instance of the same object.

use xxhash_rust::xxh3::xxh3_64;

const DEFAULT_BUCKETS: usize = 256;

/// Which entry is evicted when a bounded cache is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently added
    Fifo,
    /// Least recently used (iteration counts as use)
    #[default]
    Lru,
}

#[derive(Debug)]
struct Entry<V> {
    key: Vec<u8>,
    bucket: usize,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Cache statistics
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Cursor over the entries sharing one key
///
/// Obtained from [`Cache::iter`], advanced with [`Cache::next`]. It is
/// deliberately not `Clone`: a cursor is a single forward pass.
#[derive(Debug)]
pub struct CacheCursor {
    key: Vec<u8>,
    bucket: usize,
    position: usize,
}

/// Bounded or unbounded cache owning its values
#[derive(Debug)]
pub struct Cache<V> {
    buckets: Vec<Vec<usize>>,
    slots: Vec<Option<Entry<V>>>,
    free: Vec<usize>,
    oldest: Option<usize>,
    newest: Option<usize>,
    len: usize,
    /// Zero means unbounded
    capacity: usize,
    policy: EvictionPolicy,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<V> Cache<V> {
    /// Create a cache holding at most `capacity` entries (0 = unbounded)
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        let buckets = if capacity == 0 {
            DEFAULT_BUCKETS
        } else {
            capacity.next_power_of_two().clamp(16, 4096)
        };
        Cache {
            buckets: (0..buckets).map(|_| Vec::new()).collect(),
            slots: Vec::new(),
            free: Vec::new(),
            oldest: None,
            newest: None,
            len: 0,
            capacity,
            policy,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn unbounded(policy: EvictionPolicy) -> Self {
        Self::new(0, policy)
    }

    fn bucket_of(&self, key: &[u8]) -> usize {
        (xxh3_64(key) as usize) & (self.buckets.len() - 1)
    }

    fn entry(&self, slot: usize) -> &Entry<V> {
        self.slots[slot].as_ref().expect("cache slot linked but empty")
    }

    fn entry_mut(&mut self, slot: usize) -> &mut Entry<V> {
        self.slots[slot].as_mut().expect("cache slot linked but empty")
    }

    fn find(&self, key: &[u8]) -> Option<(usize, usize)> {
        let bucket = self.bucket_of(key);
        self.buckets[bucket]
            .iter()
            .position(|&slot| self.entry(slot).key == key)
            .map(|pos| (bucket, pos))
    }

    fn unlink_order(&mut self, slot: usize) {
        let (prev, next) = {
            let entry = self.entry(slot);
            (entry.prev, entry.next)
        };
        match prev {
            Some(p) => self.entry_mut(p).next = next,
            None => self.oldest = next,
        }
        match next {
            Some(n) => self.entry_mut(n).prev = prev,
            None => self.newest = prev,
        }
        let entry = self.entry_mut(slot);
        entry.prev = None;
        entry.next = None;
    }

    fn push_newest(&mut self, slot: usize) {
        let previous_newest = self.newest;
        {
            let entry = self.entry_mut(slot);
            entry.prev = previous_newest;
            entry.next = None;
        }
        match previous_newest {
            Some(n) => self.entry_mut(n).next = Some(slot),
            None => self.oldest = Some(slot),
        }
        self.newest = Some(slot);
    }

    /// Unlink a slot from both its bucket chain and the ordering list
    fn remove_slot(&mut self, bucket: usize, position: usize) -> (Vec<u8>, V) {
        let slot = self.buckets[bucket].remove(position);
        self.unlink_order(slot);
        let entry = self.slots[slot].take().expect("cache slot linked but empty");
        self.free.push(slot);
        self.len -= 1;
        (entry.key, entry.value)
    }

    fn touch(&mut self, slot: usize) {
        if self.policy == EvictionPolicy::Lru && self.newest != Some(slot) {
            self.unlink_order(slot);
            self.push_newest(slot);
        }
    }

    /// Insert `value` under `key`
    ///
    /// When the cache is bounded and full, the oldest entry (by insertion
    /// for FIFO, by use for LRU) is evicted first and handed back so the
    /// caller can dispose of it properly.
    pub fn put(&mut self, key: impl AsRef<[u8]>, value: V) -> Option<(Vec<u8>, V)> {
        let key = key.as_ref();
        let evicted = if self.capacity > 0 && self.len >= self.capacity {
            self.evict_oldest()
        } else {
            None
        };

        let bucket = self.bucket_of(key);
        let entry = Entry {
            key: key.to_vec(),
            bucket,
            value,
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.buckets[bucket].push(slot);
        self.push_newest(slot);
        self.len += 1;

        evicted
    }

    fn evict_oldest(&mut self) -> Option<(Vec<u8>, V)> {
        let slot = self.oldest?;
        let bucket = self.entry(slot).bucket;
        let position = self.buckets[bucket].iter().position(|&s| s == slot)?;
        self.evictions += 1;
        Some(self.remove_slot(bucket, position))
    }

    /// Remove an entry and transfer it to the caller
    pub fn get(&mut self, key: impl AsRef<[u8]>) -> Option<V> {
        match self.find(key.as_ref()) {
            Some((bucket, position)) => {
                self.hits += 1;
                Some(self.remove_slot(bucket, position).1)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Peek at an entry without removing it
    pub fn borrow(&self, key: impl AsRef<[u8]>) -> Option<&V> {
        self.find(key.as_ref())
            .map(|(bucket, position)| &self.entry(self.buckets[bucket][position]).value)
    }

    /// Whether at least one entry has this key
    pub fn present(&self, key: impl AsRef<[u8]>) -> bool {
        self.find(key.as_ref()).is_some()
    }

    /// Cursor positioned before the first entry equal to `key`
    pub fn iter(&self, key: impl AsRef<[u8]>) -> CacheCursor {
        let key = key.as_ref().to_vec();
        let bucket = self.bucket_of(&key);
        CacheCursor {
            key,
            bucket,
            position: 0,
        }
    }

    /// Advance a cursor to the next entry sharing its key
    ///
    /// The returned entry counts as used and is promoted under LRU.
    pub fn next(&mut self, cursor: &mut CacheCursor) -> Option<&V> {
        while cursor.position < self.buckets[cursor.bucket].len() {
            let slot = self.buckets[cursor.bucket][cursor.position];
            cursor.position += 1;
            if self.entry(slot).key == cursor.key {
                self.touch(slot);
                return Some(&self.entry(slot).value);
            }
        }
        None
    }

    /// Remove every entry with this key
    pub fn remove_all(&mut self, key: impl AsRef<[u8]>) -> Vec<V> {
        let key = key.as_ref();
        let mut removed = Vec::new();
        while let Some((bucket, position)) = self.find(key) {
            removed.push(self.remove_slot(bucket, position).1);
        }
        removed
    }

    /// Empty the cache, returning entries oldest first
    pub fn drain(&mut self) -> Vec<(Vec<u8>, V)> {
        let mut drained = Vec::with_capacity(self.len);
        while let Some(entry) = self.evict_oldest() {
            drained.push(entry);
        }
        self.evictions = 0;
        drained
    }

    /// Keys in eviction order (next victim first)
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let mut keys = Vec::with_capacity(self.len);
        let mut cursor = self.oldest;
        while let Some(slot) = cursor {
            let entry = self.entry(slot);
            keys.push(entry.key.clone());
            cursor = entry.next;
        }
        keys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            len: self.len,
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_transfers_ownership() {
        let mut cache = Cache::new(10, EvictionPolicy::Fifo);
        cache.put("a", String::from("alpha"));

        assert!(cache.present("a"));
        assert_eq!(cache.get("a"), Some(String::from("alpha")));
        assert!(!cache.present("a"));
        assert_eq!(cache.get("a"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_borrow_does_not_remove() {
        let mut cache = Cache::unbounded(EvictionPolicy::Lru);
        cache.put(b"k".as_slice(), 7u32);
        assert_eq!(cache.borrow("k"), Some(&7));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_fifo_evicts_before_insert() {
        let mut cache = Cache::new(2, EvictionPolicy::Fifo);
        assert!(cache.put("a", 1).is_none());
        assert!(cache.put("b", 2).is_none());

        let evicted = cache.put("c", 3).unwrap();
        assert_eq!(evicted, (b"a".to_vec(), 1));
        assert!(cache.present("c"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_lru_iteration_promotes() {
        let mut cache = Cache::new(2, EvictionPolicy::Lru);
        cache.put("a", 1);
        cache.put("b", 2);

        let mut cursor = cache.iter("a");
        assert_eq!(cache.next(&mut cursor), Some(&1));
        assert_eq!(cache.next(&mut cursor), None);

        // "a" was used, so "b" is now the least recently used
        cache.put("c", 3);
        assert!(cache.present("a"));
        assert!(!cache.present("b"));
    }

    #[test]
    fn test_fifo_iteration_does_not_promote() {
        let mut cache = Cache::new(2, EvictionPolicy::Fifo);
        cache.put("a", 1);
        cache.put("b", 2);

        let mut cursor = cache.iter("a");
        cache.next(&mut cursor);

        cache.put("c", 3);
        assert!(!cache.present("a"));
        assert!(cache.present("b"));
    }

    #[test]
    fn test_duplicate_keys() {
        let mut cache = Cache::unbounded(EvictionPolicy::Fifo);
        cache.put("dup", 1);
        cache.put("other", 9);
        cache.put("dup", 2);

        let mut cursor = cache.iter("dup");
        let mut seen = Vec::new();
        while let Some(v) = cache.next(&mut cursor) {
            seen.push(*v);
        }
        assert_eq!(seen, vec![1, 2]);

        assert_eq!(cache.get("dup"), Some(1));
        assert_eq!(cache.get("dup"), Some(2));
        assert_eq!(cache.get("dup"), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_colliding_buckets_compare_full_keys() {
        // 16 buckets and 200 keys guarantee shared chains
        let mut cache = Cache::new(16, EvictionPolicy::Fifo);
        let mut unbounded = Cache::unbounded(EvictionPolicy::Fifo);
        for i in 0..200u32 {
            unbounded.put(format!("key-{}", i), i);
        }
        for i in 0..200u32 {
            assert_eq!(unbounded.borrow(format!("key-{}", i)), Some(&i));
        }

        for i in 0..16u32 {
            cache.put(format!("key-{}", i), i);
        }
        assert_eq!(cache.borrow("key-3"), Some(&3));
        assert!(!cache.present("key-16"));
    }

    #[test]
    fn test_remove_all_and_drain() {
        let mut cache = Cache::unbounded(EvictionPolicy::Lru);
        cache.put("x", 1);
        cache.put("x", 2);
        cache.put("y", 3);

        assert_eq!(cache.remove_all("x"), vec![1, 2]);
        assert_eq!(cache.keys(), vec![b"y".to_vec()]);

        let drained = cache.drain();
        assert_eq!(drained.len(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_slots_are_reused() {
        let mut cache = Cache::new(3, EvictionPolicy::Fifo);
        for i in 0..100 {
            cache.put(format!("{}", i), i);
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.slots.len() <= 4);
        assert_eq!(cache.keys(), vec![b"97".to_vec(), b"98".to_vec(), b"99".to_vec()]);
    }
}
