use crate::hashing::HashMap;
use std::hash::Hash;

// "null" link in the index-based list
const NONE: u32 = u32::MAX;

#[derive(Copy, Clone)]
struct LruCacheNode {
    next: u32,
    previous: u32,
}

/// Fixed-capacity map that evicts the least recently used entry once full. Used by the storage
/// drives for their file handle and file metadata caches.
pub struct LruCache<K, V> {
    // Doubly linked list using indices instead of pointers. Head is the most recently used slot,
    // tail the least recently used. Empty slots are always kept at the tail end.
    lru_list_head: u32,
    lru_list_tail: u32,
    lru_list: Vec<LruCacheNode>,

    // Slots that line up with the doubly linked list
    lru_list_pairs: Vec<Option<(K, V)>>,

    // Lookup for the index a key is stored at
    lookup: HashMap<K, u32>,
}

impl<K: Clone + Eq + Hash, V> LruCache<K, V> {
    pub fn new(capacity: u32) -> LruCache<K, V> {
        assert!(capacity > 0, "An LruCache needs room for at least one entry");
        assert!(capacity < NONE);

        let lru_list = (0..capacity)
            .map(|i| LruCacheNode {
                previous: if i == 0 { NONE } else { i - 1 },
                next: if i + 1 == capacity { NONE } else { i + 1 },
            })
            .collect();

        let mut lru_list_pairs = Vec::with_capacity(capacity as usize);
        lru_list_pairs.resize_with(capacity as usize, || None);

        LruCache {
            lru_list_head: 0,
            lru_list_tail: capacity - 1,
            lru_list,
            lru_list_pairs,
            lookup: HashMap::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    fn unlink(
        &mut self,
        node_index: u32,
    ) {
        let node = self.lru_list[node_index as usize];
        if node.previous != NONE {
            self.lru_list[node.previous as usize].next = node.next;
        } else {
            self.lru_list_head = node.next;
        }

        if node.next != NONE {
            self.lru_list[node.next as usize].previous = node.previous;
        } else {
            self.lru_list_tail = node.previous;
        }
    }

    fn move_to_front(
        &mut self,
        node_index: u32,
    ) {
        if node_index == self.lru_list_head {
            return;
        }

        self.unlink(node_index);
        self.lru_list[node_index as usize] = LruCacheNode {
            previous: NONE,
            next: self.lru_list_head,
        };
        if self.lru_list_head != NONE {
            self.lru_list[self.lru_list_head as usize].previous = node_index;
        } else {
            self.lru_list_tail = node_index;
        }
        self.lru_list_head = node_index;
    }

    fn move_to_back(
        &mut self,
        node_index: u32,
    ) {
        if node_index == self.lru_list_tail {
            return;
        }

        self.unlink(node_index);
        self.lru_list[node_index as usize] = LruCacheNode {
            previous: self.lru_list_tail,
            next: NONE,
        };
        if self.lru_list_tail != NONE {
            self.lru_list[self.lru_list_tail as usize].next = node_index;
        } else {
            self.lru_list_head = node_index;
        }
        self.lru_list_tail = node_index;
    }

    /// Returns the value and marks it as the most recently used entry
    pub fn get(
        &mut self,
        k: &K,
    ) -> Option<&V> {
        let node_index = *self.lookup.get(k)?;
        self.move_to_front(node_index);
        self.lru_list_pairs[node_index as usize]
            .as_ref()
            .map(|(_, v)| v)
    }

    /// Returns the value without changing how recently it was used
    pub fn peek(
        &self,
        k: &K,
    ) -> Option<&V> {
        let node_index = *self.lookup.get(k)?;
        self.lru_list_pairs[node_index as usize]
            .as_ref()
            .map(|(_, v)| v)
    }

    /// Inserts the pair as the most recently used entry. Returns the pair that was pushed out, either
    /// the previous value for the same key or the least recently used entry if the cache was full.
    pub fn insert(
        &mut self,
        k: K,
        v: V,
    ) -> Option<(K, V)> {
        if let Some(&node_index) = self.lookup.get(&k) {
            self.move_to_front(node_index);
            return self.lru_list_pairs[node_index as usize].replace((k, v));
        }

        // The tail is either an empty slot or the least recently used entry
        let node_index = self.lru_list_tail;
        let evicted = self.lru_list_pairs[node_index as usize].take();
        if let Some((evicted_key, _)) = &evicted {
            self.lookup.remove(evicted_key);
        }

        self.move_to_front(node_index);
        self.lookup.insert(k.clone(), node_index);
        self.lru_list_pairs[node_index as usize] = Some((k, v));
        evicted
    }

    pub fn remove(
        &mut self,
        k: &K,
    ) -> Option<V> {
        let node_index = self.lookup.remove(k)?;
        self.move_to_back(node_index);
        self.lru_list_pairs[node_index as usize]
            .take()
            .map(|(_, v)| v)
    }

    pub fn clear(&mut self) {
        for pair in &mut self.lru_list_pairs {
            *pair = None;
        }
        self.lookup.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn check_lru_gets_full() {
        let mut lru_cache = LruCache::new(3);
        assert!(lru_cache.insert(0, 0).is_none());
        assert!(lru_cache.insert(1, 1).is_none());
        assert!(lru_cache.insert(2, 2).is_none());

        // All should be present
        assert!(lru_cache.peek(&0).is_some());
        assert!(lru_cache.peek(&1).is_some());
        assert!(lru_cache.peek(&2).is_some());

        // The oldest one should be bumped, and the new one should be present
        assert_eq!(lru_cache.insert(3, 3), Some((0, 0)));
        assert!(lru_cache.peek(&0).is_none());
        assert!(lru_cache.peek(&1).is_some());
        assert!(lru_cache.peek(&2).is_some());
        assert!(lru_cache.peek(&3).is_some());
        assert_eq!(lru_cache.len(), 3);
    }

    #[test]
    fn check_lru_deletes_least_recently_used() {
        let mut lru_cache = LruCache::new(3);
        lru_cache.insert(0, 0);
        lru_cache.insert(1, 1);
        lru_cache.insert(2, 2);

        // Touch the oldest, preventing it from being removed
        assert_eq!(lru_cache.get(&0), Some(&0));

        lru_cache.insert(3, 3);
        assert!(lru_cache.peek(&0).is_some());
        assert!(lru_cache.peek(&1).is_none());
        assert!(lru_cache.peek(&2).is_some());
        assert!(lru_cache.peek(&3).is_some());
    }

    #[test]
    fn check_remove() {
        let mut lru_cache = LruCache::new(3);
        lru_cache.insert(0, 0);
        lru_cache.insert(1, 1);
        lru_cache.insert(2, 2);

        assert_eq!(lru_cache.remove(&0), Some(0));
        assert_eq!(lru_cache.remove(&2), Some(2));
        assert_eq!(lru_cache.remove(&1), Some(1));
        assert_eq!(lru_cache.remove(&1), None);
        assert!(lru_cache.is_empty());

        // Freed slots get reused before anything is evicted
        lru_cache.insert(3, 3);
        lru_cache.insert(4, 4);
        lru_cache.insert(5, 5);
        assert!(lru_cache.peek(&3).is_some());
        assert!(lru_cache.peek(&4).is_some());
        assert!(lru_cache.peek(&5).is_some());
    }

    #[test]
    fn check_single_entry_cache() {
        let mut lru_cache = LruCache::new(1);
        lru_cache.insert("a", 1);
        assert_eq!(lru_cache.insert("b", 2), Some(("a", 1)));
        assert_eq!(lru_cache.get(&"b"), Some(&2));
        assert_eq!(lru_cache.remove(&"b"), Some(2));
        assert!(lru_cache.insert("c", 3).is_none());
        assert_eq!(lru_cache.len(), 1);
    }

    #[test]
    fn check_replace_existing_key() {
        let mut lru_cache = LruCache::new(2);
        lru_cache.insert(0, "old");
        lru_cache.insert(1, "other");
        assert_eq!(lru_cache.insert(0, "new"), Some((0, "old")));
        assert_eq!(lru_cache.len(), 2);

        // 0 was refreshed by the replace so 1 is the one to go
        lru_cache.insert(2, "newest");
        assert_eq!(lru_cache.peek(&0), Some(&"new"));
        assert!(lru_cache.peek(&1).is_none());
    }

    #[test]
    fn check_clear() {
        let mut lru_cache = LruCache::new(4);
        for i in 0..4 {
            lru_cache.insert(i, i);
        }
        lru_cache.clear();
        assert!(lru_cache.is_empty());
        for i in 10..14 {
            assert!(lru_cache.insert(i, i).is_none());
        }
    }
}
