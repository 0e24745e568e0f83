//! Bounded-cost LRU map
//!
//! A hash map threaded through an index-linked recency list. Every entry
//! carries a caller-supplied cost; the sum of costs never exceeds
//! `max_cost`. Lookups, inserts and evictions are O(1).

use std::collections::HashMap;
use std::hash::Hash;

struct Node<K, V> {
    key: K,
    value: V,
    cost: usize,
    /// Towards the most recently used end
    prev: Option<usize>,
    /// Towards the least recently used end
    next: Option<usize>,
}

/// Least-recently-used map with cost accounting.
///
/// # Example
///
/// ```
/// use readium_cache::CostLru;
///
/// let mut lru = CostLru::new(10);
/// lru.insert("a", 1, 4).unwrap();
/// lru.insert("b", 2, 4).unwrap();
/// lru.get(&"a");
///
/// // "b" is now least recently used and makes room for "c"
/// let evicted = lru.insert("c", 3, 4).unwrap();
/// assert_eq!(evicted, vec![("b", 2)]);
/// assert!(lru.current_cost() <= lru.max_cost());
/// ```
pub struct CostLru<K, V> {
    map: HashMap<K, usize>,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    max_cost: usize,
    current_cost: usize,
}

impl<K: Hash + Eq + Clone, V> CostLru<K, V> {
    /// Create an empty map that holds at most `max_cost` total cost.
    pub fn new(max_cost: usize) -> Self {
        Self {
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            max_cost,
            current_cost: 0,
        }
    }

    pub fn max_cost(&self) -> usize {
        self.max_cost
    }

    pub fn current_cost(&self) -> usize {
        self.current_cost
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Look up a value and mark it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let index = *self.map.get(key)?;
        self.unlink(index);
        self.push_front(index);
        self.slots[index].as_ref().map(|node| &node.value)
    }

    /// Mutable lookup that also marks the entry most recently used.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let index = *self.map.get(key)?;
        self.unlink(index);
        self.push_front(index);
        self.slots[index].as_mut().map(|node| &mut node.value)
    }

    /// Look up a value without touching recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let index = *self.map.get(key)?;
        self.slots[index].as_ref().map(|node| &node.value)
    }

    /// Insert a value, evicting least recently used entries until it fits.
    ///
    /// Returns the evicted entries. A value whose cost alone exceeds
    /// `max_cost` is handed back as `Err` and the map is left untouched.
    pub fn insert(&mut self, key: K, value: V, cost: usize) -> Result<Vec<(K, V)>, V> {
        if cost > self.max_cost {
            return Err(value);
        }

        self.remove(&key);

        let mut evicted = Vec::new();
        while self.current_cost + cost > self.max_cost {
            match self.pop_lru() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }

        let node = Node {
            key: key.clone(),
            value,
            cost,
            prev: None,
            next: None,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(node);
                index
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.push_front(index);
        self.map.insert(key, index);
        self.current_cost += cost;

        Ok(evicted)
    }

    /// Remove an entry by key.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let index = self.map.remove(key)?;
        self.take_slot(index).map(|(_, value)| value)
    }

    /// Remove and return the least recently used entry.
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        let index = self.tail?;
        let entry = self.take_slot(index)?;
        self.map.remove(&entry.0);
        Some(entry)
    }

    /// Remove every entry whose key matches the predicate.
    ///
    /// Returns the number of entries removed.
    pub fn remove_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let doomed: Vec<K> = self.map.keys().filter(|k| predicate(k)).cloned().collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    /// Change the cost ceiling, evicting LRU entries that no longer fit.
    pub fn set_max_cost(&mut self, max_cost: usize) -> Vec<(K, V)> {
        self.max_cost = max_cost;
        let mut evicted = Vec::new();
        while self.current_cost > self.max_cost {
            match self.pop_lru() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        evicted
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.current_cost = 0;
    }

    /// Keys ordered from most to least recently used.
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.map.len());
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let Some(node) = self.slots[index].as_ref() else {
                break;
            };
            keys.push(node.key.clone());
            cursor = node.next;
        }
        keys
    }

    fn take_slot(&mut self, index: usize) -> Option<(K, V)> {
        self.unlink(index);
        let node = self.slots[index].take()?;
        self.free.push(index);
        self.current_cost -= node.cost;
        Some((node.key, node.value))
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = match self.slots[index].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.slots[p].as_mut() {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.slots[n].as_mut() {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(node) = self.slots[index].as_mut() {
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, index: usize) {
        let old_head = self.head;
        if let Some(node) = self.slots[index].as_mut() {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(node) = self.slots[h].as_mut() {
                node.prev = Some(index);
            }
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }
}
