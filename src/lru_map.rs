//! An [Lru] is an access-ordered map bounded by entry count.
//!
//! This is implemented as a vec-backed doubly linked list plus an auxiliary hash-based index.  Unlike most LRU maps,
//! eviction never drops anything on the floor: every insertion hands the evicted entries back to the caller, so that
//! whatever they own (pooled buffers, for instance) can be released after the caller has left any lock guarding the
//! map.
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use ahash::RandomState;

struct Occupied<K, V> {
    key: Arc<K>,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

enum Slot<K, V> {
    /// Free, possibly pointing at the next free slot.
    Free { next_free: Option<usize> },
    Occupied(Occupied<K, V>),
}

impl<K, V> Slot<K, V> {
    fn occupied(&self) -> &Occupied<K, V> {
        match self {
            Slot::Occupied(x) => x,
            Slot::Free { .. } => panic!("Slot should be occupied"),
        }
    }

    fn occupied_mut(&mut self) -> &mut Occupied<K, V> {
        match self {
            Slot::Occupied(x) => x,
            Slot::Free { .. } => panic!("Slot should be occupied"),
        }
    }
}

/// An entry pushed out of the map by an insertion.
#[derive(Debug)]
pub struct Evicted<K, V> {
    pub key: Arc<K>,
    pub value: V,
}

/// What an insertion displaced.
#[derive(Debug)]
pub struct Inserted<K, V> {
    /// The previous value for the same key, if any.
    pub replaced: Option<V>,
    /// Least recently used entries removed to get back under capacity, oldest first.
    pub evicted: Vec<Evicted<K, V>>,
}

pub struct Lru<K: Hash + Eq, V> {
    slots: Vec<Slot<K, V>>,
    index: HashMap<Arc<K>, usize, RandomState>,
    capacity: usize,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used.
    tail: Option<usize>,
    free_head: Option<usize>,
}

impl<K: Hash + Eq, V> Lru<K, V> {
    pub fn new(capacity: usize) -> Lru<K, V> {
        Lru {
            slots: vec![],
            index: Default::default(),
            capacity,
            head: None,
            tail: None,
            free_head: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn unlink(&mut self, ind: usize) {
        let (prev, next) = {
            let e = self.slots[ind].occupied();
            (e.prev, e.next)
        };

        match prev {
            Some(p) => self.slots[p].occupied_mut().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].occupied_mut().prev = prev,
            None => self.tail = prev,
        }

        let e = self.slots[ind].occupied_mut();
        e.prev = None;
        e.next = None;
    }

    fn push_front(&mut self, ind: usize) {
        let old_head = self.head;
        {
            let e = self.slots[ind].occupied_mut();
            e.prev = None;
            e.next = old_head;
        }
        match old_head {
            Some(h) => self.slots[h].occupied_mut().prev = Some(ind),
            None => self.tail = Some(ind),
        }
        self.head = Some(ind);
    }

    fn touch(&mut self, ind: usize) {
        if self.head != Some(ind) {
            self.unlink(ind);
            self.push_front(ind);
        }
    }

    /// Unlink a slot and put it on the free list, returning what it held.
    fn vacate(&mut self, ind: usize) -> (Arc<K>, V) {
        self.unlink(ind);
        let old = std::mem::replace(
            &mut self.slots[ind],
            Slot::Free {
                next_free: self.free_head,
            },
        );
        self.free_head = Some(ind);
        match old {
            Slot::Occupied(Occupied { key, value, .. }) => {
                self.index.remove(&key);
                (key, value)
            }
            Slot::Free { .. } => panic!("Should have been occupied"),
        }
    }

    fn find_free(&mut self) -> Option<usize> {
        let ind = self.free_head?;
        self.free_head = match self.slots[ind] {
            Slot::Free { next_free } => next_free,
            Slot::Occupied(_) => panic!("Free list points at an occupied slot"),
        };
        Some(ind)
    }

    /// Does not count as a use.
    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Read a value without counting it as a use.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let ind = *self.index.get(key)?;
        Some(&self.slots[ind].occupied().value)
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        let ind = *self.index.get(key)?;
        self.touch(ind);
        Some(&self.slots[ind].occupied().value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let ind = *self.index.get(key)?;
        self.touch(ind);
        Some(&mut self.slots[ind].occupied_mut().value)
    }

    /// Insert or replace, making the key the most recently used, then evict down to capacity.
    pub fn insert(&mut self, key: K, value: V) -> Inserted<K, V> {
        if let Some(&ind) = self.index.get(&key) {
            self.touch(ind);
            let old = std::mem::replace(&mut self.slots[ind].occupied_mut().value, value);
            return Inserted {
                replaced: Some(old),
                evicted: vec![],
            };
        }

        let key = Arc::new(key);
        let occupied = Slot::Occupied(Occupied {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        });
        let ind = match self.find_free() {
            Some(i) => {
                self.slots[i] = occupied;
                i
            }
            None => {
                self.slots.push(occupied);
                self.slots.len() - 1
            }
        };
        self.index.insert(key, ind);
        self.push_front(ind);

        Inserted {
            replaced: None,
            evicted: self.evict_to_capacity(),
        }
    }

    fn evict_to_capacity(&mut self) -> Vec<Evicted<K, V>> {
        let mut evicted = vec![];
        while self.len() > self.capacity {
            let tail = match self.tail {
                Some(t) => t,
                None => panic!("Not enough entries to explain length"),
            };
            let (key, value) = self.vacate(tail);
            evicted.push(Evicted { key, value });
        }
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let ind = *self.index.get(key)?;
        Some(self.vacate(ind).1)
    }

    /// Remove everything, returning the values most recently used first.
    pub fn clear(&mut self) -> Vec<V> {
        let mut out = Vec::with_capacity(self.len());
        while let Some(h) = self.head {
            out.push(self.vacate(h).1);
        }
        self.slots.clear();
        self.free_head = None;
        out
    }

    /// Iterator visiting entries in most-recently-used order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        let mut ind = self.head;
        std::iter::from_fn(move || {
            let e = self.slots[ind?].occupied();
            ind = e.next;
            Some((&*e.key, &e.value))
        })
    }
}
