//! Recency Index Module
//!
//! Implements Least Recently Used tracking for capacity-driven trimming.
//!
//! Nodes live in a slot arena and are linked by index, oldest at the head and
//! newest at the tail. A reverse index maps each entry's unique `EntryId` to
//! its slot, so touch and remove are O(1) and two distinct entries can never
//! share a node.
//!
//! Every touch also takes a stamp from one process-wide clock, so the recency
//! of entries held by different indexes (one per shard) can be compared.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::cache::{CacheEntry, EntryId, Priority};

/// Trimming leaves indexes at or below this occupancy untouched.
pub const MIN_TRIM_OCCUPANCY: usize = 10;

static ACCESS_CLOCK: AtomicU64 = AtomicU64::new(1);

struct Node<V> {
    entry: Arc<CacheEntry<V>>,
    stamp: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

struct RecencyList<V> {
    slots: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    index: FxHashMap<EntryId, usize>,
}

impl<V> RecencyList<V> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            index: FxHashMap::default(),
        }
    }

    fn node(&self, slot: usize) -> &Node<V> {
        self.slots[slot].as_ref().expect("linked slot is occupied")
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node<V> {
        self.slots[slot].as_mut().expect("linked slot is occupied")
    }

    fn allocate(&mut self, entry: Arc<CacheEntry<V>>) -> usize {
        let node = Node {
            entry,
            stamp: 0,
            prev: None,
            next: None,
        };
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.node(slot);
            (node.prev, node.next)
        };
        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.node_mut(next).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(slot);
        node.prev = None;
        node.next = None;
    }

    fn attach_back(&mut self, slot: usize) {
        let old_tail = self.tail;
        {
            let node = self.node_mut(slot);
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(tail) => self.node_mut(tail).next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }

    fn release(&mut self, slot: usize) -> Arc<CacheEntry<V>> {
        self.detach(slot);
        let node = self.slots[slot].take().expect("linked slot is occupied");
        self.free.push(slot);
        self.index.remove(&node.entry.id());
        node.entry
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.index.clear();
    }
}

// == Recency Index ==
/// Tracks access order for LRU trimming.
///
/// Guarded by its own lock so reads can record a touch while the container
/// holds only its read section.
pub struct RecencyIndex<V> {
    list: Mutex<RecencyList<V>>,
}

impl<V> RecencyIndex<V> {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(RecencyList::new()),
        }
    }

    // == Touch ==
    /// Marks an entry as most recently used, inserting it if absent.
    pub fn touch(&self, entry: &Arc<CacheEntry<V>>) {
        let mut list = self.list.lock();
        let slot = match list.index.get(&entry.id()).copied() {
            Some(slot) => {
                list.detach(slot);
                slot
            }
            None => {
                let slot = list.allocate(entry.clone());
                list.index.insert(entry.id(), slot);
                slot
            }
        };
        list.attach_back(slot);
        // Stamped under the list lock so list order and stamp order agree.
        list.node_mut(slot).stamp = ACCESS_CLOCK.fetch_add(1, Ordering::Relaxed);
    }

    // == Remove ==
    /// Unlinks an entry. Returns false if it was not indexed.
    pub fn remove(&self, entry: &CacheEntry<V>) -> bool {
        let mut list = self.list.lock();
        match list.index.get(&entry.id()).copied() {
            Some(slot) => {
                list.release(slot);
                true
            }
            None => false,
        }
    }

    // == Evict Up To ==
    /// Unlinks up to `goal` least recently used removable entries.
    ///
    /// Returns the victims oldest first; the caller removes them from its map
    /// and fires their callbacks. Does nothing while the index holds
    /// `MIN_TRIM_OCCUPANCY` entries or fewer. `NotRemovable` entries are
    /// skipped and keep their position.
    pub fn evict_up_to(&self, goal: usize) -> Vec<Arc<CacheEntry<V>>> {
        let mut list = self.list.lock();
        if goal == 0 || list.index.len() <= MIN_TRIM_OCCUPANCY {
            return Vec::new();
        }

        let mut victims = Vec::with_capacity(goal.min(list.index.len()));
        let mut cursor = list.head;
        while let Some(slot) = cursor {
            if victims.len() >= goal {
                break;
            }
            let (next, removable) = {
                let node = list.node(slot);
                (node.next, node.entry.priority() == Priority::Removable)
            };
            if removable {
                victims.push(list.release(slot));
            }
            cursor = next;
        }
        victims
    }

    /// Up to `limit` least recently used removable entries with their access
    /// stamps, oldest first. Nothing is unlinked and no floor applies.
    pub fn oldest_removable(&self, limit: usize) -> Vec<(u64, Arc<CacheEntry<V>>)> {
        let list = self.list.lock();
        let mut candidates = Vec::with_capacity(limit.min(list.index.len()));
        let mut cursor = list.head;
        while let Some(slot) = cursor {
            if candidates.len() >= limit {
                break;
            }
            let node = list.node(slot);
            if node.entry.priority() == Priority::Removable {
                candidates.push((node.stamp, node.entry.clone()));
            }
            cursor = node.next;
        }
        candidates
    }

    /// Unlinks the single least recently used removable entry.
    pub fn pop_lru(&self) -> Option<Arc<CacheEntry<V>>> {
        let mut list = self.list.lock();
        let mut cursor = list.head;
        while let Some(slot) = cursor {
            let node = list.node(slot);
            if node.entry.priority() == Priority::Removable {
                return Some(list.release(slot));
            }
            cursor = node.next;
        }
        None
    }

    pub fn contains(&self, entry: &CacheEntry<V>) -> bool {
        self.list.lock().index.contains_key(&entry.id())
    }

    /// Returns the number of indexed entries.
    pub fn len(&self) -> usize {
        self.list.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.list.lock().clear();
    }

    /// Keys from least to most recently used.
    pub fn keys_oldest_first(&self) -> Vec<String> {
        let list = self.list.lock();
        let mut keys = Vec::with_capacity(list.index.len());
        let mut cursor = list.head;
        while let Some(slot) = cursor {
            let node = list.node(slot);
            keys.push(node.entry.key().to_string());
            cursor = node.next;
        }
        keys
    }
}

impl<V> Default for RecencyIndex<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for RecencyIndex<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecencyIndex")
            .field("len", &self.len())
            .finish()
    }
}
