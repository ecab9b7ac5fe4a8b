//! Expiration Queue Module
//!
//! Binary min-heap of entries ordered by deadline, with lazy deletion.
//!
//! Entries are never removed from the middle of the heap. A slot whose entry
//! has been disabled, or whose entry was re-scheduled since the slot was
//! pushed (its generation moved on), is a tombstone: it stays in place until
//! it surfaces at the root, where it is discarded.
//!
//! ```text
//!   slots: [ (t=3,g=0,A) | (t=5,g=1,B) | (t=4,g=0,C) | (t=9,g=0,B) ... ]
//!                                                      ^ stale: B is at g=1
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::cache::CacheEntry;

/// Backing storage never shrinks below this many slots.
const MIN_CAPACITY: usize = 16;

struct Slot<V> {
    deadline: Instant,
    generation: u64,
    entry: Arc<CacheEntry<V>>,
}

impl<V> Slot<V> {
    fn is_stale(&self) -> bool {
        self.entry.is_disabled() || self.entry.generation() != self.generation
    }
}

// == Expiration Queue ==
/// Min-heap of entries keyed by their deadline.
///
/// Internally synchronized. Callers that also hold a container lock must take
/// it first; this lock is always the inner one.
pub struct ExpirationQueue<V> {
    heap: RwLock<Vec<Slot<V>>>,
}

impl<V> ExpirationQueue<V> {
    pub fn new() -> Self {
        Self {
            heap: RwLock::new(Vec::with_capacity(MIN_CAPACITY)),
        }
    }

    // == Enqueue ==
    /// Schedules `entry` at its current deadline.
    ///
    /// Returns false (and does nothing) for entries that never expire.
    pub fn enqueue(&self, entry: &Arc<CacheEntry<V>>) -> bool {
        let (Some(deadline), generation) = entry.schedule() else {
            return false;
        };
        let mut heap = self.heap.write();
        if heap.len() == heap.capacity() {
            let grow_by = heap.capacity().max(MIN_CAPACITY);
            heap.reserve_exact(grow_by);
        }
        heap.push(Slot {
            deadline,
            generation,
            entry: entry.clone(),
        });
        let last = heap.len() - 1;
        sift_up(&mut heap, last);
        true
    }

    // == Peek ==
    /// Entry at the root, without removing it. May be a tombstone.
    pub fn peek(&self) -> Option<Arc<CacheEntry<V>>> {
        self.heap.read().first().map(|slot| slot.entry.clone())
    }

    // == Dequeue ==
    /// Removes and returns the root entry. May be a tombstone.
    pub fn dequeue(&self) -> Option<Arc<CacheEntry<V>>> {
        let mut heap = self.heap.write();
        pop_root(&mut heap).map(|slot| slot.entry)
    }

    /// Pops the next live entry whose deadline is at or before `now`.
    ///
    /// Tombstones met at the root are discarded on the way. Stops at the first
    /// live entry that has not expired yet; heap order guarantees every other
    /// slot expires later.
    pub fn dequeue_expired(&self, now: Instant) -> Option<Arc<CacheEntry<V>>> {
        let mut heap = self.heap.write();
        loop {
            let root = heap.first()?;
            if root.is_stale() {
                pop_root(&mut heap);
                continue;
            }
            if root.deadline > now {
                return None;
            }
            return pop_root(&mut heap).map(|slot| slot.entry);
        }
    }

    // == Compact ==
    /// Drops every tombstone and restores heap order. Returns slots dropped.
    pub fn compact(&self) -> usize {
        let mut heap = self.heap.write();
        let before = heap.len();
        heap.retain(|slot| !slot.is_stale());
        for index in (0..heap.len() / 2).rev() {
            sift_down(&mut heap, index);
        }
        maybe_shrink(&mut heap);
        before - heap.len()
    }

    pub fn clear(&self) {
        let mut heap = self.heap.write();
        heap.clear();
        heap.shrink_to(MIN_CAPACITY);
    }

    /// Number of slots, tombstones included.
    pub fn len(&self) -> usize {
        self.heap.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.heap.read().capacity()
    }
}

impl<V> Default for ExpirationQueue<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for ExpirationQueue<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let heap = self.heap.read();
        f.debug_struct("ExpirationQueue")
            .field("len", &heap.len())
            .field("capacity", &heap.capacity())
            .finish()
    }
}

// == Heap Primitives ==
fn pop_root<V>(heap: &mut Vec<Slot<V>>) -> Option<Slot<V>> {
    if heap.is_empty() {
        return None;
    }
    let root = heap.swap_remove(0);
    if !heap.is_empty() {
        sift_down(heap, 0);
    }
    maybe_shrink(heap);
    Some(root)
}

fn sift_up<V>(heap: &mut [Slot<V>], mut index: usize) {
    while index > 0 {
        let parent = (index - 1) / 2;
        if heap[parent].deadline <= heap[index].deadline {
            break;
        }
        heap.swap(parent, index);
        index = parent;
    }
}

fn sift_down<V>(heap: &mut [Slot<V>], mut index: usize) {
    let len = heap.len();
    loop {
        let left = 2 * index + 1;
        let right = left + 1;
        let mut smallest = index;
        if left < len && heap[left].deadline < heap[smallest].deadline {
            smallest = left;
        }
        if right < len && heap[right].deadline < heap[smallest].deadline {
            smallest = right;
        }
        if smallest == index {
            return;
        }
        heap.swap(index, smallest);
        index = smallest;
    }
}

/// Halves storage once occupancy drops below a quarter.
///
/// Growth happens at full occupancy, so a queue hovering around one size does
/// not bounce between grow and shrink.
fn maybe_shrink<V>(heap: &mut Vec<Slot<V>>) {
    let capacity = heap.capacity();
    if capacity > MIN_CAPACITY && heap.len() < capacity / 4 {
        heap.shrink_to((capacity / 2).max(MIN_CAPACITY));
    }
}

#[cfg(test)]
impl<V> ExpirationQueue<V> {
    /// Asserts the heap property over every slot.
    pub(crate) fn debug_validate_invariants(&self) {
        let heap = self.heap.read();
        for index in 1..heap.len() {
            let parent = (index - 1) / 2;
            assert!(
                heap[parent].deadline <= heap[index].deadline,
                "heap order violated at slot {}",
                index
            );
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachePolicy, RemovedReason};
    use std::time::Duration;

    fn entry_in(key: &str, secs: u64) -> Arc<CacheEntry<u32>> {
        Arc::new(CacheEntry::new(key, 0, CachePolicy::sliding(Duration::from_secs(secs))).unwrap())
    }

    #[test]
    fn test_empty_queue() {
        let queue: ExpirationQueue<u32> = ExpirationQueue::new();
        assert!(queue.is_empty());
        assert!(queue.peek().is_none());
        assert!(queue.dequeue().is_none());
        assert!(queue.dequeue_expired(Instant::now()).is_none());
    }

    #[test]
    fn test_enqueue_ignores_non_expiring_entries() {
        let queue = ExpirationQueue::new();
        let entry = Arc::new(CacheEntry::new("k", 0u32, CachePolicy::new()).unwrap());

        assert!(!queue.enqueue(&entry));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_dequeue_in_deadline_order() {
        let queue = ExpirationQueue::new();
        for (key, secs) in [("c", 30), ("a", 10), ("e", 50), ("b", 20), ("d", 40)] {
            queue.enqueue(&entry_in(key, secs));
        }
        queue.debug_validate_invariants();

        assert_eq!(queue.peek().unwrap().key(), "a");
        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue())
            .map(|e| e.key().to_string())
            .collect();
        assert_eq!(order, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_dequeue_expired_stops_at_live_entry() {
        let queue = ExpirationQueue::new();
        let soon = entry_in("soon", 1);
        let later = entry_in("later", 3600);
        queue.enqueue(&soon);
        queue.enqueue(&later);

        let now = Instant::now();
        assert!(queue.dequeue_expired(now).is_none());

        let in_two_seconds = now + Duration::from_secs(2);
        assert_eq!(queue.dequeue_expired(in_two_seconds).unwrap().key(), "soon");
        assert!(queue.dequeue_expired(in_two_seconds).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_tombstones_are_skipped() {
        let queue = ExpirationQueue::new();
        let removed = entry_in("removed", 1);
        let live = entry_in("live", 2);
        queue.enqueue(&removed);
        queue.enqueue(&live);

        assert!(removed.mark_removed(RemovedReason::Removed).is_some());

        let future = Instant::now() + Duration::from_secs(10);
        assert_eq!(queue.dequeue_expired(future).unwrap().key(), "live");
        assert!(queue.dequeue_expired(future).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_rescheduled_entry_leaves_stale_slot() {
        let queue = ExpirationQueue::new();
        let entry = entry_in("k", 1);
        queue.enqueue(&entry);
        entry.refresh_sliding();
        queue.enqueue(&entry);
        assert_eq!(queue.len(), 2);

        let future = Instant::now() + Duration::from_secs(10);
        assert!(queue.dequeue_expired(future).is_some());
        assert!(queue.dequeue_expired(future).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_compact_drops_tombstones() {
        let queue = ExpirationQueue::new();
        let entries: Vec<_> = (0..20).map(|i| entry_in(&format!("k{}", i), 10 + i)).collect();
        for entry in &entries {
            queue.enqueue(entry);
        }
        for entry in entries.iter().step_by(2) {
            entry.mark_removed(RemovedReason::Removed);
        }

        assert_eq!(queue.compact(), 10);
        assert_eq!(queue.len(), 10);
        queue.debug_validate_invariants();
        assert_eq!(queue.peek().unwrap().key(), "k1");
    }

    #[test]
    fn test_storage_grows_and_shrinks() {
        let queue = ExpirationQueue::new();
        for i in 0..1000 {
            queue.enqueue(&entry_in(&format!("k{}", i), 1 + i));
        }
        let grown = queue.capacity();
        assert!(grown >= 1000);

        while queue.len() > 10 {
            queue.dequeue();
        }
        queue.debug_validate_invariants();
        assert!(queue.capacity() < grown);
        assert!(queue.capacity() >= MIN_CAPACITY);
    }
}
