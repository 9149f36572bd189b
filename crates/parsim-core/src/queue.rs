//! The per-timeline event queue.
//!
//! A min-heap ordered by `(time, class, tiebreak)`. The tiebreak is a
//! per-timeline auto-incrementing counter assigned at enqueue, which makes
//! the order of equal-timestamp entries deterministic and stable. The class
//! ranks channel events ahead of process wakes and timer pops at the same
//! instant.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::time::VirtualTime;

/// Ordering class of a queue entry at equal timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryClass {
    /// Channel event delivery.
    Event,
    /// Process wake-up (wait expiry, timeout) or timer pop.
    Wake,
}

/// The full ordering key of a queued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueKey {
    pub time: VirtualTime,
    pub class: EntryClass,
    pub tiebreak: u64,
}

struct Slot<T> {
    key: QueueKey,
    item: T,
}

impl<T> PartialEq for Slot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for Slot<T> {}

impl<T> PartialOrd for Slot<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Slot<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest key on top.
        other.key.cmp(&self.key)
    }
}

/// Priority queue over `(time, class, tiebreak)`.
pub struct EventQueue<T> {
    heap: BinaryHeap<Slot<T>>,
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        EventQueue {
            heap: BinaryHeap::new(),
        }
    }

    /// Insert an entry under the given key.
    pub fn insert(&mut self, key: QueueKey, item: T) {
        self.heap.push(Slot { key, item });
    }

    /// Insert a batch of keyed entries.
    pub fn bulk_insert(&mut self, batch: impl IntoIterator<Item = (QueueKey, T)>) {
        for (key, item) in batch {
            self.insert(key, item);
        }
    }

    /// Key of the earliest entry, if any.
    pub fn peek_top(&self) -> Option<QueueKey> {
        self.heap.peek().map(|slot| slot.key)
    }

    /// Timestamp of the earliest entry, or `INFINITY` when empty.
    pub fn next_time(&self) -> VirtualTime {
        self.peek_top()
            .map(|k| k.time)
            .unwrap_or(VirtualTime::INFINITY)
    }

    /// Remove and return the earliest entry.
    pub fn pop_top(&mut self) -> Option<(QueueKey, T)> {
        self.heap.pop().map(|slot| (slot.key, slot.item))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(t: i64, class: EntryClass, tiebreak: u64) -> QueueKey {
        QueueKey {
            time: VirtualTime::from_ticks(t),
            class,
            tiebreak,
        }
    }

    #[test]
    fn test_orders_by_time() {
        let mut q = EventQueue::new();
        q.insert(key(30, EntryClass::Event, 0), "c");
        q.insert(key(10, EntryClass::Event, 1), "a");
        q.insert(key(20, EntryClass::Event, 2), "b");
        assert_eq!(q.pop_top().unwrap().1, "a");
        assert_eq!(q.pop_top().unwrap().1, "b");
        assert_eq!(q.pop_top().unwrap().1, "c");
        assert!(q.pop_top().is_none());
    }

    #[test]
    fn test_equal_time_pops_by_tiebreak() {
        let mut q = EventQueue::new();
        q.insert(key(5, EntryClass::Event, 2), "second");
        q.insert(key(5, EntryClass::Event, 1), "first");
        q.insert(key(5, EntryClass::Event, 3), "third");
        assert_eq!(q.pop_top().unwrap().1, "first");
        assert_eq!(q.pop_top().unwrap().1, "second");
        assert_eq!(q.pop_top().unwrap().1, "third");
    }

    #[test]
    fn test_events_pop_before_wakes_at_equal_time() {
        let mut q = EventQueue::new();
        q.insert(key(5, EntryClass::Wake, 1), "wake");
        q.insert(key(5, EntryClass::Event, 2), "event");
        assert_eq!(q.pop_top().unwrap().1, "event");
        assert_eq!(q.pop_top().unwrap().1, "wake");
    }

    #[test]
    fn test_next_time_reports_infinity_when_empty() {
        let q: EventQueue<()> = EventQueue::new();
        assert_eq!(q.next_time(), VirtualTime::INFINITY);
        assert!(q.peek_top().is_none());
    }

    #[test]
    fn test_bulk_insert() {
        let mut q = EventQueue::new();
        q.bulk_insert((0..100u64).map(|i| (key(100 - i as i64, EntryClass::Event, i), i)));
        let mut last = VirtualTime::ZERO;
        let mut n = 0;
        while let Some((k, _)) = q.pop_top() {
            assert!(k.time >= last);
            last = k.time;
            n += 1;
        }
        assert_eq!(n, 100);
    }

    #[test]
    fn test_interleaved_insert_pop() {
        let mut q = EventQueue::new();
        q.insert(key(10, EntryClass::Event, 0), 10);
        q.insert(key(5, EntryClass::Event, 1), 5);
        assert_eq!(q.pop_top().unwrap().1, 5);
        q.insert(key(1, EntryClass::Event, 2), 1);
        assert_eq!(q.pop_top().unwrap().1, 1);
        assert_eq!(q.pop_top().unwrap().1, 10);
    }
}
