use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Instant;

/// A lightweight (device id, deadline) tuple. The queue never holds the
/// device itself; ids are resolved against the entity service at pop time,
/// which is what makes stale duplicates harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineEntry {
    pub device_id: i64,
    pub deadline: Instant,
}

impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.device_id.cmp(&other.device_id))
    }
}

impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of device deadlines, owned by the scheduler task alone so no
/// locking is needed.
#[derive(Default)]
pub struct DeadlineQueue {
    heap: BinaryHeap<Reverse<DeadlineEntry>>,
}

impl DeadlineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn push(&mut self, entry: DeadlineEntry) {
        self.heap.push(Reverse(entry));
    }

    /// Inserts a whole tick's worth of rescheduled entries in one heap
    /// rebuild, O(n) amortized instead of O(k log n) pushes.
    pub fn push_batch(&mut self, entries: impl IntoIterator<Item = DeadlineEntry>) {
        let mut items = std::mem::take(&mut self.heap).into_vec();
        items.extend(entries.into_iter().map(Reverse));
        self.heap = BinaryHeap::from(items);
    }

    /// Drains every entry with `deadline <= now`, in non-decreasing deadline
    /// order.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<DeadlineEntry> {
        let mut expired = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek().copied() {
            if entry.deadline > now {
                break;
            }
            self.heap.pop();
            expired.push(entry);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(device_id: i64, deadline: Instant) -> DeadlineEntry {
        DeadlineEntry {
            device_id,
            deadline,
        }
    }

    #[test]
    fn test_pop_expired_returns_only_due_entries_in_order() {
        let now = Instant::now();
        let mut queue = DeadlineQueue::new();
        queue.push(entry(3, now + Duration::from_secs(30)));
        queue.push(entry(1, now - Duration::from_secs(10)));
        queue.push(entry(2, now - Duration::from_secs(5)));
        queue.push(entry(4, now));

        let expired = queue.pop_expired(now);
        let ids: Vec<i64> = expired.iter().map(|e| e.device_id).collect();
        assert_eq!(ids, vec![1, 2, 4]);
        // Deadlines come out non-decreasing.
        assert!(expired.windows(2).all(|w| w[0].deadline <= w[1].deadline));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_pop_expired_empty_queue() {
        let mut queue = DeadlineQueue::new();
        assert!(queue.pop_expired(Instant::now()).is_empty());
    }

    #[test]
    fn test_push_batch_preserves_heap_order() {
        let now = Instant::now();
        let mut queue = DeadlineQueue::new();
        queue.push(entry(1, now + Duration::from_secs(5)));
        queue.push_batch(vec![
            entry(2, now + Duration::from_secs(1)),
            entry(3, now + Duration::from_secs(9)),
            entry(4, now),
        ]);
        let expired = queue.pop_expired(now + Duration::from_secs(10));
        let ids: Vec<i64> = expired.iter().map(|e| e.device_id).collect();
        assert_eq!(ids, vec![4, 2, 1, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_device_ids_coexist() {
        let now = Instant::now();
        let mut queue = DeadlineQueue::new();
        queue.push(entry(7, now));
        queue.push(entry(7, now - Duration::from_secs(1)));
        let expired = queue.pop_expired(now);
        assert_eq!(expired.len(), 2);
        assert!(expired.iter().all(|e| e.device_id == 7));
    }

    #[test]
    fn test_interleaved_pushes_and_pops() {
        let now = Instant::now();
        let mut queue = DeadlineQueue::new();
        queue.push(entry(1, now));
        assert_eq!(queue.pop_expired(now).len(), 1);
        queue.push(entry(2, now + Duration::from_secs(2)));
        assert!(queue.pop_expired(now).is_empty());
        queue.push_batch(vec![entry(3, now + Duration::from_secs(1))]);
        let expired = queue.pop_expired(now + Duration::from_secs(2));
        let ids: Vec<i64> = expired.iter().map(|e| e.device_id).collect();
        assert_eq!(ids, vec![3, 2]);
    }
}
