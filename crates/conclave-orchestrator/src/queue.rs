//! Ready queue and concurrency slots for the task scheduler.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use conclave_core::types::TaskId;

use crate::task::TaskPriority;

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    priority: TaskPriority,
    seq: u64,
    id: TaskId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then lower sequence (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<Entry>,
    queued: HashSet<TaskId>,
    next_seq: u64,
}

/// Tasks whose dependencies are met and whose role has an agent, waiting
/// for a concurrency slot.
#[derive(Default)]
pub struct ReadyQueue {
    inner: Mutex<QueueInner>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `id`. Returns false if it is already queued.
    pub fn push(&self, id: TaskId, priority: TaskPriority) -> bool {
        let mut inner = self.inner.lock();
        if !inner.queued.insert(id.clone()) {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Entry { priority, seq, id });
        true
    }

    pub fn pop(&self) -> Option<TaskId> {
        let mut inner = self.inner.lock();
        let entry = inner.heap.pop()?;
        inner.queued.remove(&entry.id);
        Some(entry.id)
    }

    /// Drop `id` from the queue. Returns true if it was queued.
    pub fn remove(&self, id: &TaskId) -> bool {
        let mut inner = self.inner.lock();
        if !inner.queued.remove(id) {
            return false;
        }
        inner.heap.retain(|e| &e.id != id);
        true
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.inner.lock().queued.contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded pool of execution slots.
///
/// A slot is taken before a task is assigned and held until its run ends,
/// so the number of running tasks can never pass the bound.
pub struct SlotPool {
    semaphore: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
    capacity: usize,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            running: Arc::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    /// Take a slot if one is free.
    pub fn try_acquire(&self) -> Option<Slot> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        self.running.fetch_add(1, Ordering::SeqCst);
        Some(Slot {
            _permit: permit,
            running: self.running.clone(),
        })
    }

    /// Slots currently held.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Refuse every further acquisition.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// A held execution slot, released on drop.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
    running: Arc<AtomicUsize>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_then_fifo() {
        let queue = ReadyQueue::new();
        queue.push(TaskId::from("low"), TaskPriority::Low);
        queue.push(TaskId::from("n1"), TaskPriority::Normal);
        queue.push(TaskId::from("crit"), TaskPriority::Critical);
        queue.push(TaskId::from("n2"), TaskPriority::Normal);

        let order: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|id| id.to_string())
            .collect();
        assert_eq!(order, vec!["crit", "n1", "n2", "low"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_dedupes_and_remove() {
        let queue = ReadyQueue::new();
        assert!(queue.push(TaskId::from("a"), TaskPriority::Normal));
        assert!(!queue.push(TaskId::from("a"), TaskPriority::High));
        assert!(queue.push(TaskId::from("b"), TaskPriority::Normal));
        assert_eq!(queue.len(), 2);

        assert!(queue.remove(&TaskId::from("a")));
        assert!(!queue.remove(&TaskId::from("a")));
        assert!(!queue.contains(&TaskId::from("a")));
        assert_eq!(queue.pop(), Some(TaskId::from("b")));

        // Popped ids may be queued again.
        assert!(queue.push(TaskId::from("b"), TaskPriority::Normal));
    }

    #[test]
    fn test_slots_are_bounded() {
        let pool = SlotPool::new(2);
        let a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.running(), 2);

        drop(a);
        assert_eq!(pool.running(), 1);
        assert!(pool.try_acquire().is_some());

        pool.close();
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.capacity(), 2);
    }
}
