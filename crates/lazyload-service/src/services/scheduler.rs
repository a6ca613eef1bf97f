//! Queues feeding the background workers.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::types::Priority;

/// An unbounded FIFO queue that can be shared between producers and workers.
#[derive(Debug)]
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: T) {
        self.lock().push_back(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Moves every item of `self` to the back of `other`, keeping their order.
    fn drain_into(&self, other: &WorkQueue<T>) {
        let mut drained = std::mem::take(&mut *self.lock());
        other.lock().append(&mut drained);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        // A panic while holding the lock cannot leave a `VecDeque` half-modified.
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Three strict-priority FIFO tiers of pending fetches.
#[derive(Debug)]
pub struct PriorityQueues<T> {
    fastest: WorkQueue<T>,
    faster: WorkQueue<T>,
    fast: WorkQueue<T>,
}

impl<T> Default for PriorityQueues<T> {
    fn default() -> Self {
        Self {
            fastest: WorkQueue::new(),
            faster: WorkQueue::new(),
            fast: WorkQueue::new(),
        }
    }
}

impl<T> PriorityQueues<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn tier(&self, priority: Priority) -> &WorkQueue<T> {
        match priority {
            Priority::Fastest => &self.fastest,
            Priority::Faster => &self.faster,
            Priority::Fast => &self.fast,
        }
    }

    pub fn enqueue(&self, priority: Priority, item: T) {
        self.tier(priority).push(item);
    }

    /// Takes the oldest item of the highest non-empty tier.
    ///
    /// `None` means that all three tiers were empty when they were looked at.
    pub fn dequeue_next(&self) -> Option<T> {
        self.fastest
            .pop()
            .or_else(|| self.faster.pop())
            .or_else(|| self.fast.pop())
    }

    /// Demotes every queued item by one tier. Items already in the lowest tier stay there.
    ///
    /// `Faster` items are moved first, so that items demoted from `Fastest` end up ahead of new
    /// `Faster` arrivals but are not demoted twice.
    pub fn reset_priority(&self) {
        self.faster.drain_into(&self.fast);
        self.fastest.drain_into(&self.faster);
    }

    pub fn len(&self, priority: Priority) -> usize {
        self.tier(priority).len()
    }

    pub fn is_empty(&self) -> bool {
        self.fastest.is_empty() && self.faster.is_empty() && self.fast.is_empty()
    }
}
