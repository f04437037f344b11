// src/driver/queue.rs

//! Pending-record queues, one FIFO per factory priority.

use std::collections::VecDeque;

use crate::action::{Priority, NUM_PRIORITIES};
use crate::tags::RecordId;

/// The driver dequeues from the lowest-numbered non-empty queue; ties within
/// a priority break by insertion order.
pub struct PendingQueues {
    queues: [VecDeque<RecordId>; NUM_PRIORITIES],
}

impl PendingQueues {
    pub fn new() -> PendingQueues {
        PendingQueues {
            queues: Default::default(),
        }
    }

    pub fn push(&mut self, priority: Priority, id: RecordId) {
        self.queues[priority.index()].push_back(id);
    }

    pub fn pop(&mut self) -> Option<RecordId> {
        self.queues.iter_mut().find_map(|queue| queue.pop_front())
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(|queue| queue.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|queue| queue.is_empty())
    }
}

impl Default for PendingQueues {
    fn default() -> PendingQueues {
        PendingQueues::new()
    }
}
