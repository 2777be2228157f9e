use crate::task::Task;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

/// The two ready-queue policies, as a closed sum: a plain FIFO deque when
/// priorities are disabled, a heap keyed by (priority descending, insertion
/// order ascending) when they are enabled.
pub(crate) enum ReadyQueue {
    Fifo(VecDeque<Arc<Task>>),
    Priority {
        heap: BinaryHeap<PrioEntry>,
        next_seq: u64,
    },
}

pub(crate) struct PrioEntry {
    priority: i64,
    seq: u64,
    task: Arc<Task>,
}

impl PartialEq for PrioEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PrioEntry {}

impl Ord for PrioEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then FIFO within equal priority.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PrioEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl ReadyQueue {
    pub(crate) fn new(enable_priority: bool) -> Self {
        if enable_priority {
            ReadyQueue::Priority {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }
        } else {
            ReadyQueue::Fifo(VecDeque::new())
        }
    }

    pub(crate) fn push(&mut self, task: Arc<Task>) {
        match self {
            ReadyQueue::Fifo(q) => q.push_back(task),
            ReadyQueue::Priority { heap, next_seq } => {
                let priority = task.priority();
                heap.push(PrioEntry {
                    priority,
                    seq: *next_seq,
                    task,
                });
                *next_seq += 1;
            }
        }
    }

    /// Unblocked tasks resume ahead of waiting work.
    pub(crate) fn push_front(&mut self, task: Arc<Task>) {
        match self {
            ReadyQueue::Fifo(q) => q.push_front(task),
            ReadyQueue::Priority { .. } => self.push(task),
        }
    }

    pub(crate) fn pop(&mut self) -> Option<Arc<Task>> {
        match self {
            ReadyQueue::Fifo(q) => q.pop_front(),
            ReadyQueue::Priority { heap, .. } => heap.pop().map(|e| e.task),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            ReadyQueue::Fifo(q) => q.len(),
            ReadyQueue::Priority { heap, .. } => heap.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
