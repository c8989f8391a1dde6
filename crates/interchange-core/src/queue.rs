//! The priority-ordered pending task queue.
//!
//! Ordering contract (`spec.md` §4.2): for tasks `a` and `b`, `a` is
//! dispatched before `b` iff `a`'s priority is strictly greater, or the
//! priorities are equal and `a` arrived first. This is a max-priority
//! queue, FIFO on ties.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::task::Task;

/// One entry in the [`TaskQueue`]'s internal heap.
///
/// `arrival` is a monotonically increasing counter assigned at
/// `enqueue`-time; it breaks priority ties in favor of the earlier
/// arrival, matching the `(priority_key, arrival_key)` ordering in
/// `spec.md` §3.
struct Entry {
    priority: f64,
    arrival: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority.to_bits() == other.priority.to_bits() && self.arrival == other.arrival
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority sorts greater (pops first); on a tie, the
        // earlier arrival sorts greater (pops first).
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.arrival.cmp(&self.arrival))
    }
}

/// A max-priority, FIFO-on-ties store of pending tasks.
#[derive(Default)]
pub struct TaskQueue {
    heap: BinaryHeap<Entry>,
    next_arrival: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next arrival counter, compute the priority, and insert
    /// the task. O(log n).
    pub fn enqueue(&mut self, task: Task) {
        let priority = task.resource_spec.priority;
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.heap.push(Entry {
            priority,
            arrival,
            task,
        });
    }

    /// Remove up to `n` of the greatest entries. Returns fewer (possibly
    /// zero) if the queue drains first.
    pub fn pop_batch(&mut self, n: usize) -> Vec<Task> {
        let mut out = Vec::with_capacity(n.min(self.heap.len()));
        for _ in 0..n {
            match self.heap.pop() {
                Some(entry) => out.push(entry.task),
                None => break,
            }
        }
        out
    }

    pub fn size(&self) -> usize {
        self.heap.len()
    }

    pub fn nonempty(&self) -> bool {
        !self.heap.is_empty()
    }
}
