//! Pending work, optionally partitioned by worker.

use crate::task::Task;
use crate::worker::WorkerId;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Ordered pending tasks.
///
/// Implementations are used under the farm's lock and need no internal
/// synchronization.
pub trait TaskQueue: Send {
    /// Queue a task, pinned to `worker_id` if given, or eligible for any worker.
    fn enqueue(&mut self, task: Arc<Task>, worker_id: Option<WorkerId>);

    /// The oldest task eligible for `worker_id`, pinned tasks first.
    fn dequeue(&mut self, worker_id: WorkerId) -> Option<Arc<Task>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every queued task.
    fn drain(&mut self) -> Vec<Arc<Task>>;
}

/// FIFO queue with one shared lane and one lane per pinned worker.
#[derive(Debug, Default)]
pub struct FifoQueue {
    shared: VecDeque<Arc<Task>>,
    pinned: HashMap<WorkerId, VecDeque<Arc<Task>>>,
}

impl FifoQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskQueue for FifoQueue {
    fn enqueue(&mut self, task: Arc<Task>, worker_id: Option<WorkerId>) {
        match worker_id {
            None => self.shared.push_back(task),
            Some(worker_id) => {
                let lane = self.pinned.entry(worker_id).or_default();
                // A task re-pinned late still lands in submission order.
                let at = lane.partition_point(|queued| queued.seq < task.seq);
                lane.insert(at, task);
            }
        }
    }

    fn dequeue(&mut self, worker_id: WorkerId) -> Option<Arc<Task>> {
        self.pinned
            .get_mut(&worker_id)
            .and_then(VecDeque::pop_front)
            .or_else(|| self.shared.pop_front())
    }

    fn len(&self) -> usize {
        self.shared.len() + self.pinned.values().map(VecDeque::len).sum::<usize>()
    }

    fn drain(&mut self) -> Vec<Arc<Task>> {
        let mut tasks: Vec<Arc<Task>> = self.shared.drain(..).collect();
        for lane in self.pinned.values_mut() {
            tasks.extend(lane.drain(..));
        }
        tasks.sort_by_key(|task| task.seq);
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::CallRequest;
    use proptest::prelude::*;

    fn task(seq: u64) -> Arc<Task> {
        let (task, _handle) = Task::new(seq, CallRequest::new("m", vec![]), None);
        Arc::new(task)
    }

    fn seqs(queue: &mut FifoQueue, worker_id: WorkerId) -> Vec<u64> {
        std::iter::from_fn(|| queue.dequeue(worker_id))
            .map(|t| t.seq)
            .collect()
    }

    #[test]
    fn test_empty_queue() {
        let mut queue = FifoQueue::new();
        assert!(queue.is_empty());
        assert!(queue.dequeue(0).is_none());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_pinned_before_shared() {
        let mut queue = FifoQueue::new();
        queue.enqueue(task(1), None);
        queue.enqueue(task(2), Some(0));
        queue.enqueue(task(3), None);
        assert_eq!(queue.len(), 3);

        assert_eq!(seqs(&mut queue, 0), vec![2, 1, 3]);
    }

    #[test]
    fn test_pinned_invisible_to_other_workers() {
        let mut queue = FifoQueue::new();
        queue.enqueue(task(1), Some(1));
        assert!(queue.dequeue(0).is_none());
        assert_eq!(queue.dequeue(1).map(|t| t.seq), Some(1));
    }

    #[test]
    fn test_late_pin_keeps_submission_order() {
        let mut queue = FifoQueue::new();
        queue.enqueue(task(5), Some(0));
        queue.enqueue(task(9), Some(0));
        queue.enqueue(task(7), Some(0));
        assert_eq!(seqs(&mut queue, 0), vec![5, 7, 9]);
    }

    #[test]
    fn test_drain_empties_everything() {
        let mut queue = FifoQueue::new();
        queue.enqueue(task(3), Some(2));
        queue.enqueue(task(1), None);
        queue.enqueue(task(2), Some(0));

        let drained: Vec<u64> = queue.drain().iter().map(|t| t.seq).collect();
        assert_eq!(drained, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    proptest! {
        /// Every enqueued task comes out exactly once, and each lane stays in seq order.
        #[test]
        fn dequeue_is_exactly_once_and_ordered(
            pins in prop::collection::vec(prop::option::of(0usize..3), 0..60),
            order in prop::collection::vec(0usize..3, 0..200),
        ) {
            let mut queue = FifoQueue::new();
            for (seq, pin) in pins.iter().enumerate() {
                queue.enqueue(task(seq as u64), *pin);
            }

            let mut seen = Vec::new();
            let mut last_per_worker: HashMap<WorkerId, u64> = HashMap::new();
            let mut last_shared = None;
            for worker in order.into_iter().chain([0, 1, 2].into_iter().cycle().take(3 * pins.len())) {
                if let Some(task) = queue.dequeue(worker) {
                    let pin = pins[task.seq as usize];
                    match pin {
                        Some(pinned_to) => {
                            prop_assert_eq!(pinned_to, worker);
                            if let Some(prev) = last_per_worker.insert(worker, task.seq) {
                                prop_assert!(prev < task.seq);
                            }
                        }
                        None => {
                            if let Some(prev) = last_shared.replace(task.seq) {
                                prop_assert!(prev < task.seq);
                            }
                        }
                    }
                    seen.push(task.seq);
                }
            }

            seen.sort_unstable();
            let expected: Vec<u64> = (0..pins.len() as u64).collect();
            prop_assert_eq!(seen, expected);
            prop_assert!(queue.is_empty());
        }
    }
}
