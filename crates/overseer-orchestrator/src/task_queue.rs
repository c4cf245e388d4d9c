use crate::types::Task;
use overseer_core::{OverseerError, OverseerResult, SchedulingAlgorithm};
use std::collections::{BTreeMap, VecDeque};

/// A queued task together with its insertion sequence number.
///
/// The sequence number is the FIFO tie-break within a priority bucket and
/// the global ordering key for the `fifo` algorithm.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Monotonic insertion sequence number.
    pub seq: u64,
    /// Requestor group, captured at enqueue time for round-robin scheduling.
    pub requestor: String,
    /// The queued task.
    pub task: Task,
}

/// An ordered, priority-bucketed collection of pending tasks.
///
/// Not internally synchronized; the orchestrator wraps it in a lock and the
/// dispatch loop is the single consumer.
pub struct TaskQueue {
    buckets: BTreeMap<u8, VecDeque<QueueEntry>>,
    limit: usize,
    len: usize,
    next_seq: u64,
    /// Requestor groups in first-seen order. Never pruned so the round-robin
    /// cursor stays stable across transient empties.
    groups: Vec<String>,
    rr_cursor: usize,
}

impl TaskQueue {
    /// Create a queue bounded at `limit` entries.
    pub fn new(limit: usize) -> Self {
        Self {
            buckets: BTreeMap::new(),
            limit,
            len: 0,
            next_seq: 0,
            groups: Vec::new(),
            rr_cursor: 0,
        }
    }

    /// Insert a task, respecting priority ordering and FIFO within a bucket.
    ///
    /// Fails with [`OverseerError::QueueFull`] once the configured limit is
    /// reached; the queue state is untouched in that case.
    pub fn enqueue(&mut self, task: Task) -> OverseerResult<u64> {
        if self.len >= self.limit {
            return Err(OverseerError::QueueFull { limit: self.limit });
        }
        let seq = self.next_seq;
        self.next_seq += 1;

        let requestor = task.requestor().to_string();
        if !self.groups.contains(&requestor) {
            self.groups.push(requestor.clone());
        }

        self.buckets.entry(task.priority).or_default().push_back(QueueEntry {
            seq,
            requestor,
            task,
        });
        self.len += 1;
        Ok(seq)
    }

    /// Remove and return the next task under the given scheduling algorithm,
    /// or `None` when the queue is empty.
    pub fn dequeue_next(&mut self, algorithm: SchedulingAlgorithm) -> Option<Task> {
        if self.len == 0 {
            return None;
        }
        let entry = match algorithm {
            SchedulingAlgorithm::Priority => self.pop_priority(),
            SchedulingAlgorithm::Fifo => self.pop_fifo(),
            SchedulingAlgorithm::RoundRobin => self.pop_round_robin(),
        };
        if entry.is_some() {
            self.len -= 1;
        }
        entry.map(|e| e.task)
    }

    /// Highest non-empty bucket, oldest entry.
    fn pop_priority(&mut self) -> Option<QueueEntry> {
        let priority = *self
            .buckets
            .iter()
            .rev()
            .find(|(_, bucket)| !bucket.is_empty())
            .map(|(p, _)| p)?;
        self.buckets.get_mut(&priority)?.pop_front()
    }

    /// Globally oldest entry, priorities ignored. Bucket fronts hold each
    /// bucket's minimum sequence number, so scanning fronts suffices.
    fn pop_fifo(&mut self) -> Option<QueueEntry> {
        let priority = *self
            .buckets
            .iter()
            .filter(|(_, bucket)| !bucket.is_empty())
            .min_by_key(|(_, bucket)| bucket.front().map_or(u64::MAX, |e| e.seq))
            .map(|(p, _)| p)?;
        self.buckets.get_mut(&priority)?.pop_front()
    }

    /// Next requestor group in rotation; within the group, highest priority
    /// then oldest.
    fn pop_round_robin(&mut self) -> Option<QueueEntry> {
        let group_count = self.groups.len();
        for offset in 0..group_count {
            let idx = (self.rr_cursor + offset) % group_count;
            let group = self.groups[idx].clone();
            if let Some(entry) = self.pop_for_group(&group) {
                self.rr_cursor = (idx + 1) % group_count;
                return Some(entry);
            }
        }
        None
    }

    fn pop_for_group(&mut self, group: &str) -> Option<QueueEntry> {
        // Highest priority first, FIFO within the bucket.
        let mut found: Option<(u8, usize)> = None;
        for (&priority, bucket) in self.buckets.iter().rev() {
            if let Some(pos) = bucket.iter().position(|e| e.requestor == group) {
                found = Some((priority, pos));
                break;
            }
        }
        let (priority, pos) = found?;
        self.buckets.get_mut(&priority)?.remove(pos)
    }

    /// Per-priority-bucket sizes, for observability.
    pub fn peek_counts(&self) -> BTreeMap<u8, usize> {
        self.buckets
            .iter()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(&p, bucket)| (p, bucket.len()))
            .collect()
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the queue holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remove and return every queued task (used when cancelling on stop).
    pub fn drain(&mut self) -> Vec<Task> {
        let mut drained = Vec::with_capacity(self.len);
        for bucket in self.buckets.values_mut() {
            drained.extend(bucket.drain(..).map(|e| e.task));
        }
        self.len = 0;
        drained
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::TaskSpec;
    use serde_json::json;

    fn task(priority: u8) -> Task {
        Task::from_spec(
            TaskSpec::new(json!({"p": priority})).with_priority(priority),
            1,
            3,
        )
    }

    fn task_for(priority: u8, requestor: &str) -> Task {
        Task::from_spec(
            TaskSpec::new(json!({}))
                .with_priority(priority)
                .with_metadata("requestor", requestor),
            1,
            3,
        )
    }

    #[test]
    fn test_empty_queue() {
        let mut queue = TaskQueue::new(10);
        assert!(queue.is_empty());
        assert!(queue.dequeue_next(SchedulingAlgorithm::Priority).is_none());
        assert!(queue.peek_counts().is_empty());
    }

    #[test]
    fn test_priority_ordering() {
        let mut queue = TaskQueue::new(10);
        queue.enqueue(task(2)).unwrap();
        queue.enqueue(task(9)).unwrap();
        queue.enqueue(task(5)).unwrap();

        let order: Vec<u8> = (0..3)
            .map(|_| {
                queue
                    .dequeue_next(SchedulingAlgorithm::Priority)
                    .unwrap()
                    .priority
            })
            .collect();
        assert_eq!(order, vec![9, 5, 2]);
    }

    #[test]
    fn test_fifo_within_bucket() {
        let mut queue = TaskQueue::new(10);
        let first = task(5);
        let first_id = first.id;
        let second = task(5);
        let second_id = second.id;
        queue.enqueue(first).unwrap();
        queue.enqueue(second).unwrap();

        assert_eq!(
            queue
                .dequeue_next(SchedulingAlgorithm::Priority)
                .unwrap()
                .id,
            first_id
        );
        assert_eq!(
            queue
                .dequeue_next(SchedulingAlgorithm::Priority)
                .unwrap()
                .id,
            second_id
        );
    }

    #[test]
    fn test_fifo_ignores_priority() {
        let mut queue = TaskQueue::new(10);
        let low = task(1);
        let low_id = low.id;
        queue.enqueue(low).unwrap();
        queue.enqueue(task(10)).unwrap();

        assert_eq!(
            queue.dequeue_next(SchedulingAlgorithm::Fifo).unwrap().id,
            low_id
        );
    }

    #[test]
    fn test_round_robin_cycles_groups() {
        let mut queue = TaskQueue::new(10);
        // alice floods the queue at high priority; bob has one low-priority task.
        queue.enqueue(task_for(9, "alice")).unwrap();
        queue.enqueue(task_for(9, "alice")).unwrap();
        queue.enqueue(task_for(1, "bob")).unwrap();

        let first = queue.dequeue_next(SchedulingAlgorithm::RoundRobin).unwrap();
        let second = queue.dequeue_next(SchedulingAlgorithm::RoundRobin).unwrap();
        let third = queue.dequeue_next(SchedulingAlgorithm::RoundRobin).unwrap();

        assert_eq!(first.requestor(), "alice");
        // bob is served before alice's second task despite lower priority.
        assert_eq!(second.requestor(), "bob");
        assert_eq!(third.requestor(), "alice");
    }

    #[test]
    fn test_round_robin_priority_within_group() {
        let mut queue = TaskQueue::new(10);
        queue.enqueue(task_for(1, "alice")).unwrap();
        queue.enqueue(task_for(8, "alice")).unwrap();

        let first = queue.dequeue_next(SchedulingAlgorithm::RoundRobin).unwrap();
        assert_eq!(first.priority, 8);
    }

    #[test]
    fn test_queue_full() {
        let mut queue = TaskQueue::new(2);
        queue.enqueue(task(1)).unwrap();
        queue.enqueue(task(2)).unwrap();

        let result = queue.enqueue(task(3));
        assert!(matches!(result, Err(OverseerError::QueueFull { limit: 2 })));

        // Previously queued tasks still come out in order.
        assert_eq!(
            queue
                .dequeue_next(SchedulingAlgorithm::Priority)
                .unwrap()
                .priority,
            2
        );
        assert_eq!(
            queue
                .dequeue_next(SchedulingAlgorithm::Priority)
                .unwrap()
                .priority,
            1
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_peek_counts() {
        let mut queue = TaskQueue::new(10);
        queue.enqueue(task(3)).unwrap();
        queue.enqueue(task(3)).unwrap();
        queue.enqueue(task(7)).unwrap();

        let counts = queue.peek_counts();
        assert_eq!(counts.get(&3), Some(&2));
        assert_eq!(counts.get(&7), Some(&1));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_drain() {
        let mut queue = TaskQueue::new(10);
        queue.enqueue(task(1)).unwrap();
        queue.enqueue(task(5)).unwrap();

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
        assert!(queue.dequeue_next(SchedulingAlgorithm::Priority).is_none());
    }

    #[test]
    fn test_sequence_numbers_are_monotonic() {
        let mut queue = TaskQueue::new(10);
        let a = queue.enqueue(task(1)).unwrap();
        let b = queue.enqueue(task(9)).unwrap();
        let c = queue.enqueue(task(5)).unwrap();
        assert!(a < b && b < c);
    }
}
