//! Priority queue of admitted jobs waiting for a slot

use std::collections::{BTreeMap, BinaryHeap};

use crate::domain::{JobId, Priority};

use super::error::SchedulerError;

/// A job waiting in the queue
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub group_key: String,
    pub priority: Priority,
    /// Enqueue sequence number, breaks ties inside a priority band
    seq: u64,
}

impl Eq for QueuedJob {}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.job_id == other.job_id
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher priority first, then earlier enqueue
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Bounded priority queue: strict priority, FIFO within a band
#[derive(Debug)]
pub struct PriorityQueue {
    heap: BinaryHeap<QueuedJob>,
    max_len: usize,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new(max_len: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            max_len,
            next_seq: 0,
        }
    }

    /// Fail with backpressure unless one more job fits once `leaving` queued jobs are gone
    pub fn ensure_room(&self, leaving: usize) -> Result<(), SchedulerError> {
        if self.heap.len().saturating_sub(leaving) >= self.max_len {
            return Err(SchedulerError::Backpressure {
                queue_length: self.heap.len(),
                max_queue_length: self.max_len,
            });
        }
        Ok(())
    }

    /// Add a job, rejecting it when the queue is full
    pub fn enqueue(&mut self, job_id: &str, group_key: &str, priority: Priority) -> Result<(), SchedulerError> {
        self.ensure_room(0)?;
        self.force_enqueue(job_id, group_key, priority);
        Ok(())
    }

    /// Add a job regardless of capacity
    ///
    /// Used for retry re-admission: the job was already admitted once and a
    /// full queue must not turn a retry into a silent drop.
    pub fn force_enqueue(&mut self, job_id: &str, group_key: &str, priority: Priority) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedJob {
            job_id: job_id.to_string(),
            group_key: group_key.to_string(),
            priority,
            seq,
        });
    }

    /// Pop the highest-priority, oldest job. No side effects when empty.
    pub fn dequeue_next(&mut self) -> Option<QueuedJob> {
        self.heap.pop()
    }

    /// Return a dequeued job to its original place in its band
    pub fn restore(&mut self, job: QueuedJob) {
        self.heap.push(job);
    }

    /// Remove a job by id
    pub fn remove(&mut self, job_id: &str) -> bool {
        let before = self.heap.len();
        self.heap.retain(|j| j.job_id != job_id);
        before != self.heap.len()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.heap.iter().any(|j| j.job_id == job_id)
    }

    /// 1-based position in dispatch order
    pub fn position(&self, job_id: &str) -> Option<usize> {
        let target = self.heap.iter().find(|j| j.job_id == job_id)?;
        Some(self.heap.iter().filter(|j| *j > target).count() + 1)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.max_len
    }

    pub fn capacity(&self) -> usize {
        self.max_len
    }

    /// Waiting jobs per priority band
    pub fn counts_by_priority(&self) -> BTreeMap<Priority, usize> {
        let mut counts = BTreeMap::new();
        for job in &self.heap {
            *counts.entry(job.priority).or_insert(0) += 1;
        }
        counts
    }

    /// Job ids in dispatch order
    pub fn ordered_ids(&self) -> Vec<JobId> {
        let mut jobs: Vec<_> = self.heap.iter().collect();
        jobs.sort_by(|a, b| b.cmp(a));
        jobs.into_iter().map(|j| j.job_id.clone()).collect()
    }
}
