//! In-memory priority job queue.
//!
//! Backed by a binary heap instead of Redis: the spec for this queue forbids
//! holding the dispatch lock across I/O, which only a synchronous, in-process
//! structure can guarantee. Enqueue/dequeue/metrics all share one
//! `std::sync::Mutex` over the heap; nothing else is held while that lock is
//! taken.

use crate::jobs::{Job, JobId, JobPriority};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;

/// Heap entry: ordered by priority first, then earliest submission first.
#[derive(Debug, Clone)]
struct Entry {
    priority: JobPriority,
    submitted_at: chrono::DateTime<chrono::Utc>,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.submitted_at == other.submitted_at
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want higher priority, then earlier
        // submission, to sort first, so reverse the time comparison.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.submitted_at.cmp(&self.submitted_at))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
    enqueued: u64,
    dequeued: u64,
    completed: u64,
    failed: u64,
    timed_out: u64,
    retried: u64,
}

/// Bounded, priority-ordered, FIFO-within-priority job dispatcher.
pub struct JobQueue {
    name: String,
    max_size: usize,
    inner: Mutex<Inner>,
}

impl JobQueue {
    pub fn new(name: impl Into<String>, max_size: usize) -> Self {
        Self {
            name: name.into(),
            max_size,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a job. Fails with `QueueFull` at capacity.
    pub fn enqueue(&self, job: Job) -> crate::Result<()> {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        if inner.heap.len() >= self.max_size {
            return Err(crate::Error::queue_full(format!(
                "queue '{}' at capacity ({})",
                self.name, self.max_size
            )));
        }
        inner.enqueued += 1;
        inner.heap.push(Entry {
            priority: job.definition.priority,
            submitted_at: job.submitted_at,
            job,
        });
        Ok(())
    }

    /// Non-blocking pop of the highest-priority, oldest-submitted job.
    pub fn dequeue(&self) -> Option<Job> {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        let entry = inner.heap.pop()?;
        inner.dequeued += 1;
        Some(entry.job)
    }

    /// Pull a still-pending job out of the heap before a worker claims it,
    /// e.g. when a cancel request races a job that hasn't been dequeued yet.
    /// O(n) in queue depth; cancellation is rare enough not to warrant a
    /// more specialized structure.
    pub fn remove(&self, id: JobId) -> Option<Job> {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        let entries: Vec<Entry> = inner.heap.drain().collect();
        let mut found = None;
        for entry in entries {
            if found.is_none() && entry.job.id == id {
                found = Some(entry.job);
            } else {
                inner.heap.push(entry);
            }
        }
        found
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("queue mutex poisoned").heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.max_size
    }

    pub fn record_completed(&self) {
        self.inner.lock().expect("queue mutex poisoned").completed += 1;
    }

    pub fn record_failed(&self) {
        self.inner.lock().expect("queue mutex poisoned").failed += 1;
    }

    pub fn record_timed_out(&self) {
        self.inner.lock().expect("queue mutex poisoned").timed_out += 1;
    }

    pub fn record_retried(&self) {
        self.inner.lock().expect("queue mutex poisoned").retried += 1;
    }

    /// Snapshot of counters plus current depth, broken down by priority band.
    pub fn metrics(&self) -> QueueMetrics {
        let inner = self.inner.lock().expect("queue mutex poisoned");
        let mut depth_by_priority: HashMap<JobPriority, usize> = HashMap::new();
        for entry in inner.heap.iter() {
            *depth_by_priority.entry(entry.priority).or_insert(0) += 1;
        }
        QueueMetrics {
            name: self.name.clone(),
            current_size: inner.heap.len(),
            enqueued: inner.enqueued,
            dequeued: inner.dequeued,
            completed: inner.completed,
            failed: inner.failed,
            timed_out: inner.timed_out,
            retried: inner.retried,
            depth_by_priority,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub name: String,
    pub current_size: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub retried: u64,
    pub depth_by_priority: HashMap<JobPriority, usize>,
}

impl QueueMetrics {
    pub fn format(&self) -> String {
        format!(
            "queue '{}': size={} enqueued={} dequeued={} completed={} failed={} timed_out={} retried={}",
            self.name,
            self.current_size,
            self.enqueued,
            self.dequeued,
            self.completed,
            self.failed,
            self.timed_out,
            self.retried
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::JobDefinition;

    fn job(name: &str, priority: JobPriority) -> Job {
        Job::new(JobDefinition {
            name: name.to_string(),
            vm_path: "/vms/a".to_string(),
            output_path: "/out/a.ova".to_string(),
            provider: "local".to_string(),
            provider_options: serde_json::json!({}),
            priority,
            max_retries: 3,
            timeout_secs: 60,
            tags: vec![],
            schedule_id: None,
        })
    }

    #[test]
    fn priority_inversion_resistance() {
        let q = JobQueue::new("q", 10);
        q.enqueue(job("A", JobPriority::Low)).unwrap();
        q.enqueue(job("B", JobPriority::Low)).unwrap();
        q.enqueue(job("C", JobPriority::Critical)).unwrap();

        assert_eq!(q.dequeue().unwrap().definition.name, "C");
        assert_eq!(q.dequeue().unwrap().definition.name, "A");
        assert_eq!(q.dequeue().unwrap().definition.name, "B");
    }

    #[test]
    fn fifo_within_priority() {
        let q = JobQueue::new("q", 10);
        let mut a = job("A", JobPriority::Normal);
        let mut b = job("B", JobPriority::Normal);
        a.submitted_at = chrono::Utc::now();
        b.submitted_at = a.submitted_at + chrono::Duration::milliseconds(5);
        q.enqueue(a).unwrap();
        q.enqueue(b).unwrap();

        assert_eq!(q.dequeue().unwrap().definition.name, "A");
        assert_eq!(q.dequeue().unwrap().definition.name, "B");
    }

    #[test]
    fn enqueue_rejects_at_capacity() {
        let q = JobQueue::new("q", 1);
        q.enqueue(job("A", JobPriority::Normal)).unwrap();
        let err = q.enqueue(job("B", JobPriority::Normal)).unwrap_err();
        assert!(matches!(err, crate::Error::QueueFull(_)));
    }

    #[test]
    fn remove_pulls_pending_job_out_of_heap() {
        let q = JobQueue::new("q", 10);
        let a = job("A", JobPriority::Normal);
        let a_id = a.id;
        let b = job("B", JobPriority::Normal);
        q.enqueue(a).unwrap();
        q.enqueue(b).unwrap();

        let removed = q.remove(a_id).unwrap();
        assert_eq!(removed.id, a_id);
        assert_eq!(q.size(), 1);
        assert_eq!(q.dequeue().unwrap().definition.name, "B");
    }

    #[test]
    fn remove_missing_id_is_noop() {
        let q = JobQueue::new("q", 10);
        q.enqueue(job("A", JobPriority::Normal)).unwrap();
        assert!(q.remove(JobId::new_v4()).is_none());
        assert_eq!(q.size(), 1);
    }

    #[test]
    fn metrics_track_depth_by_priority() {
        let q = JobQueue::new("q", 10);
        q.enqueue(job("A", JobPriority::High)).unwrap();
        q.enqueue(job("B", JobPriority::Low)).unwrap();
        let m = q.metrics();
        assert_eq!(m.current_size, 2);
        assert_eq!(*m.depth_by_priority.get(&JobPriority::High).unwrap(), 1);
    }
}
