//! Per-worker batch accumulator.

use super::job::Job;
use super::record::Record;
use crate::error::RecordError;

/// Ordered buffer of jobs owned by a single worker.
#[derive(Debug)]
pub struct BatchAccumulator {
    jobs: Vec<Job>,
    capacity: usize,
}

impl BatchAccumulator {
    /// Create an accumulator that is full at `capacity` jobs (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            jobs: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a job. Returns `true` when the buffer has reached capacity
    /// and must be flushed before anything else is appended.
    pub fn push(&mut self, job: Job) -> bool {
        self.jobs.push(job);
        self.is_full()
    }

    /// Whether the buffer has reached capacity.
    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take every buffered job, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<Job> {
        std::mem::replace(&mut self.jobs, Vec::with_capacity(self.capacity))
    }
}

/// Convert a batch of jobs into records, failing as a whole on the first
/// message that cannot be converted.
pub fn to_records(jobs: &[Job]) -> Result<Vec<Record>, RecordError> {
    jobs.iter().map(Job::to_record).collect()
}
