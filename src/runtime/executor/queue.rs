//! Job queues for executors
//!
//! Multi-producer, multi-consumer job queues with priority bands.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::runtime::job::{JobPriority, JobRef};

/// A thread-safe FIFO job queue.
#[derive(Debug, Default)]
pub struct JobQueue {
    inner: Mutex<VecDeque<JobRef>>,
}

impl JobQueue {
    /// Create a new empty job queue.
    #[inline]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Push a job to the back of the queue.
    #[inline]
    pub fn push(
        &self,
        job: JobRef,
    ) {
        self.inner.lock().push_back(job);
    }

    /// Pop a job from the front of the queue.
    #[inline]
    pub fn pop_front(&self) -> Option<JobRef> {
        self.inner.lock().pop_front()
    }

    /// Pop a job from the back of the queue (for work stealing).
    #[inline]
    pub fn pop_back(&self) -> Option<JobRef> {
        self.inner.lock().pop_back()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Remove every queued job.
    pub fn drain(&self) -> Vec<JobRef> {
        self.inner.lock().drain(..).collect()
    }
}

/// Priority-aware job queue.
///
/// Jobs are popped from the most urgent non-empty band first, FIFO within a
/// band. Stealing takes from the least urgent band first.
#[derive(Debug, Default)]
pub struct PriorityJobQueue {
    /// UserInteractive and UserInitiated
    high: JobQueue,
    /// Default and Unspecified
    normal: JobQueue,
    /// Utility and Background
    low: JobQueue,
}

impl PriorityJobQueue {
    /// Create a new priority job queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn band(
        &self,
        priority: JobPriority,
    ) -> &JobQueue {
        match priority {
            JobPriority::UserInteractive | JobPriority::UserInitiated => &self.high,
            JobPriority::Default | JobPriority::Unspecified => &self.normal,
            JobPriority::Utility | JobPriority::Background => &self.low,
        }
    }

    /// Push a job into the band for its priority.
    pub fn push(
        &self,
        job: JobRef,
    ) {
        self.band(job.priority()).push(job);
    }

    /// Pop the most urgent job available.
    pub fn pop(&self) -> Option<JobRef> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    /// Pop from the back, least urgent first (for work stealing).
    pub fn pop_back(&self) -> Option<JobRef> {
        self.low
            .pop_back()
            .or_else(|| self.normal.pop_back())
            .or_else(|| self.high.pop_back())
    }

    /// Get total number of jobs.
    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty() && self.low.is_empty()
    }

    /// Remove every queued job, most urgent first.
    pub fn drain(&self) -> Vec<JobRef> {
        let mut jobs = self.high.drain();
        jobs.extend(self.normal.drain());
        jobs.extend(self.low.drain());
        jobs
    }
}
