//! Jobs: the minimal schedulable unit.
//!
//! A [`Job`] is four machine words: two words reserved for whoever currently
//! holds the job (schedulers, future wait queues), a flags word, and a
//! function pointer that is either a plain invoke function or, for async
//! tasks, a task resume function. Executors only ever see [`JobRef`]s.

pub mod flags;

pub use flags::{JobFlags, JobKind, JobPriority};

use std::cell::UnsafeCell;
use std::fmt;
use std::mem;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use tracing::warn;

use crate::runtime::context::ContextRef;
use crate::runtime::current;
use crate::runtime::executor::ExecutorRef;
use crate::runtime::task::{AsyncTask, TaskRef};

/// Function run by a plain job.
pub type JobInvokeFunction = fn(JobRef, ExecutorRef);

/// Function that resumes an async task at its current resume point.
pub type TaskContinuationFunction = fn(TaskRef, ExecutorRef, Option<ContextRef>);

/// Scheduler-private slot that links tasks waiting on the same future.
pub(crate) const NEXT_WAITING_TASK_INDEX: usize = 0;

#[derive(Clone, Copy)]
#[repr(C)]
union JobFunction {
    run_job: JobInvokeFunction,
    resume_task: TaskContinuationFunction,
}

/// A schedulable unit of work.
#[repr(C)]
#[cfg_attr(target_pointer_width = "64", repr(align(16)))]
#[cfg_attr(target_pointer_width = "32", repr(align(8)))]
pub struct Job {
    scheduler_private: [AtomicPtr<()>; 2],
    flags: JobFlags,
    run: UnsafeCell<JobFunction>,
}

const WORD: usize = mem::size_of::<usize>();
const _: () = assert!(mem::size_of::<Job>() == 4 * WORD, "Job must be four words");
const _: () = assert!(mem::align_of::<Job>() == 2 * WORD, "Job must be two-word aligned");

// The job function is only written by the job's owner while nobody else can
// run it, and handing the job to another thread goes through a queue or a
// release CAS.
unsafe impl Send for Job {}
unsafe impl Sync for Job {}

impl Job {
    /// A plain job that runs `run` when scheduled.
    pub fn new_simple(
        flags: JobFlags,
        run: JobInvokeFunction,
    ) -> Self {
        assert!(
            !flags.is_async_task(),
            "wrong constructor for a task: use Job::new_task"
        );
        Self {
            scheduler_private: [AtomicPtr::new(ptr::null_mut()), AtomicPtr::new(ptr::null_mut())],
            flags,
            run: UnsafeCell::new(JobFunction { run_job: run }),
        }
    }

    /// The job header of an async task, resuming at `resume`.
    pub fn new_task(
        flags: JobFlags,
        resume: TaskContinuationFunction,
    ) -> Self {
        assert!(
            flags.is_async_task(),
            "wrong constructor for a plain job: use Job::new_simple"
        );
        Self {
            scheduler_private: [AtomicPtr::new(ptr::null_mut()), AtomicPtr::new(ptr::null_mut())],
            flags,
            run: UnsafeCell::new(JobFunction {
                resume_task: resume,
            }),
        }
    }

    #[inline]
    pub fn flags(&self) -> JobFlags {
        self.flags
    }

    #[inline]
    pub fn is_async_task(&self) -> bool {
        self.flags.is_async_task()
    }

    #[inline]
    pub fn priority(&self) -> JobPriority {
        self.flags.priority()
    }

    /// Words reserved for the current holder of the job.
    #[inline]
    pub fn scheduler_private(&self) -> &[AtomicPtr<()>; 2] {
        &self.scheduler_private
    }

    /// The plain invoke function.
    pub(crate) fn run_job_function(&self) -> JobInvokeFunction {
        assert!(!self.is_async_task(), "job is an async task");
        // Safety: the flag says the run_job member was initialised.
        unsafe { (*self.run.get()).run_job }
    }

    /// The task resume function.
    pub(crate) fn resume_task_function(&self) -> TaskContinuationFunction {
        assert!(self.is_async_task(), "job is not an async task");
        // Safety: the flag says the resume_task member was initialised.
        unsafe { (*self.run.get()).resume_task }
    }

    /// Install a new task resume function.
    ///
    /// # Safety
    ///
    /// The caller must be the only party able to run the job, and must
    /// publish the job to other threads only after this returns.
    pub(crate) unsafe fn set_resume_task_function(
        &self,
        resume: TaskContinuationFunction,
    ) {
        assert!(self.is_async_task(), "job is not an async task");
        unsafe {
            *self.run.get() = JobFunction {
                resume_task: resume,
            }
        };
    }

    #[inline]
    pub(crate) fn next_waiting_task(&self) -> *mut () {
        self.scheduler_private[NEXT_WAITING_TASK_INDEX].load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_next_waiting_task(
        &self,
        next: *mut (),
    ) {
        self.scheduler_private[NEXT_WAITING_TASK_INDEX].store(next, Ordering::Relaxed);
    }
}

impl fmt::Debug for Job {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Job").field("flags", &self.flags).finish()
    }
}

/// Owning handle to a scheduled job.
///
/// A `JobRef` for an async task owns one reference on the task. A closure job
/// owns its allocation. A plain job made with [`Job::new_simple`] is owned by
/// whoever embedded it; its `JobRef` is a loan that must be run exactly once.
pub struct JobRef(NonNull<Job>);

unsafe impl Send for JobRef {}

impl JobRef {
    /// Wrap a raw job pointer.
    ///
    /// # Safety
    ///
    /// `job` must point to a live job. For a task the caller transfers one
    /// reference to the returned handle.
    pub unsafe fn from_raw(job: NonNull<Job>) -> Self {
        Self(job)
    }

    /// Give up the handle without running or releasing the job.
    pub fn into_raw(self) -> NonNull<Job> {
        let job = self.0;
        mem::forget(self);
        job
    }

    #[inline]
    pub fn as_ptr(&self) -> NonNull<Job> {
        self.0
    }

    /// A job that runs `body` once, on whatever thread the executor picks.
    pub fn from_closure<F>(
        priority: JobPriority,
        body: F,
    ) -> JobRef
    where
        F: FnOnce(ExecutorRef) + Send + 'static,
    {
        let closure = Box::new(ClosureJob {
            job: Job::new_simple(JobFlags::new(JobKind::Closure, priority), invoke_closure),
            body: Some(Box::new(body)),
        });
        let raw = NonNull::from(Box::leak(closure));
        JobRef(raw.cast())
    }

    /// The task this job belongs to, if it is one.
    pub fn as_task(&self) -> Option<&AsyncTask> {
        if self.is_async_task() {
            // Safety: task jobs are always embedded in an AsyncTask.
            Some(unsafe { AsyncTask::from_job(self.0).as_ref() })
        } else {
            None
        }
    }

    /// Convert into a task handle, keeping the reference this job owned.
    pub fn into_task(self) -> Result<TaskRef, JobRef> {
        if self.is_async_task() {
            let job = self.into_raw();
            // Safety: the reference owned by the job moves to the TaskRef.
            Ok(unsafe { TaskRef::from_raw(AsyncTask::from_job(job)) })
        } else {
            Err(self)
        }
    }

    /// Run the job on the calling thread as part of `executor`.
    ///
    /// Establishes the current task and executor for the duration of the
    /// call, then dispatches.
    pub fn run(
        self,
        executor: ExecutorRef,
    ) {
        let task = self.as_task().map(AsyncTask::retain);
        let _current = current::enter(task, executor.clone());
        self.run_in_fully_established_context(executor);
    }

    /// Dispatch to the task resume path or the plain invoke function.
    pub fn run_in_fully_established_context(
        self,
        executor: ExecutorRef,
    ) {
        match self.into_task() {
            Ok(task) => task.resume(executor),
            Err(job) => {
                let invoke = job.run_job_function();
                invoke(job, executor);
            }
        }
    }
}

impl Deref for JobRef {
    type Target = Job;

    fn deref(&self) -> &Job {
        // Safety: a JobRef always points to a live job.
        unsafe { self.0.as_ref() }
    }
}

impl Drop for JobRef {
    fn drop(&mut self) {
        match self.flags().kind() {
            JobKind::Task => {
                // Safety: a task JobRef owns one reference.
                drop(unsafe { TaskRef::from_raw(AsyncTask::from_job(self.0)) });
            }
            JobKind::Closure => {
                // Safety: closure jobs are boxed ClosureJobs with the Job first.
                drop(unsafe { Box::from_raw(self.0.cast::<ClosureJob>().as_ptr()) });
            }
            JobKind::Simple => {
                warn!("plain job {:p} dropped without running", self.0);
            }
        }
    }
}

impl fmt::Debug for JobRef {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_tuple("JobRef").field(&self.0).field(&self.flags()).finish()
    }
}

#[repr(C)]
struct ClosureJob {
    job: Job,
    body: Option<Box<dyn FnOnce(ExecutorRef) + Send>>,
}

fn invoke_closure(
    job: JobRef,
    executor: ExecutorRef,
) {
    let raw = job.into_raw().cast::<ClosureJob>();
    // Safety: invoke_closure is only installed by JobRef::from_closure.
    let mut closure = unsafe { Box::from_raw(raw.as_ptr()) };
    if let Some(body) = closure.body.take() {
        body(executor);
    }
}

#[cfg(test)]
mod tests;
