//! Job 单元测试

use super::*;

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::runtime::executor::ManualExecutor;
use crate::runtime::task::TaskBuilder;

#[cfg(test)]
mod flags_tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    const PRIORITIES: [JobPriority; 6] = [
        JobPriority::Unspecified,
        JobPriority::Background,
        JobPriority::Utility,
        JobPriority::Default,
        JobPriority::UserInitiated,
        JobPriority::UserInteractive,
    ];

    #[test]
    fn test_flag_bit_positions() {
        let flags = JobFlags::task(JobPriority::Default)
            .with_child_task(true)
            .with_future(true)
            .with_group_child_task(true);
        assert_eq!(flags.bits(), 0x15 << 8 | 1 << 24 | 1 << 25 | 1 << 26);
        assert!(flags.is_async_task());

        let simple = JobFlags::new(JobKind::Simple, JobPriority::Background);
        assert_eq!(simple.bits(), 1 | 0x09 << 8);
        assert!(!simple.is_async_task());
    }

    #[test]
    fn test_priority_order() {
        assert!(JobPriority::Background < JobPriority::Utility);
        assert!(JobPriority::Utility < JobPriority::Default);
        assert!(JobPriority::UserInitiated < JobPriority::UserInteractive);
        assert_eq!(JobPriority::default(), JobPriority::Default);
        assert_eq!(JobPriority::from_u8(0x42), JobPriority::Unspecified);
    }

    #[quickcheck]
    fn quickcheck_flags_fields_independent(
        priority: u8,
        child: bool,
        future: bool,
        group: bool,
    ) -> bool {
        let priority = PRIORITIES[priority as usize % PRIORITIES.len()];
        let flags = JobFlags::task(priority)
            .with_child_task(child)
            .with_future(future)
            .with_group_child_task(group);

        let rebuilt = JobFlags::from_bits(flags.bits());
        rebuilt == flags
            && flags.kind() == JobKind::Task
            && flags.priority() == priority
            && flags.task_is_child_task() == child
            && flags.task_is_future() == future
            && flags.task_is_group_child_task() == group
    }

    #[quickcheck]
    fn quickcheck_clearing_a_flag_keeps_the_rest(
        child: bool,
        future: bool,
    ) -> bool {
        let flags = JobFlags::task(JobPriority::Utility)
            .with_child_task(child)
            .with_future(future)
            .with_group_child_task(true)
            .with_group_child_task(false);
        flags.task_is_child_task() == child
            && flags.task_is_future() == future
            && !flags.task_is_group_child_task()
            && flags.priority() == JobPriority::Utility
    }
}

#[cfg(test)]
mod job_tests {
    use super::*;

    fn noop_job(
        _job: JobRef,
        _executor: ExecutorRef,
    ) {
    }

    #[test]
    fn test_job_is_four_words() {
        assert_eq!(mem::size_of::<Job>(), 4 * mem::size_of::<usize>());
        assert_eq!(mem::align_of::<Job>(), 2 * mem::size_of::<usize>());
    }

    #[test]
    #[should_panic(expected = "wrong constructor for a task")]
    fn test_simple_constructor_rejects_task_flags() {
        let _ = Job::new_simple(JobFlags::task(JobPriority::Default), noop_job);
    }

    #[test]
    fn test_scheduler_private_words_start_empty() {
        let job = Job::new_simple(JobFlags::default(), noop_job);
        assert!(job.next_waiting_task().is_null());
        assert!(job.scheduler_private()[1].load(Ordering::Relaxed).is_null());
    }

    #[test]
    fn test_closure_job_runs_once_on_its_executor() {
        let executor = ManualExecutor::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(parking_lot::Mutex::new(None));

        let job = {
            let runs = runs.clone();
            let seen = seen.clone();
            JobRef::from_closure(JobPriority::Utility, move |running_on| {
                runs.fetch_add(1, Ordering::SeqCst);
                *seen.lock() = Some((running_on, current::executor(), current::task().is_none()));
            })
        };
        assert_eq!(job.flags().kind(), JobKind::Closure);
        assert_eq!(job.priority(), JobPriority::Utility);
        assert!(job.as_task().is_none());

        executor.executor_ref().enqueue(job);
        assert_eq!(executor.run_until_idle(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let (running_on, current_executor, no_task) = seen.lock().take().unwrap();
        assert!(running_on == executor.executor_ref());
        assert!(current_executor == executor.executor_ref());
        assert!(no_task);
        assert!(current::executor().is_generic());
    }

    #[test]
    fn test_dropping_unrun_closure_frees_it() {
        let captured = Arc::new(());
        let job = {
            let captured = captured.clone();
            JobRef::from_closure(JobPriority::Default, move |_| drop(captured))
        };
        assert_eq!(Arc::strong_count(&captured), 2);
        drop(job);
        assert_eq!(Arc::strong_count(&captured), 1);
    }

    #[test]
    fn test_task_job_round_trip_keeps_reference() {
        let task = TaskBuilder::new().spawn_closure(|_| Ok(1u8)).unwrap();
        assert_eq!(task.ref_count(), 1);

        let job = task.clone().into_job();
        assert_eq!(task.ref_count(), 2);
        assert!(job.is_async_task());
        assert!(job.as_task().is_some_and(|t| std::ptr::eq(t, &*task)));

        let back = job.into_task().unwrap();
        assert!(TaskRef::ptr_eq(&back, &task));
        assert_eq!(task.ref_count(), 2);
        drop(back);
        assert_eq!(task.ref_count(), 1);
    }

    #[test]
    fn test_task_job_sets_current_task() {
        let executor = ManualExecutor::new();
        let task = TaskBuilder::new()
            .spawn_closure(|me| {
                let current = current::task().expect("current task");
                Ok(TaskRef::ptr_eq(&current, me))
            })
            .unwrap();

        executor.executor_ref().enqueue(task.clone().into_job());
        executor.run_until_idle();
        assert!(matches!(task.future_outcome::<bool>(), Some(Ok(&true))));
        assert!(current::task().is_none());
    }
}
