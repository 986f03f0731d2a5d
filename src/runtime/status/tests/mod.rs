//! Task status 单元测试

use super::*;

use std::sync::atomic::AtomicUsize;
use std::sync::Barrier;
use std::thread;

#[cfg(test)]
mod active_status_tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_default_is_empty() {
        let status = ActiveTaskStatus::default();
        assert_eq!(status.bits(), 0);
        assert!(!status.is_cancelled());
        assert!(!status.is_locked());
        assert!(status.innermost_record().is_none());
    }

    #[quickcheck]
    fn quickcheck_status_fields_independent(
        address: usize,
        cancelled: bool,
        locked: bool,
    ) -> bool {
        // Records are at least 8-byte aligned.
        let record = NonNull::new((address & !0x7) as *mut TaskStatusRecord);
        let status = ActiveTaskStatus::new(cancelled, locked, record);
        status.is_cancelled() == cancelled
            && status.is_locked() == locked
            && status.innermost_record() == record
            && status.with_cancelled().innermost_record() == record
            && status.with_locked(!locked).is_cancelled() == cancelled
    }
}

#[cfg(test)]
mod cancel_tests {
    use super::*;

    #[test]
    fn test_set_cancelled_reports_first_flip_only() {
        let status = AtomicTaskStatus::new();
        assert!(status.set_cancelled());
        assert!(!status.set_cancelled());
        assert!(status.load(Ordering::Acquire).is_cancelled());
    }

    #[test]
    fn test_concurrent_cancel_has_one_winner() {
        let status = Arc::new(AtomicTaskStatus::new());
        let barrier = Arc::new(Barrier::new(8));
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let status = status.clone();
                let barrier = barrier.clone();
                let winners = winners.clone();
                thread::spawn(move || {
                    barrier.wait();
                    if status.set_cancelled() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_while_locked_survives_unlock() {
        let status = AtomicTaskStatus::new();
        let record = TaskStatusRecord::private();
        {
            let mut guard = status.lock();
            assert!(guard.status().is_locked());
            assert!(status.set_cancelled());
            guard.push(record.clone());
            assert!(guard.is_cancelled());
        }
        let snapshot = status.load(Ordering::Acquire);
        assert!(snapshot.is_cancelled());
        assert!(!snapshot.is_locked());
        assert_eq!(
            snapshot.innermost_record(),
            Some(NonNull::from(&*record))
        );
    }
}

#[cfg(test)]
mod record_list_tests {
    use super::*;

    fn chain(status: &AtomicTaskStatus) -> Vec<*const TaskStatusRecord> {
        let guard = status.lock();
        guard
            .records()
            .map(|r| r as *const TaskStatusRecord)
            .collect()
    }

    #[test]
    fn test_push_and_pop_innermost() {
        let status = AtomicTaskStatus::new();
        let outer = TaskStatusRecord::private();
        let inner = TaskStatusRecord::private();

        {
            let mut guard = status.lock();
            guard.push(outer.clone());
            guard.push(inner.clone());
        }
        assert_eq!(chain(&status), vec![Arc::as_ptr(&inner), Arc::as_ptr(&outer)]);
        assert!(inner.is_linked());
        assert_eq!(Arc::strong_count(&inner), 2);

        let popped = status.lock().pop(&inner);
        assert!(Arc::ptr_eq(&popped, &inner));
        assert!(!inner.is_linked());
        drop(popped);
        assert_eq!(Arc::strong_count(&inner), 1);
        assert_eq!(chain(&status), vec![Arc::as_ptr(&outer)]);
    }

    #[test]
    #[should_panic(expected = "is not the innermost record")]
    fn test_pop_out_of_order_is_fatal() {
        let status = AtomicTaskStatus::new();
        let outer = TaskStatusRecord::private();
        let inner = TaskStatusRecord::private();
        let mut guard = status.lock();
        guard.push(outer.clone());
        guard.push(inner);
        guard.pop(&outer);
    }

    #[test]
    #[should_panic(expected = "already linked")]
    fn test_record_links_into_one_task() {
        let first = AtomicTaskStatus::new();
        let second = AtomicTaskStatus::new();
        let record = TaskStatusRecord::private();
        first.lock().push(record.clone());
        second.lock().push(record);
    }

    #[test]
    fn test_remove_splices_from_the_middle() {
        let status = AtomicTaskStatus::new();
        let records: Vec<_> = (0..3).map(|_| TaskStatusRecord::private()).collect();
        {
            let mut guard = status.lock();
            for record in &records {
                guard.push(record.clone());
            }
        }

        let removed = status.lock().remove(&records[1]);
        assert!(removed.is_some_and(|r| Arc::ptr_eq(&r, &records[1])));
        assert!(!records[1].is_linked());
        assert_eq!(
            chain(&status),
            vec![Arc::as_ptr(&records[2]), Arc::as_ptr(&records[0])]
        );

        // Not linked any more.
        assert!(status.lock().remove(&records[1]).is_none());

        let removed = status.lock().remove(&records[2]);
        assert!(removed.is_some());
        assert_eq!(chain(&status), vec![Arc::as_ptr(&records[0])]);
    }

    #[test]
    fn test_take_all_returns_innermost_first() {
        let status = AtomicTaskStatus::new();
        let records: Vec<_> = (0..5).map(|_| TaskStatusRecord::private()).collect();
        {
            let mut guard = status.lock();
            for record in &records {
                guard.push(record.clone());
            }
        }

        let taken = status.lock().take_all();
        let expected: Vec<_> = records.iter().rev().map(Arc::as_ptr).collect();
        let actual: Vec<_> = taken.iter().map(Arc::as_ptr).collect();
        assert_eq!(actual, expected);
        assert!(records.iter().all(|r| !r.is_linked()));
        assert!(status.load(Ordering::Acquire).innermost_record().is_none());

        drop(taken);
        assert!(records.iter().all(|r| Arc::strong_count(r) == 1));
    }

    #[test]
    fn test_dropping_status_releases_chain() {
        let record = TaskStatusRecord::private();
        {
            let status = AtomicTaskStatus::new();
            status.lock().push(record.clone());
            status.lock().push(TaskStatusRecord::private());
            assert_eq!(Arc::strong_count(&record), 2);
        }
        assert_eq!(Arc::strong_count(&record), 1);
    }

    #[test]
    fn test_concurrent_push_remove_with_cancel() {
        let status = Arc::new(AtomicTaskStatus::new());
        let barrier = Arc::new(Barrier::new(5));

        let mut handles: Vec<_> = (0..4)
            .map(|_| {
                let status = status.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..500 {
                        let record = TaskStatusRecord::private();
                        status.lock().push(record.clone());
                        let removed = status.lock().remove(&record);
                        assert!(removed.is_some());
                    }
                })
            })
            .collect();
        handles.push({
            let status = status.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                status.set_cancelled();
            })
        });
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = status.load(Ordering::Acquire);
        assert!(snapshot.is_cancelled());
        assert!(!snapshot.is_locked());
        assert!(snapshot.innermost_record().is_none());
    }
}

#[cfg(test)]
mod record_kind_tests {
    use super::*;

    #[test]
    fn test_children_accessor() {
        assert!(TaskStatusRecord::private().children().is_none());
        let notification = TaskStatusRecord::cancellation_notification(|| {});
        assert!(notification.children().is_none());
        assert!(matches!(
            notification.kind(),
            TaskStatusRecordKind::CancellationNotification(_)
        ));

        let group: Arc<dyn crate::runtime::group::TaskGroup> =
            crate::runtime::group::TaskGroupQueue::new();
        let record = TaskStatusRecord::task_group(group);
        assert!(record.children().is_some_and(ChildList::is_empty));
    }
}
