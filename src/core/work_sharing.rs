use crossbeam_deque::{Injector, Steal};

use super::job::JobRef;
use super::sync::{unpoison, RwLock};
use super::work_queue::WorkQueue;
use crate::error::{PoolError, TaskError};

/// All workers draw from one global FIFO.
///
/// Jobs are popped in strict submission order regardless of which worker asks.
/// The injector itself is lock-free, but a lock guards the open/closed state:
/// submitting and popping take it shared, shutting down takes it exclusively,
/// so no job can slip into the queue after the shutdown drain.
pub struct WorkSharingQueue {
    jobs: Injector<JobRef>,
    closed: RwLock<bool>,
    num_workers: usize,
}

impl WorkSharingQueue {
    pub fn new(num_workers: usize) -> Result<Self, PoolError> {
        if num_workers == 0 {
            return Err(PoolError::ZeroWorkers);
        }

        Ok(WorkSharingQueue {
            jobs: Injector::new(),
            closed: RwLock::new(false),
            num_workers,
        })
    }

    fn steal(&self) -> Option<JobRef> {
        loop {
            match self.jobs.steal() {
                Steal::Success(job) => return Some(job),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }
}

impl WorkQueue for WorkSharingQueue {
    fn pop(&self, worker_idx: usize) -> Option<JobRef> {
        debug_assert!(worker_idx < self.num_workers);
        profiling::scope!("pop (sharing)");

        let closed = unpoison(self.closed.read());
        if *closed {
            return None;
        }

        self.steal()
    }

    fn enqueue(&self, job: JobRef) {
        profiling::scope!("enqueue (sharing)");

        {
            let closed = unpoison(self.closed.read());
            if !*closed {
                self.jobs.push(job);
                return;
            }
        }

        job.abort(TaskError::Shutdown);
    }

    fn shutdown(&self) {
        profiling::scope!("shutdown (sharing)");

        let mut drained = Vec::new();
        {
            let mut closed = unpoison(self.closed.write());
            if *closed {
                return;
            }
            *closed = true;

            while let Some(job) = self.steal() {
                drained.push(job);
            }
        }

        // Dropping the aborted closures may run arbitrary destructors, keep
        // that out of the lock.
        for job in &drained {
            job.abort(TaskError::Shutdown);
        }

        log::debug!("work sharing queue shut down, {} queued jobs aborted", drained.len());
    }

    fn is_shut_down(&self) -> bool {
        *unpoison(self.closed.read())
    }

    fn num_workers(&self) -> usize {
        self.num_workers
    }
}

#[cfg(not(loom))]
#[test]
fn test_sharing_fifo() {
    use std::sync::Arc;
    use crate::core::job::{executable, Job};

    let queue: Arc<dyn WorkQueue> = Arc::new(WorkSharingQueue::new(4).unwrap());
    let jobs: Vec<JobRef> = (0..10)
        .map(|_| Job::new(executable(|| Ok(())), None, queue.clone()))
        .collect();

    for job in &jobs {
        queue.enqueue(job.clone());
    }

    // Any worker gets the oldest job.
    for (i, expected) in jobs.iter().enumerate() {
        let popped = queue.pop(i % 4).unwrap();
        assert!(Arc::ptr_eq(&popped, expected));
    }

    assert!(queue.pop(0).is_none());
    assert!(queue.pop(3).is_none());
}

#[cfg(not(loom))]
#[test]
fn test_sharing_shutdown() {
    use std::sync::Arc;
    use crate::core::job::{executable, Job};

    assert!(matches!(WorkSharingQueue::new(0), Err(PoolError::ZeroWorkers)));

    let queue: Arc<dyn WorkQueue> = Arc::new(WorkSharingQueue::new(2).unwrap());
    let queued = Job::new(executable(|| Ok(())), None, queue.clone());
    queue.enqueue(queued.clone());

    queue.shutdown();
    queue.shutdown();
    assert!(queue.is_shut_down());
    assert!(queued.is_aborted());
    assert!(matches!(queued.fault(), Some(TaskError::Shutdown)));
    assert!(queue.pop(0).is_none());

    let late = Job::new(executable(|| Ok(())), None, queue.clone());
    queue.enqueue(late.clone());
    assert!(late.is_executed());
    assert!(late.is_aborted());
    assert!(queue.pop(1).is_none());
}
