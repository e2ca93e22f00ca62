use std::collections::VecDeque;

use crossbeam_utils::CachePadded;

use super::job::JobRef;
use super::sync::{unpoison, AtomicBool, AtomicUsize, Mutex, Ordering};
use super::work_queue::WorkQueue;
use crate::error::{PoolError, TaskError};

/// Each worker owns a local deque and steals from the others when it runs dry.
///
/// Submitted jobs are dealt round-robin to the deques, regardless of load.
/// A worker pops from the front of its own deque, so work assigned to it is
/// processed in order. Thieves take from the back of the first non-empty
/// deque after their own, which keeps them away from the owner's end.
///
/// Each deque has its own lock. The closed flag is checked under the lock of
/// the deque a job is about to be pushed to, and shutdown drains every deque
/// under its lock after raising the flag, so every job either gets drained or
/// sees the flag.
pub struct WorkStealingQueue {
    deques: Vec<CachePadded<Mutex<VecDeque<JobRef>>>>,
    next_worker: AtomicUsize,
    closed: AtomicBool,
}

impl WorkStealingQueue {
    pub fn new(num_workers: usize) -> Result<Self, PoolError> {
        if num_workers == 0 {
            return Err(PoolError::ZeroWorkers);
        }

        let deques = (0..num_workers)
            .map(|_| CachePadded::new(Mutex::new(VecDeque::new())))
            .collect();

        Ok(WorkStealingQueue {
            deques,
            next_worker: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn next_worker(&self) -> usize {
        self.next_worker.fetch_add(1, Ordering::Relaxed) % self.deques.len()
    }

    fn steal(&self, thief: usize) -> Option<JobRef> {
        profiling::scope!("steal");

        let num_workers = self.deques.len();
        for i in 1..num_workers {
            let victim = (thief + i) % num_workers;
            if let Some(job) = unpoison(self.deques[victim].lock()).pop_back() {
                return Some(job);
            }
        }

        None
    }
}

impl WorkQueue for WorkStealingQueue {
    fn pop(&self, worker_idx: usize) -> Option<JobRef> {
        debug_assert!(worker_idx < self.deques.len());
        profiling::scope!("pop (stealing)");

        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        if let Some(job) = unpoison(self.deques[worker_idx].lock()).pop_front() {
            return Some(job);
        }

        self.steal(worker_idx)
    }

    fn enqueue(&self, job: JobRef) {
        profiling::scope!("enqueue (stealing)");

        let idx = self.next_worker();
        {
            let mut deque = unpoison(self.deques[idx].lock());
            if !self.closed.load(Ordering::SeqCst) {
                deque.push_back(job);
                return;
            }
        }

        job.abort(TaskError::Shutdown);
    }

    fn shutdown(&self) {
        profiling::scope!("shutdown (stealing)");

        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut drained = Vec::new();
        for deque in &self.deques {
            drained.extend(unpoison(deque.lock()).drain(..));
        }

        for job in &drained {
            job.abort(TaskError::Shutdown);
        }

        log::debug!("work stealing queue shut down, {} queued jobs aborted", drained.len());
    }

    fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn num_workers(&self) -> usize {
        self.deques.len()
    }
}

#[cfg(test)]
fn make_jobs(queue: &std::sync::Arc<dyn WorkQueue>, n: usize) -> Vec<JobRef> {
    use crate::core::job::{executable, Job};

    (0..n).map(|_| Job::new(executable(|| Ok(())), None, queue.clone())).collect()
}

#[cfg(not(loom))]
#[test]
fn test_round_robin_and_local_fifo() {
    use std::sync::Arc;

    let queue: Arc<dyn WorkQueue> = Arc::new(WorkStealingQueue::new(3).unwrap());
    let jobs = make_jobs(&queue, 6);
    for job in &jobs {
        queue.enqueue(job.clone());
    }

    // Jobs 0 and 3 went to worker 0, in that order.
    assert!(Arc::ptr_eq(&queue.pop(0).unwrap(), &jobs[0]));
    assert!(Arc::ptr_eq(&queue.pop(0).unwrap(), &jobs[3]));
    // Worker 1's deque holds 1 and 4.
    assert!(Arc::ptr_eq(&queue.pop(1).unwrap(), &jobs[1]));
    // Worker 0 is empty now: it steals from the back of worker 1.
    assert!(Arc::ptr_eq(&queue.pop(0).unwrap(), &jobs[4]));
    // Then from the back of worker 2, the next non-empty deque.
    assert!(Arc::ptr_eq(&queue.pop(0).unwrap(), &jobs[5]));
    assert!(Arc::ptr_eq(&queue.pop(1).unwrap(), &jobs[2]));

    for worker in 0..3 {
        assert!(queue.pop(worker).is_none());
    }
}

#[cfg(not(loom))]
#[test]
fn test_steal_scan_order() {
    use std::sync::Arc;

    let queue: Arc<dyn WorkQueue> = Arc::new(WorkStealingQueue::new(4).unwrap());
    let jobs = make_jobs(&queue, 4);
    for job in &jobs {
        queue.enqueue(job.clone());
    }

    // Drain worker 3's own deque, then it scans 0, 1, 2.
    assert!(Arc::ptr_eq(&queue.pop(3).unwrap(), &jobs[3]));
    assert!(Arc::ptr_eq(&queue.pop(3).unwrap(), &jobs[0]));
    assert!(Arc::ptr_eq(&queue.pop(3).unwrap(), &jobs[1]));
    assert!(Arc::ptr_eq(&queue.pop(3).unwrap(), &jobs[2]));
    assert!(queue.pop(3).is_none());
}

#[cfg(not(loom))]
#[test]
fn test_stealing_shutdown() {
    use std::sync::Arc;

    assert!(matches!(WorkStealingQueue::new(0), Err(PoolError::ZeroWorkers)));

    let queue: Arc<dyn WorkQueue> = Arc::new(WorkStealingQueue::new(2).unwrap());
    let jobs = make_jobs(&queue, 5);
    for job in &jobs {
        queue.enqueue(job.clone());
    }

    queue.shutdown();
    queue.shutdown();
    assert!(queue.is_shut_down());
    assert!(queue.pop(0).is_none());
    assert!(queue.pop(1).is_none());

    for job in &jobs {
        assert!(job.is_aborted());
        assert!(matches!(job.fault(), Some(TaskError::Shutdown)));
    }

    let late = make_jobs(&queue, 1).pop().unwrap();
    queue.enqueue(late.clone());
    assert!(late.is_aborted());
}

#[cfg(not(loom))]
#[test]
fn test_concurrent_exactly_once() {
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use crate::core::job::{executable, Job};

    const WORKERS: usize = 4;
    const JOBS_PER_PRODUCER: usize = 500;

    let queue: Arc<dyn WorkQueue> = Arc::new(WorkStealingQueue::new(WORKERS).unwrap());
    let counters: Arc<Vec<AtomicU32>> = Arc::new((0..2 * JOBS_PER_PRODUCER).map(|_| AtomicU32::new(0)).collect());
    let done = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..2).map(|p| {
        let queue = queue.clone();
        let counters = counters.clone();
        std::thread::spawn(move || {
            for i in 0..JOBS_PER_PRODUCER {
                let idx = p * JOBS_PER_PRODUCER + i;
                let counters = counters.clone();
                let job = Job::new(
                    executable(move || { counters[idx].fetch_add(1, Ordering::SeqCst); Ok(()) }),
                    None,
                    queue.clone(),
                );
                queue.enqueue(job);
            }
        })
    }).collect();

    let consumers: Vec<_> = (0..WORKERS).map(|worker| {
        let queue = queue.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            while done.load(Ordering::SeqCst) < 2 * JOBS_PER_PRODUCER {
                match queue.pop(worker) {
                    Some(job) => {
                        assert!(job.execute());
                        done.fetch_add(1, Ordering::SeqCst);
                    }
                    None => std::thread::yield_now(),
                }
            }
        })
    }).collect();

    for handle in producers.into_iter().chain(consumers) {
        handle.join().unwrap();
    }

    for counter in counters.iter() {
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
