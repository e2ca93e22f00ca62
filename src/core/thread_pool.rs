use std::error::Error as StdError;
use std::sync::Arc;

use super::{Shared, Stats, WorkerHook};
use super::job::{executable, Executable, Job};
use super::sync::{thread, unpoison, Mutex};
use super::work_queue::WorkQueue;
use super::work_sharing::WorkSharingQueue;
use super::work_stealing::WorkStealingQueue;
use crate::error::{PoolError, TaskError};
use crate::slot::ResultSlot;
use crate::task::Task;

/// The built-in ways to distribute jobs to workers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// One global FIFO shared by all workers. See `WorkSharingQueue`.
    Sharing,
    /// A deque per worker with stealing. See `WorkStealingQueue`.
    #[default]
    Stealing,
}

impl Strategy {
    pub fn create_queue(self, num_workers: usize) -> Result<Arc<dyn WorkQueue>, PoolError> {
        let queue: Arc<dyn WorkQueue> = match self {
            Strategy::Sharing => Arc::new(WorkSharingQueue::new(num_workers)?),
            Strategy::Stealing => Arc::new(WorkStealingQueue::new(num_workers)?),
        };

        Ok(queue)
    }
}

/// A fixed set of worker threads executing the jobs of a work queue.
///
/// Dropping the pool shuts it down.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    worker_ids: Vec<thread::ThreadId>,
}

impl ThreadPool {
    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder {
            num_threads: std::thread::available_parallelism().map_or(4, |n| n.get() as u32),
            strategy: Strategy::default(),
            work_queue: None,
            start_handler: None,
            exit_handler: None,
            name_handler: Box::new(|idx| format!("Worker#{}", idx)),
            stack_size: None,
        }
    }

    /// Spawn `workers_count` workers pulling jobs from `work_queue`.
    pub fn new(workers_count: usize, work_queue: Arc<dyn WorkQueue>) -> Result<Self, PoolError> {
        ThreadPool::builder()
            .with_worker_threads(u32::try_from(workers_count).unwrap_or(u32::MAX))
            .with_work_queue(work_queue)
            .build()
    }

    pub(crate) fn from_parts(shared: Arc<Shared>, workers: Vec<thread::JoinHandle<()>>) -> Self {
        let worker_ids = workers.iter().map(|handle| handle.thread().id()).collect();

        ThreadPool {
            shared,
            workers: Mutex::new(workers),
            worker_ids,
        }
    }

    /// Submit a closure, returning a task for its result.
    ///
    /// After shutdown the returned task is already aborted and the closure
    /// never runs.
    pub fn enqueue<T, F>(&self, f: F) -> Task<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + Sync + 'static,
    {
        let output = Arc::new(ResultSlot::new());
        let slot = Arc::clone(&output);

        self.submit(output, executable(move || {
            slot.set(f());
            Ok(())
        }))
    }

    /// Like `enqueue`, but an `Err` returned by the closure becomes the
    /// task's fault.
    pub fn try_enqueue<T, E, F>(&self, f: F) -> Task<T>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + Sync + 'static,
        E: StdError + Send + Sync + 'static,
    {
        let output = Arc::new(ResultSlot::new());
        let slot = Arc::clone(&output);

        self.submit(output, executable(move || {
            slot.set(f().map_err(TaskError::failed)?);
            Ok(())
        }))
    }

    fn submit<T>(&self, output: Arc<ResultSlot<T>>, executable: Executable) -> Task<T> {
        profiling::scope!("submit");

        let job = Job::new(executable, None, Arc::clone(&self.shared.queue));
        self.shared.queue.enqueue(Arc::clone(&job));

        Task::new(job, output)
    }

    /// Close the queue, aborting the jobs still in it, and wait for the
    /// workers to exit.
    ///
    /// Jobs that are already executing run to completion. Safe to call
    /// several times and from several threads; every caller returns once all
    /// workers are gone. When called from one of the pool's own workers, it
    /// does not wait for that worker.
    pub fn shutdown(&self) {
        profiling::scope!("shutdown");

        let on_worker = self.is_worker_thread();

        if self.shared.shutdown.begin_shut_down() {
            log::debug!("shutting down a pool of {} workers", self.shared.num_workers);

            self.shared.queue.shutdown();

            let current = thread::current().id();
            let workers = std::mem::take(&mut *unpoison(self.workers.lock()));
            for handle in workers {
                if handle.thread().id() == current {
                    continue;
                }

                if handle.join().is_err() {
                    log::error!("a worker thread panicked");
                }
            }
        }

        if !on_worker {
            self.shared.shutdown.wait_shutdown();
            log::debug!("thread pool shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_shutting_down()
    }

    pub fn num_worker_threads(&self) -> u32 { self.shared.num_workers }

    /// Number of worker threads that have not exited yet.
    pub fn num_running_workers(&self) -> u32 { self.shared.shutdown.running_workers() }

    pub fn work_queue(&self) -> &Arc<dyn WorkQueue> {
        &self.shared.queue
    }

    pub fn stats(&self) -> Stats {
        self.shared.counters.snapshot()
    }

    /// Whether the current thread is one of this pool's workers.
    pub fn is_worker_thread(&self) -> bool {
        self.worker_ids.contains(&thread::current().id())
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct ThreadPoolBuilder {
    pub(crate) num_threads: u32,
    pub(crate) strategy: Strategy,
    pub(crate) work_queue: Option<Arc<dyn WorkQueue>>,
    pub(crate) start_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) exit_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) name_handler: Box<dyn Fn(u32) -> String>,
    pub(crate) stack_size: Option<usize>,
}

impl ThreadPoolBuilder {
    pub fn with_start_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.start_handler = Some(Box::new(handler));

        self
    }

    pub fn with_exit_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.exit_handler = Some(Box::new(handler));

        self
    }

    pub fn with_thread_names<F>(mut self, handler: F) -> Self
    where F: Fn(u32) -> String + 'static
    {
        self.name_handler = Box::new(handler);

        self
    }

    /// Zero is rejected by `build`.
    pub fn with_worker_threads(mut self, num_threads: u32) -> Self {
        self.num_threads = num_threads;

        self
    }

    /// Use one of the built-in queues, sized to the number of workers.
    /// Ignored if a queue is provided with `with_work_queue`.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;

        self
    }

    /// Use a custom queue. It must accept at least as many worker indices as
    /// the pool has workers.
    pub fn with_work_queue(mut self, queue: Arc<dyn WorkQueue>) -> Self {
        self.work_queue = Some(queue);

        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);

        self
    }

    pub fn build(self) -> Result<ThreadPool, PoolError> {
        crate::core::init(self)
    }
}

#[cfg(test)]
const N_WORKERS: u32 = 8;
#[cfg(test)]
const N_TASKS: usize = N_WORKERS as usize * 16;

#[cfg(test)]
fn make_pool(strategy: Strategy) -> ThreadPool {
    ThreadPool::builder()
        .with_worker_threads(N_WORKERS)
        .with_strategy(strategy)
        .build()
        .unwrap()
}

#[cfg(test)]
const STRATEGIES: [Strategy; 2] = [Strategy::Sharing, Strategy::Stealing];

#[test]
fn test_zero_workers() {
    for strategy in STRATEGIES {
        let res = ThreadPool::builder().with_worker_threads(0).with_strategy(strategy).build();
        assert!(matches!(res, Err(PoolError::ZeroWorkers)));
    }

    let queue: Arc<dyn WorkQueue> = Arc::new(WorkSharingQueue::new(4).unwrap());
    assert!(matches!(ThreadPool::new(0, queue.clone()), Err(PoolError::ZeroWorkers)));
    assert!(matches!(
        ThreadPool::new(5, queue),
        Err(PoolError::QueueTooSmall { workers: 5, queue: 4 })
    ));
}

#[test]
fn test_one_task() {
    for strategy in STRATEGIES {
        let pool = make_pool(strategy);

        let task = pool.enqueue(|| 1);
        task.wait();

        assert!(task.is_completed());
        assert_eq!(task.result().unwrap(), 1);
    }
}

#[test]
fn test_multiple_tasks() {
    for strategy in STRATEGIES {
        let pool = make_pool(strategy);

        let tasks: Vec<Task<usize>> = (0..N_TASKS).map(|i| pool.enqueue(move || i)).collect();

        for (i, task) in tasks.iter().enumerate() {
            task.wait();
            assert_eq!(task.result().unwrap(), i);
        }
    }
}

#[test]
fn test_threads_count() {
    use std::sync::{Condvar, Mutex};

    for strategy in STRATEGIES {
        let pool = make_pool(strategy);
        let rendezvous = Arc::new((Mutex::new(0u32), Condvar::new()));

        // Every task blocks until all of them are running, which only
        // completes if each one got its own worker.
        let tasks: Vec<Task<u32>> = (0..N_WORKERS).map(|_| {
            let rendezvous = rendezvous.clone();
            pool.enqueue(move || {
                let (count, cond) = &*rendezvous;
                let mut count = count.lock().unwrap();
                *count += 1;
                if *count == N_WORKERS {
                    cond.notify_all();
                }
                while *count != N_WORKERS {
                    count = cond.wait(count).unwrap();
                }

                0
            })
        }).collect();

        for task in &tasks {
            task.wait();
            assert_eq!(task.result().unwrap(), 0);
        }

        assert_eq!(*rendezvous.0.lock().unwrap(), N_WORKERS);
    }
}

#[test]
fn test_continue_with() {
    for strategy in STRATEGIES {
        let pool = make_pool(strategy);

        let tasks: Vec<Task<String>> = (0..N_TASKS as i32).map(|i| {
            pool.enqueue(move || i + 10).continue_with(|i| i.to_string())
        }).collect();

        for (i, task) in tasks.iter().enumerate() {
            task.wait();
            assert_eq!(task.result().unwrap(), (i + 10).to_string());
        }
    }
}

#[test]
fn test_continue_with_n() {
    for strategy in STRATEGIES {
        let pool = make_pool(strategy);

        let mut task = pool.enqueue(|| 0usize);
        for _ in 0..N_TASKS {
            task = task.continue_with(|value| value + 1);
        }

        task.wait();
        assert_eq!(task.result().unwrap(), N_TASKS);
    }
}

#[test]
fn test_shutdown_aborts_new_tasks() {
    use std::sync::atomic::{AtomicBool, Ordering};

    for strategy in STRATEGIES {
        let pool = make_pool(strategy);
        pool.shutdown();
        pool.shutdown();

        assert!(pool.is_shut_down());
        assert_eq!(pool.num_running_workers(), 0);

        let ran = Arc::new(AtomicBool::new(false));
        for _ in 0..N_TASKS {
            let ran = ran.clone();
            let task = pool.enqueue(move || { ran.store(true, Ordering::SeqCst); 0 });
            assert!(task.is_completed());
            assert!(task.is_aborted());
            assert!(matches!(task.result(), Err(TaskError::Shutdown)));
        }

        assert!(!ran.load(Ordering::SeqCst));
    }
}

#[test]
fn test_shutdown_lets_running_jobs_finish() {
    use std::sync::mpsc;

    for strategy in STRATEGIES {
        let pool = ThreadPool::builder()
            .with_worker_threads(1)
            .with_strategy(strategy)
            .build()
            .unwrap();

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let running = pool.enqueue(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            "finished"
        });
        // Only one worker, and it is busy: this one stays queued.
        let queued = pool.enqueue(|| "never");

        started_rx.recv().unwrap();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            release_tx.send(()).unwrap();
        });

        pool.shutdown();
        releaser.join().unwrap();

        assert_eq!(running.result().unwrap(), "finished");
        assert!(matches!(queued.result(), Err(TaskError::Shutdown)));
    }
}

#[test]
fn test_concurrent_shutdown() {
    for strategy in STRATEGIES {
        let pool = Arc::new(make_pool(strategy));
        let tasks: Vec<Task<usize>> = (0..N_TASKS).map(|i| pool.enqueue(move || i)).collect();

        let callers: Vec<_> = (0..4).map(|_| {
            let pool = pool.clone();
            std::thread::spawn(move || {
                pool.shutdown();
                assert_eq!(pool.num_running_workers(), 0);
            })
        }).collect();

        for caller in callers {
            caller.join().unwrap();
        }

        // Every task reached exactly one terminal state.
        for (i, task) in tasks.iter().enumerate() {
            assert!(task.is_completed());
            match task.result() {
                Ok(value) => assert_eq!(value, i),
                Err(err) => assert!(matches!(err, TaskError::Shutdown)),
            }
        }
    }
}

#[test]
fn test_shutdown_from_worker() {
    for strategy in STRATEGIES {
        let pool = Arc::new(make_pool(strategy));
        let p = pool.clone();
        let task = pool.enqueue(move || {
            assert!(p.is_worker_thread());
            p.shutdown();
            p.is_shut_down()
        });

        task.wait();
        assert!(task.result().unwrap());
        assert!(!pool.is_worker_thread());

        pool.shutdown();
        assert_eq!(pool.num_running_workers(), 0);
    }
}

#[test]
fn test_custom_queue_and_hooks() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    let names = Arc::new(StdMutex::new(Vec::new()));
    let started = Arc::new(AtomicU32::new(0));

    let n = names.clone();
    let s = started.clone();
    let queue: Arc<dyn WorkQueue> = Arc::new(WorkStealingQueue::new(6).unwrap());
    let pool = ThreadPool::builder()
        .with_worker_threads(3)
        .with_work_queue(queue.clone())
        .with_thread_names(|idx| format!("strand-test#{}", idx))
        .with_stack_size(256 * 1024)
        .with_start_handler(move |_| {
            n.lock().unwrap().push(std::thread::current().name().map(String::from));
            s.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    assert!(Arc::ptr_eq(pool.work_queue(), &queue));
    assert_eq!(pool.num_worker_threads(), 3);

    // Jobs dealt to deques 3..6 have no dedicated worker and get stolen.
    let tasks: Vec<Task<usize>> = (0..60).map(|i| pool.enqueue(move || i * 2)).collect();
    for (i, task) in tasks.iter().enumerate() {
        task.wait();
        assert_eq!(task.result().unwrap(), i * 2);
    }

    drop(pool);
    assert!(queue.is_shut_down());
    assert_eq!(started.load(Ordering::SeqCst), 3);

    let mut names = names.lock().unwrap().clone();
    names.sort();
    assert_eq!(names, vec![
        Some("strand-test#0".to_string()),
        Some("strand-test#1".to_string()),
        Some("strand-test#2".to_string()),
    ]);
}

#[test]
fn test_stats() {
    for strategy in STRATEGIES {
        let pool = make_pool(strategy);

        let mut task = pool.enqueue(|| 0u64);
        for _ in 0..32 {
            task = task.continue_with(|v| v + 1);
        }
        let others: Vec<Task<u64>> = (0..32).map(|i| pool.enqueue(move || i)).collect();

        task.wait();
        for other in &others {
            other.wait();
        }

        assert_eq!(task.result().unwrap(), 32);

        // Workers bump the counter after publishing completion.
        pool.shutdown();
        assert_eq!(pool.stats().jobs_executed, 1 + 32 + 32);
    }
}

#[test]
fn test_claimed_jobs_are_discarded() {
    use std::time::{Duration, Instant};

    for strategy in STRATEGIES {
        let pool = ThreadPool::builder().with_worker_threads(1).with_strategy(strategy).build().unwrap();

        // Claimed by a cancel that has not published the aborted state yet.
        let job = Job::new(executable(|| Ok(())), None, Arc::clone(pool.work_queue()));
        assert!(job.claim());
        assert!(!job.can_execute());
        pool.work_queue().enqueue(Arc::clone(&job));

        let deadline = Instant::now() + Duration::from_secs(10);
        while pool.stats().jobs_discarded == 0 {
            assert!(Instant::now() < deadline);
            thread::yield_now();
        }

        pool.shutdown();
        let stats = pool.stats();
        assert_eq!(stats.jobs_discarded, 1);
        assert_eq!(stats.jobs_requeued, 0);
        assert_eq!(stats.jobs_executed, 0);
    }
}
