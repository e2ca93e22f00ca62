pub mod job;
pub mod thread_pool;
pub mod shutdown;
pub mod work_queue;
pub mod work_sharing;
pub mod work_stealing;
/// basic std::sync types reexported here so that we can hook loom into them for
/// testing.
pub mod sync;

use std::sync::Arc;

use crossbeam_utils::Backoff;

use sync::{thread, AtomicU64, Ordering};
use thread_pool::{ThreadPool, ThreadPoolBuilder};
use shutdown::{ExitGuard, Shutdown};
use work_queue::WorkQueue;
use crate::error::PoolError;

/// Data accessible by the pool and all of its workers from any thread.
pub(crate) struct Shared {
    /// Number of dedicated worker threads.
    pub num_workers: u32,
    /// Where jobs are submitted to and fetched from.
    pub queue: Arc<dyn WorkQueue>,
    /// state and logic to handle shutting down.
    pub shutdown: Shutdown,
    pub counters: Counters,
    // A few hooks to register work
    handlers: ThreadPoolHooks,
}

pub(crate) fn init(params: ThreadPoolBuilder) -> Result<ThreadPool, PoolError> {
    let num_threads = params.num_threads;
    if num_threads == 0 {
        return Err(PoolError::ZeroWorkers);
    }

    let queue = match params.work_queue {
        Some(queue) => queue,
        None => params.strategy.create_queue(num_threads as usize)?,
    };

    if queue.num_workers() < num_threads as usize {
        return Err(PoolError::QueueTooSmall {
            workers: num_threads as usize,
            queue: queue.num_workers(),
        });
    }

    let shared = Arc::new(Shared {
        num_workers: num_threads,
        queue,
        shutdown: Shutdown::new(num_threads),
        counters: Counters::default(),
        handlers: ThreadPoolHooks {
            start: params.start_handler,
            exit: params.exit_handler,
        },
    });

    let mut workers = Vec::with_capacity(num_threads as usize);
    for i in 0..num_threads {
        let worker = Worker {
            index: i,
            shared: Arc::clone(&shared),
        };

        let mut builder = thread::Builder::new()
            .name((params.name_handler)(i));

        if let Some(stack_size) = params.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let spawned = builder.spawn(move || {
            profiling::register_thread!("Worker");

            worker.run();
        });

        match spawned {
            Ok(handle) => workers.push(handle),
            Err(err) => {
                log::error!("failed to spawn worker #{}: {}", i, err);

                // The workers that never started won't report their exit.
                for _ in i..num_threads {
                    shared.shutdown.worker_has_shut_down();
                }

                ThreadPool::from_parts(shared, workers).shutdown();

                return Err(PoolError::Spawn(err));
            }
        }
    }

    log::debug!("spawned {} workers", num_threads);

    Ok(ThreadPool::from_parts(shared, workers))
}

/// Counters shared by all workers. Only used for reporting, so relaxed
/// ordering is enough.
#[derive(Default)]
pub(crate) struct Counters {
    jobs_executed: AtomicU64,
    jobs_requeued: AtomicU64,
    jobs_discarded: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Stats {
        Stats {
            jobs_executed: self.jobs_executed.load(Ordering::Relaxed),
            jobs_requeued: self.jobs_requeued.load(Ordering::Relaxed),
            jobs_discarded: self.jobs_discarded.load(Ordering::Relaxed),
        }
    }
}

// Some stats for debugging purposes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// number of jobs executed by workers, including the ones that turned
    /// into a fault.
    pub jobs_executed: u64,
    /// How many times a worker popped a continuation whose parent was not
    /// done yet and had to put it back.
    pub jobs_requeued: u64,
    /// Number of popped jobs that were already cancelled or being cancelled.
    pub jobs_discarded: u64,
}

struct Worker {
    index: u32,
    shared: Arc<Shared>,
}

impl Worker {
    fn run(self) {
        let shared = &*self.shared;
        let _exit = ExitGuard { shutdown: &shared.shutdown };

        if let Some(handler) = &shared.handlers.start {
            handler.run(self.index);
        }

        log::debug!("worker #{} started", self.index);

        let queue = &shared.queue;
        let worker_idx = self.index as usize;
        let backoff = Backoff::new();

        while !shared.shutdown.is_shutting_down() {
            match queue.pop(worker_idx) {
                // Cancelled (or being cancelled) while it was sitting in the
                // queue.
                Some(job) if job.is_claimed() => {
                    Counters::bump(&shared.counters.jobs_discarded);
                    backoff.reset();
                }
                Some(job) if job.can_execute() => {
                    if job.execute() {
                        Counters::bump(&shared.counters.jobs_executed);
                    }
                    backoff.reset();
                }
                Some(job) => {
                    // The parent isn't done yet, put the continuation back
                    // and give other threads a chance to make progress.
                    log::trace!("worker #{} re-enqueues a pending continuation", self.index);
                    Counters::bump(&shared.counters.jobs_requeued);
                    queue.enqueue(job);
                    thread::yield_now();
                }
                None => {
                    // Spins a little, then yields. Never blocks, so the
                    // shutdown flag is observed promptly.
                    backoff.snooze();
                }
            }
        }

        // Shutdown phase.

        if let Some(handler) = &shared.handlers.exit {
            handler.run(self.index);
        }

        log::debug!("worker #{} exits", self.index);
    }
}

pub(crate) struct ThreadPoolHooks {
    start: Option<Box<dyn WorkerHook>>,
    exit: Option<Box<dyn WorkerHook>>,
}

pub trait WorkerHook: Send + Sync {
    fn run(&self, worker_id: u32);
}

impl<F> WorkerHook for F where F: Fn(u32) + Send + Sync + 'static {
    fn run(&self, worker_id: u32) { self(worker_id) }
}
