/// Shutdown
///
/// Workers check whether the pool is shutting down by reading an atomic that
/// is set once, by the first caller to win the compare-and-swap. A simple
/// mutex/condvar pair tracks the number of workers still running so that
/// every caller of `ThreadPool::shutdown`, not only the first one, can wait
/// for them to exit.

use crate::core::sync::{unpoison, AtomicBool, Condvar, Mutex, Ordering};

pub(crate) struct Shutdown {
    is_shutting_down: AtomicBool,
    running_workers: Mutex<u32>,
    shutdown_cond: Condvar,
}

impl Shutdown {
    pub fn new(num_threads: u32) -> Self {
        Shutdown {
            is_shutting_down: AtomicBool::new(false),
            running_workers: Mutex::new(num_threads),
            shutdown_cond: Condvar::new(),
        }
    }

    /// Returns true for the one caller that starts the shutdown.
    pub fn begin_shut_down(&self) -> bool {
        self.is_shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Block until every worker has exited.
    pub fn wait_shutdown(&self) {
        let mut running = unpoison(self.running_workers.lock());
        while *running > 0 {
            running = unpoison(self.shutdown_cond.wait(running));
        }
    }

    pub fn running_workers(&self) -> u32 {
        *unpoison(self.running_workers.lock())
    }

    pub fn worker_has_shut_down(&self) {
        let mut running = unpoison(self.running_workers.lock());
        *running -= 1;
        self.shutdown_cond.notify_all();
    }
}

/// Decrements the running worker count when a worker thread exits, even if
/// it unwinds out of a user hook.
pub(crate) struct ExitGuard<'l> {
    pub shutdown: &'l Shutdown,
}

impl<'l> Drop for ExitGuard<'l> {
    fn drop(&mut self) {
        self.shutdown.worker_has_shut_down();
    }
}

#[test]
fn test_shutdown() {
    use std::sync::atomic::AtomicU32;
    use crate::{Strategy, ThreadPool};
    static INITIALIZED_WORKERS: AtomicU32 = AtomicU32::new(0);
    static SHUTDOWN_WORKERS: AtomicU32 = AtomicU32::new(0);

    for _ in 0..10 {
        for num_threads in 1..17 {
            INITIALIZED_WORKERS.store(0, Ordering::SeqCst);
            SHUTDOWN_WORKERS.store(0, Ordering::SeqCst);

            let pool = ThreadPool::builder()
                .with_worker_threads(num_threads)
                .with_strategy(if num_threads % 2 == 0 { Strategy::Sharing } else { Strategy::Stealing })
                .with_start_handler(|_id| { INITIALIZED_WORKERS.fetch_add(1, Ordering::SeqCst); })
                .with_exit_handler(|_id| { SHUTDOWN_WORKERS.fetch_add(1, Ordering::SeqCst); })
                .build()
                .unwrap();

            pool.shutdown();

            assert_eq!(INITIALIZED_WORKERS.load(Ordering::SeqCst), num_threads);
            assert_eq!(SHUTDOWN_WORKERS.load(Ordering::SeqCst), num_threads);
        }
    }
}
