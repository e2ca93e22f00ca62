//! Tasks are the user-facing handles to submitted work.
//!
//! A task pairs a job with the slot its output is written to. It can be
//! polled for completion, asked for its result (or the fault that prevented
//! it), and extended with continuations that run on the same queue once the
//! task is done.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use crossbeam_utils::Backoff;

use crate::core::job::{executable, Executable, Job, JobRef};
use crate::error::TaskError;
use crate::slot::ResultSlot;

/// A handle to the eventual result of a job.
///
/// Cloning the handle is cheap: clones share the job and its output.
pub struct Task<T> {
    job: JobRef,
    output: Arc<ResultSlot<T>>,
}

impl<T> Task<T> {
    pub(crate) fn new(job: JobRef, output: Arc<ResultSlot<T>>) -> Self {
        Task { job, output }
    }

    /// True once the task either produced a value or aborted.
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.job.is_executed()
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.job.is_aborted()
    }

    /// The fault that aborted the task, if any.
    pub fn fault(&self) -> Option<&TaskError> {
        self.job.fault()
    }

    /// Borrow the result.
    ///
    /// Fails with `TaskError::NotCompleted` if the task is not completed yet,
    /// or with the captured fault if it aborted.
    pub fn result_ref(&self) -> Result<&T, TaskError> {
        if !self.job.is_executed() {
            return Err(TaskError::NotCompleted);
        }

        if let Some(fault) = self.job.fault() {
            return Err(fault.clone());
        }

        // A job that completed without aborting always filled its slot
        // before publishing its state.
        self.output.get().ok_or(TaskError::NotCompleted)
    }

    /// Spin, then yield, until the task is completed.
    ///
    /// This never blocks on a lock: it only makes sense while the pool's
    /// workers are running or the task is already completed.
    pub fn wait(&self) {
        profiling::scope!("wait");

        let backoff = Backoff::new();
        while !self.is_completed() {
            backoff.snooze();
        }
    }

    /// Abort the task if no worker picked it up yet.
    ///
    /// Continuations of a cancelled task abort with a parent-aborted fault.
    /// Returns whether the task was cancelled by this call.
    pub fn cancel(&self) -> bool {
        self.job.abort(TaskError::Cancelled)
    }

    /// Run `f` on the result of this task once it is completed.
    ///
    /// If this task aborts, `f` never runs and the new task aborts with
    /// `TaskError::ParentAborted`.
    pub fn continue_with<U, F>(&self, f: F) -> Task<U>
    where
        F: FnOnce(T) -> U + Send + 'static,
        T: Clone + Send + Sync + 'static,
        U: Send + Sync + 'static,
    {
        let input = Arc::clone(&self.output);
        let output = Arc::new(ResultSlot::new());
        let slot = Arc::clone(&output);

        self.then(output, executable(move || {
            let value = parent_output(&input)?;
            slot.set(f(value));
            Ok(())
        }))
    }

    /// Like `continue_with`, but an `Err` returned by `f` becomes the new
    /// task's fault.
    pub fn try_continue_with<U, E, F>(&self, f: F) -> Task<U>
    where
        F: FnOnce(T) -> Result<U, E> + Send + 'static,
        T: Clone + Send + Sync + 'static,
        U: Send + Sync + 'static,
        E: StdError + Send + Sync + 'static,
    {
        let input = Arc::clone(&self.output);
        let output = Arc::new(ResultSlot::new());
        let slot = Arc::clone(&output);

        self.then(output, executable(move || {
            let value = parent_output(&input)?;
            slot.set(f(value).map_err(TaskError::failed)?);
            Ok(())
        }))
    }

    fn then<U>(&self, output: Arc<ResultSlot<U>>, executable: Executable) -> Task<U> {
        profiling::scope!("continue_with");

        Task::new(Job::continue_with(&self.job, executable), output)
    }
}

impl<T: Clone> Task<T> {
    /// Get a copy of the result.
    ///
    /// Fails with `TaskError::NotCompleted` if the task is not completed yet,
    /// or with the captured fault if it aborted.
    pub fn result(&self) -> Result<T, TaskError> {
        self.result_ref().cloned()
    }
}

// Continuations only run once the parent is executed and not aborted, so the
// parent's output is there.
fn parent_output<T: Clone>(slot: &ResultSlot<T>) -> Result<T, TaskError> {
    slot.get()
        .cloned()
        .ok_or_else(|| TaskError::ParentAborted(Arc::new(TaskError::NotCompleted)))
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Task {
            job: Arc::clone(&self.job),
            output: Arc::clone(&self.output),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("completed", &self.is_completed())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

#[cfg(test)]
use crate::{Strategy, ThreadPool};

#[cfg(test)]
fn test_pool(strategy: Strategy) -> ThreadPool {
    ThreadPool::builder()
        .with_worker_threads(4)
        .with_strategy(strategy)
        .build()
        .unwrap()
}

#[test]
fn test_not_completed() {
    // No worker can pick up the job while the only worker is blocked.
    use std::sync::mpsc;

    let pool = ThreadPool::builder().with_worker_threads(1).build().unwrap();
    let (tx, rx) = mpsc::channel::<()>();
    let blocker = pool.enqueue(move || rx.recv().unwrap());
    let task = pool.enqueue(|| 5);

    assert!(!task.is_completed());
    assert!(matches!(task.result(), Err(TaskError::NotCompleted)));
    assert!(matches!(task.result_ref(), Err(TaskError::NotCompleted)));

    tx.send(()).unwrap();
    blocker.wait();
    task.wait();
    assert_eq!(task.result().unwrap(), 5);
    assert_eq!(*task.result_ref().unwrap(), 5);
    // Results can be read any number of times.
    assert_eq!(task.clone().result().unwrap(), 5);
}

#[test]
fn test_fault_propagation() {
    use std::sync::atomic::{AtomicBool, Ordering};

    for strategy in [Strategy::Sharing, Strategy::Stealing] {
        let pool = test_pool(strategy);
        let ran = Arc::new(AtomicBool::new(false));

        let failing = pool.enqueue(|| -> u32 { panic!("bad input") });
        let r = ran.clone();
        let child = failing.continue_with(move |v| { r.store(true, Ordering::SeqCst); v + 1 });
        let grandchild = child.continue_with(|v| v * 2);

        grandchild.wait();
        failing.wait();

        assert!(failing.is_aborted());
        assert!(matches!(failing.result(), Err(TaskError::Panicked(msg)) if msg == "bad input"));

        assert!(child.is_aborted());
        assert!(matches!(child.result(), Err(TaskError::ParentAborted(_))));
        assert!(!ran.load(Ordering::SeqCst));

        match grandchild.result() {
            Err(err @ TaskError::ParentAborted(_)) => {
                assert!(matches!(err.root_cause(), TaskError::Panicked(_)));
            }
            other => panic!("unexpected result {:?}", other),
        }

        // The pool survives the panic.
        let task = pool.enqueue(|| "still alive");
        task.wait();
        assert_eq!(task.result().unwrap(), "still alive");
    }
}

#[test]
fn test_fallible_closures() {
    use std::io;

    let pool = test_pool(Strategy::Stealing);

    let ok = pool.try_enqueue(|| Ok::<_, io::Error>(3));
    let err = pool.try_enqueue(|| -> io::Result<u32> { Err(io::Error::new(io::ErrorKind::Other, "nope")) });
    let chained = ok.try_continue_with(|v| {
        if v > 2 { Err(io::Error::new(io::ErrorKind::InvalidInput, "too big")) } else { Ok(v) }
    });
    let after_err = err.continue_with(|v| v + 1);

    chained.wait();
    after_err.wait();

    assert_eq!(ok.result().unwrap(), 3);
    assert_eq!(err.result().unwrap_err().to_string(), "task failed: nope");
    assert_eq!(chained.result().unwrap_err().to_string(), "task failed: too big");
    assert!(matches!(after_err.result(), Err(TaskError::ParentAborted(_))));
}

#[test]
fn test_cancel() {
    use std::sync::mpsc;

    let pool = ThreadPool::builder().with_worker_threads(1).with_strategy(Strategy::Sharing).build().unwrap();
    let (tx, rx) = mpsc::channel::<()>();
    let blocker = pool.enqueue(move || rx.recv().unwrap());
    let task = pool.enqueue(|| 1);
    let child = task.continue_with(|v| v + 1);

    assert!(task.cancel());
    assert!(!task.cancel());
    assert!(task.is_completed());
    assert!(matches!(task.result(), Err(TaskError::Cancelled)));

    tx.send(()).unwrap();
    blocker.wait();
    child.wait();

    assert!(matches!(child.fault(), Some(TaskError::ParentAborted(parent)) if matches!(**parent, TaskError::Cancelled)));
    // A completed task cannot be cancelled.
    assert!(!blocker.cancel());
    assert!(blocker.result().is_ok());
}

#[test]
fn test_continuation_fan_out() {
    for strategy in [Strategy::Sharing, Strategy::Stealing] {
        let pool = test_pool(strategy);

        let root = pool.enqueue(|| vec![1u32, 2, 3]);
        let sum = root.continue_with(|v| v.iter().sum::<u32>());
        let len = root.continue_with(|v| v.len());
        let desc = sum.continue_with(|s| format!("sum={}", s));

        desc.wait();
        len.wait();

        assert_eq!(root.result().unwrap(), vec![1, 2, 3]);
        assert_eq!(sum.result().unwrap(), 6);
        assert_eq!(len.result().unwrap(), 3);
        assert_eq!(desc.result().unwrap(), "sum=6");
    }
}

#[test]
fn test_continue_after_shutdown() {
    let pool = test_pool(Strategy::Stealing);
    let task = pool.enqueue(|| 1);
    task.wait();

    pool.shutdown();

    let child = task.continue_with(|v| v + 1);
    assert!(child.is_completed());
    assert!(matches!(child.result(), Err(TaskError::Shutdown)));
}
