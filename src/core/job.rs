use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use super::sync::{AtomicU8, Ordering};
use super::work_queue::WorkQueue;
use crate::error::TaskError;

/// The type-erased body of a job.
///
/// It produces no typed value: its side effect is writing into a result slot
/// owned by the task. Returning `Err` aborts the job with that fault.
pub type Executable = Box<dyn FnOnce() -> Result<(), TaskError> + Send>;

/// Box a closure as a job body.
pub(crate) fn executable<F>(f: F) -> Executable
where F: FnOnce() -> Result<(), TaskError> + Send + 'static
{
    Box::new(f)
}

/// Shared ownership of a job. This is what gets pushed/popped/stolen from the
/// queues, and what continuations hold on to as their parent.
pub type JobRef = Arc<Job>;

const STATE_PENDING: u8 = 0;
// Set by whoever wins the right to move the job to a terminal state.
const CLAIMED: u8 = 1;
const EXECUTED: u8 = 2;
const ABORTED: u8 = 4;

/// The internal schedulable unit.
///
/// A job goes through `Pending -> Executing -> {Completed, Aborted}`. The
/// executed and aborted flags are one-way: once a job is executed it stays
/// executed, and it can only be aborted together with being executed.
///
/// Both `execute` and `abort` start by claiming the job with a compare-and-swap
/// from the pending state, so the closure runs at most once and an aborted
/// job can never be picked up by a racing worker.
pub struct Job {
    executable: UnsafeCell<Option<Executable>>,
    state: AtomicU8,
    parent: Option<JobRef>,
    // Only meaningful when the aborted flag is set. Written by the claim
    // winner before the terminal state is published.
    fault: OnceLock<TaskError>,
    queue: Arc<dyn WorkQueue>,
}

// The executable is only touched by the thread that won the claim.
unsafe impl Sync for Job {}

impl Job {
    pub(crate) fn new(
        executable: Executable,
        parent: Option<JobRef>,
        queue: Arc<dyn WorkQueue>,
    ) -> JobRef {
        Arc::new(Job {
            executable: UnsafeCell::new(Some(executable)),
            state: AtomicU8::new(STATE_PENDING),
            parent,
            fault: OnceLock::new(),
            queue,
        })
    }

    /// Create a job gated on `this` and enqueue it on the same queue.
    pub(crate) fn continue_with(this: &JobRef, executable: Executable) -> JobRef {
        let job = Job::new(executable, Some(Arc::clone(this)), Arc::clone(&this.queue));
        job.queue.enqueue(Arc::clone(&job));

        job
    }

    /// Whether a worker may execute this job now.
    ///
    /// A job whose parent aborted is still executable: `execute` turns it into
    /// a parent-aborted fault without running the closure.
    pub fn can_execute(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_PENDING
            && self.parent.as_ref().map_or(true, |parent| parent.is_executed())
    }

    /// True once `execute` or `abort` won the job, even if it is not
    /// executed yet.
    #[inline]
    pub fn is_claimed(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_PENDING
    }

    #[inline]
    pub fn is_executed(&self) -> bool {
        self.state.load(Ordering::Acquire) & EXECUTED != 0
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.state.load(Ordering::Acquire) & ABORTED != 0
    }

    /// The captured fault, if the job aborted.
    pub fn fault(&self) -> Option<&TaskError> {
        if self.is_aborted() {
            self.fault.get()
        } else {
            None
        }
    }

    pub fn parent(&self) -> Option<&JobRef> {
        self.parent.as_ref()
    }

    /// The queue this job (and its continuations) are submitted to.
    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    /// Run the job on the current thread.
    ///
    /// Returns false without doing anything if the job is already claimed or
    /// its parent has not reached a terminal state yet. Otherwise the job
    /// always ends up executed, whether the closure succeeded, failed,
    /// panicked, or was skipped because the parent aborted.
    pub fn execute(&self) -> bool {
        profiling::scope!("execute");

        if let Some(parent) = &self.parent {
            if !parent.is_executed() {
                return false;
            }
        }

        if !self.try_claim() {
            return false;
        }

        // SAFETY: we won the claim, nobody else will touch the executable.
        let executable = unsafe { (*self.executable.get()).take() };

        let inherited = self.parent.as_ref().and_then(|parent| parent.fault());
        let outcome = match (inherited, executable) {
            (Some(fault), _) => Err(TaskError::parent_aborted(fault)),
            (None, Some(executable)) => match catch_unwind(AssertUnwindSafe(executable)) {
                Ok(res) => res,
                Err(payload) => {
                    let fault = TaskError::from_panic(payload);
                    log::warn!("{}", fault);
                    Err(fault)
                }
            },
            (None, None) => Ok(()),
        };

        match outcome {
            Ok(()) => self.state.store(CLAIMED | EXECUTED, Ordering::Release),
            Err(fault) => self.finish_aborted(fault),
        }

        true
    }

    /// Abort the job if it has not started executing yet.
    ///
    /// Sets the aborted and executed flags together. Returns whether this
    /// call is the one that aborted the job.
    pub fn abort(&self, fault: TaskError) -> bool {
        if !self.try_claim() {
            return false;
        }

        // SAFETY: we won the claim, nobody else will touch the executable.
        let executable = unsafe { (*self.executable.get()).take() };
        self.finish_aborted(fault);
        drop(executable);

        true
    }

    #[cfg(test)]
    pub(crate) fn claim(&self) -> bool {
        self.try_claim()
    }

    fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(STATE_PENDING, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish_aborted(&self, fault: TaskError) {
        let _ = self.fault.set(fault);
        self.state.store(CLAIMED | EXECUTED | ABORTED, Ordering::Release);
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        // Unlink long continuation chains iteratively rather than recursing
        // through each parent's destructor.
        let mut parent = self.parent.take();
        while let Some(job) = parent {
            match Arc::try_unwrap(job) {
                Ok(mut job) => parent = job.parent.take(),
                Err(_) => break,
            }
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("executed", &self.is_executed())
            .field("aborted", &self.is_aborted())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
fn test_queue() -> Arc<dyn WorkQueue> {
    Arc::new(crate::WorkSharingQueue::new(1).unwrap())
}

#[cfg(not(loom))]
#[test]
fn test_execute_once() {
    use std::sync::atomic::AtomicU32;

    let count = Arc::new(AtomicU32::new(0));
    let c = count.clone();
    let job = Job::new(executable(move || { c.fetch_add(1, Ordering::SeqCst); Ok(()) }), None, test_queue());

    assert!(job.can_execute());
    assert!(!job.is_executed());

    assert!(job.execute());
    assert!(!job.execute());
    assert!(!job.abort(TaskError::Cancelled));

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(job.is_executed());
    assert!(!job.is_aborted());
    assert!(job.fault().is_none());
    assert!(!job.can_execute());
}

#[cfg(not(loom))]
#[test]
fn test_abort_before_execute() {
    let job = Job::new(executable(|| panic!("must not run")), None, test_queue());

    assert!(job.abort(TaskError::Cancelled));
    assert!(!job.abort(TaskError::Shutdown));
    assert!(job.is_executed());
    assert!(job.is_aborted());
    assert!(matches!(job.fault(), Some(TaskError::Cancelled)));

    assert!(!job.can_execute());
    assert!(!job.execute());
}

#[cfg(not(loom))]
#[test]
fn test_fault_capture() {
    let job = Job::new(executable(|| panic!("oh no")), None, test_queue());
    assert!(job.execute());
    assert!(job.is_aborted());
    assert!(matches!(job.fault(), Some(TaskError::Panicked(msg)) if msg == "oh no"));

    let job = Job::new(executable(|| Err(TaskError::Cancelled)), None, test_queue());
    assert!(job.execute());
    assert!(matches!(job.fault(), Some(TaskError::Cancelled)));
}

#[cfg(not(loom))]
#[test]
fn test_continuation_gating() {
    use std::sync::atomic::AtomicBool;

    let parent = Job::new(executable(|| Ok(())), None, test_queue());
    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    let child = Job::continue_with(&parent, executable(move || { r.store(true, Ordering::SeqCst); Ok(()) }));

    assert!(!child.can_execute());
    assert!(!child.execute());
    assert!(!child.is_executed());

    assert!(parent.execute());
    assert!(child.can_execute());
    assert!(child.execute());
    assert!(ran.load(Ordering::SeqCst));
    assert!(!child.is_aborted());

    // The continuation was submitted to the parent's queue.
    assert!(Arc::ptr_eq(&child.queue().pop(0).unwrap(), &child));
}

#[cfg(not(loom))]
#[test]
fn test_parent_aborted() {
    use std::sync::atomic::AtomicBool;

    let parent = Job::new(executable(|| panic!("root failure")), None, test_queue());
    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    let child = Job::continue_with(&parent, executable(move || { r.store(true, Ordering::SeqCst); Ok(()) }));
    let grandchild = Job::continue_with(&child, executable(|| Ok(())));

    parent.execute();
    // Executable even though the parent aborted.
    assert!(child.can_execute());
    assert!(child.execute());
    assert!(grandchild.execute());

    assert!(!ran.load(Ordering::SeqCst));
    assert!(child.is_aborted());
    match grandchild.fault() {
        Some(err @ TaskError::ParentAborted(_)) => {
            assert!(matches!(err.root_cause(), TaskError::Panicked(msg) if msg == "root failure"));
        }
        other => panic!("unexpected fault {:?}", other),
    }
}

#[cfg(not(loom))]
#[test]
fn test_drop_long_chain() {
    let root = Job::new(executable(|| Ok(())), None, test_queue());
    let mut last = root.clone();
    for _ in 0..200_000 {
        last = Job::new(executable(|| Ok(())), Some(last), root.queue().clone());
    }
    drop(root);
    drop(last);
}

#[cfg(not(loom))]
#[test]
fn test_drop_long_failed_chain() {
    let root = Job::new(executable(|| panic!("root")), None, test_queue());
    let mut chain = vec![root.clone()];
    for _ in 0..200_000 {
        let parent = chain.last().cloned();
        chain.push(Job::new(executable(|| Ok(())), parent, root.queue().clone()));
    }

    for job in &chain {
        assert!(job.execute());
    }

    let last = chain.pop().unwrap();
    drop(chain);
    drop(root);

    let fault = last.fault().cloned().unwrap();
    assert!(matches!(&fault, TaskError::ParentAborted(cause) if matches!(**cause, TaskError::Panicked(_))));
    assert_eq!(fault.to_string(), "parent task aborted: task panicked: root");

    drop(last);
    drop(fault);
}

#[cfg(loom)]
#[test]
fn test_loom_execute_abort_race() {
    use std::sync::atomic::AtomicU32;

    loom::model(|| {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let queue: Arc<dyn WorkQueue> = Arc::new(crate::WorkSharingQueue::new(1).unwrap());
        let job = Job::new(executable(move || { c.fetch_add(1, Ordering::SeqCst); Ok(()) }), None, queue);

        let j = job.clone();
        let worker = loom::thread::spawn(move || j.execute());
        let aborted = job.abort(TaskError::Shutdown);
        let executed = worker.join().unwrap();

        assert!(aborted != executed);
        assert!(job.is_executed());
        assert_eq!(job.is_aborted(), aborted);
        assert_eq!(count.load(Ordering::SeqCst), executed as u32);
    });
}
