use super::job::JobRef;

/// A strategy for distributing jobs to the workers of a thread pool.
///
/// Implementations hold jobs that are ready to run. A job leaves the queue
/// exactly once, either through a successful `pop` or through the abort that
/// `shutdown` performs, so that no job is ever dropped without reaching a
/// terminal state.
pub trait WorkQueue: Send + Sync {
    /// Fetch a job for the worker at `worker_idx`.
    ///
    /// Never blocks. Returns `None` when there is nothing to do for this
    /// worker right now, or when the queue is shut down; callers must
    /// tolerate repeated empty pops.
    fn pop(&self, worker_idx: usize) -> Option<JobRef>;

    /// Submit a ready job.
    ///
    /// If the queue is already shut down the job is aborted with
    /// `TaskError::Shutdown` instead of being queued.
    fn enqueue(&self, job: JobRef);

    /// Close the queue and abort every job still in it. Idempotent.
    fn shutdown(&self);

    fn is_shut_down(&self) -> bool;

    /// The number of worker indices `pop` accepts.
    fn num_workers(&self) -> usize;
}
