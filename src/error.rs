use std::error::Error as StdError;
use std::sync::Arc;

/// Errors raised while building a thread pool or one of its queues.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("an attempt to create a pool or queue with 0 workers")]
    ZeroWorkers,

    #[error("the work queue serves {queue} workers but the pool has {workers}")]
    QueueTooSmall { workers: usize, queue: usize },

    #[error("failed to spawn a worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// The reason a task did not produce a value.
///
/// Faults are captured on the worker thread and stored in the job. They
/// only surface when someone asks the task for its result, so this type is
/// cheap to clone.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("task is not completed yet")]
    NotCompleted,

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task failed: {0}")]
    Failed(Arc<dyn StdError + Send + Sync>),

    #[error("parent task aborted: {0}")]
    ParentAborted(Arc<TaskError>),

    #[error("thread pool is shut down")]
    Shutdown,

    #[error("task was cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn failed<E>(err: E) -> Self
    where E: StdError + Send + Sync + 'static
    {
        TaskError::Failed(Arc::new(err))
    }

    /// The fault of a continuation whose parent aborted with `parent_fault`.
    ///
    /// Points straight at the fault that started the chain, so the nesting
    /// depth stays at one however long the chain is.
    pub(crate) fn parent_aborted(parent_fault: &TaskError) -> Self {
        match parent_fault {
            TaskError::ParentAborted(root) => TaskError::ParentAborted(Arc::clone(root)),
            other => TaskError::ParentAborted(Arc::new(other.clone())),
        }
    }

    /// Follow `ParentAborted` links up to the fault that started the chain.
    pub fn root_cause(&self) -> &TaskError {
        let mut err = self;
        while let TaskError::ParentAborted(parent) = err {
            err = parent;
        }

        err
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };

        TaskError::Panicked(message)
    }
}

#[test]
fn test_panic_payloads() {
    let err = TaskError::from_panic(Box::new("boom"));
    assert!(matches!(err, TaskError::Panicked(ref msg) if msg == "boom"));

    let err = TaskError::from_panic(Box::new(format!("boom {}", 42)));
    assert!(matches!(err, TaskError::Panicked(ref msg) if msg == "boom 42"));

    let err = TaskError::from_panic(Box::new(42u32));
    assert!(matches!(err, TaskError::Panicked(ref msg) if msg == "unknown panic"));
}

#[test]
fn test_root_cause() {
    let err = TaskError::ParentAborted(Arc::new(TaskError::ParentAborted(Arc::new(TaskError::Cancelled))));
    assert!(matches!(err.root_cause(), TaskError::Cancelled));
    assert_eq!(err.to_string(), "parent task aborted: parent task aborted: task was cancelled");

    let err = TaskError::failed(std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"));
    assert_eq!(err.to_string(), "task failed: disk on fire");
    assert!(matches!(err.root_cause(), TaskError::Failed(_)));
}

#[test]
fn test_parent_aborted_stays_flat() {
    let child = TaskError::parent_aborted(&TaskError::Panicked("root".to_string()));
    let mut err = child.clone();
    for _ in 0..1000 {
        err = TaskError::parent_aborted(&err);
    }

    match (&child, &err) {
        (TaskError::ParentAborted(a), TaskError::ParentAborted(b)) => assert!(Arc::ptr_eq(a, b)),
        other => panic!("unexpected faults {:?}", other),
    }
    assert_eq!(err.to_string(), "parent task aborted: task panicked: root");
    assert!(matches!(err.root_cause(), TaskError::Panicked(msg) if msg == "root"));
}
