//! A thread pool executing closures as tasks that can be chained with
//! continuations.
//!
//! - A fixed number of worker threads, no implicit global pool.
//! - Work is distributed by a pluggable `WorkQueue`: either one global FIFO
//!   shared by all workers (`WorkSharingQueue`) or a deque per worker with
//!   work stealing (`WorkStealingQueue`).
//! - Submitting work returns a `Task<T>` that can be polled, waited on,
//!   cancelled, or continued with another closure that receives its result.
//! - A panic (or an `Err` from a fallible closure) is captured as the task's
//!   fault and propagated to its continuations instead of taking down the
//!   worker.
//! - Shutting down aborts everything that is still queued, lets running jobs
//!   finish, and rejects later submissions.
//!
//! ```
//! use strand::{Strategy, ThreadPool};
//!
//! let pool = ThreadPool::builder()
//!     .with_worker_threads(4)
//!     .with_strategy(Strategy::Stealing)
//!     .build()
//!     .unwrap();
//!
//! let task = pool.enqueue(|| 20).continue_with(|v| v * 2 + 2);
//! task.wait();
//! assert_eq!(task.result().unwrap(), 42);
//!
//! pool.shutdown();
//! ```

mod core;
mod error;
mod slot;
mod task;

pub use crate::core::job::{Executable, Job, JobRef};
pub use crate::core::thread_pool::{Strategy, ThreadPool, ThreadPoolBuilder};
pub use crate::core::work_queue::WorkQueue;
pub use crate::core::work_sharing::WorkSharingQueue;
pub use crate::core::work_stealing::WorkStealingQueue;
pub use crate::core::{Stats, WorkerHook};
pub use crate::core::sync;
pub use crate::error::{PoolError, TaskError};
pub use crate::slot::ResultSlot;
pub use crate::task::Task;
