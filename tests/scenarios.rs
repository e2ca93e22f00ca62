use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use strand::{JobRef, Strategy, Task, TaskError, ThreadPool, WorkQueue, WorkSharingQueue, WorkStealingQueue};

const N_WORKERS: usize = 8;
const N_TASKS: usize = N_WORKERS * 16;
const N_CHAIN_TASKS: usize = N_WORKERS * 16;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn sharing_queue(workers: usize) -> Arc<dyn WorkQueue> {
    Arc::new(WorkSharingQueue::new(workers).unwrap())
}

fn stealing_queue(workers: usize) -> Arc<dyn WorkQueue> {
    Arc::new(WorkStealingQueue::new(workers).unwrap())
}

fn queues(workers: usize) -> Vec<Arc<dyn WorkQueue>> {
    vec![sharing_queue(workers), stealing_queue(workers)]
}

#[test]
fn independent_tasks_produce_each_index_once() {
    init_logger();

    let pool = ThreadPool::new(N_WORKERS, stealing_queue(N_WORKERS)).unwrap();
    let tasks: Vec<Task<usize>> = (0..N_TASKS).map(|i| pool.enqueue(move || i)).collect();

    let mut results: Vec<usize> = tasks.iter().map(|task| {
        task.wait();
        task.result().unwrap()
    }).collect();
    results.sort();

    assert_eq!(results, (0..N_TASKS).collect::<Vec<_>>());
}

#[test]
fn continuation_chain_applies_every_step_in_order() {
    init_logger();

    for queue in queues(N_WORKERS) {
        let pool = ThreadPool::new(N_WORKERS, queue).unwrap();

        let mut task = pool.enqueue(|| 0usize);
        for _ in 0..N_CHAIN_TASKS {
            task = task.continue_with(|value| value + 1);
        }

        task.wait();
        assert_eq!(task.result().unwrap(), N_CHAIN_TASKS);

        // Non-commutative steps: the order is observable in the result.
        let mut task = pool.enqueue(String::new);
        for i in 0..10 {
            task = task.continue_with(move |s| format!("{}{}", s, i));
        }

        task.wait();
        assert_eq!(task.result().unwrap(), "0123456789");
    }
}

#[test]
fn faults_surface_and_skip_continuations() {
    init_logger();

    for queue in queues(N_WORKERS) {
        let pool = ThreadPool::new(N_WORKERS, queue).unwrap();
        let called = Arc::new(AtomicBool::new(false));

        let task = pool.enqueue(|| -> i32 { panic!("division by zero") });
        let c = called.clone();
        let next = task.continue_with(move |v| { c.store(true, Ordering::SeqCst); v });

        next.wait();
        assert!(task.is_completed());

        assert!(matches!(task.result(), Err(TaskError::Panicked(ref msg)) if msg == "division by zero"));
        assert!(matches!(next.result(), Err(TaskError::ParentAborted(_))));
        assert!(!called.load(Ordering::SeqCst));
    }
}

#[test]
fn deep_chain_on_a_failed_root_aborts_every_link() {
    init_logger();

    const DEPTH: usize = 50_000;

    for queue in queues(1) {
        let pool = ThreadPool::new(1, queue).unwrap();

        let root = pool.enqueue(|| -> u64 { panic!("root") });
        let mut task = root.continue_with(|v| v + 1);
        for _ in 1..DEPTH {
            task = task.continue_with(|v| v + 1);
        }

        task.wait();
        assert!(task.is_aborted());

        let err = task.result().unwrap_err();
        assert!(matches!(err.root_cause(), TaskError::Panicked(ref msg) if msg == "root"));
        assert_eq!(err.to_string(), "parent task aborted: task panicked: root");

        // The worker survived the whole chain.
        let after = pool.enqueue(|| 7);
        after.wait();
        assert_eq!(after.result().unwrap(), 7);

        pool.shutdown();
        drop(root);
        drop(task);
        drop(err);
    }
}

#[test]
fn shutdown_is_idempotent_and_rejects_new_work() {
    init_logger();

    for queue in queues(N_WORKERS) {
        let pool = ThreadPool::new(N_WORKERS, queue.clone()).unwrap();
        let before = pool.enqueue(|| 1);
        before.wait();

        pool.shutdown();
        let stats = pool.stats();
        pool.shutdown();
        assert_eq!(pool.stats(), stats);
        assert!(queue.is_shut_down());

        let executed = Arc::new(AtomicBool::new(false));
        for _ in 0..N_TASKS {
            let executed = executed.clone();
            let task = pool.enqueue(move || executed.store(true, Ordering::SeqCst));
            assert!(task.is_completed());
            assert!(task.is_aborted());
            assert!(matches!(task.result(), Err(TaskError::Shutdown)));
        }

        assert!(!executed.load(Ordering::SeqCst));
        assert_eq!(before.result().unwrap(), 1);
    }
}

#[test]
fn single_worker_sharing_queue_keeps_submission_order() {
    init_logger();

    let pool = ThreadPool::new(1, sharing_queue(1)).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let tasks: Vec<Task<()>> = (0..N_TASKS).map(|i| {
        let order = order.clone();
        pool.enqueue(move || order.lock().unwrap().push(i))
    }).collect();

    for task in &tasks {
        task.wait();
    }

    assert_eq!(*order.lock().unwrap(), (0..N_TASKS).collect::<Vec<_>>());
}

#[test]
fn concurrent_submission_reaches_exactly_one_terminal_state() {
    init_logger();

    const SUBMITTERS: usize = 4;
    const PER_SUBMITTER: usize = 256;

    let pool = Arc::new(ThreadPool::new(N_WORKERS, stealing_queue(N_WORKERS)).unwrap());
    let runs: Arc<Vec<AtomicU32>> = Arc::new((0..SUBMITTERS * PER_SUBMITTER).map(|_| AtomicU32::new(0)).collect());

    let submitters: Vec<_> = (0..SUBMITTERS).map(|s| {
        let pool = pool.clone();
        let runs = runs.clone();
        std::thread::spawn(move || {
            (0..PER_SUBMITTER).map(|i| {
                let idx = s * PER_SUBMITTER + i;
                let runs = runs.clone();
                let task = pool.enqueue(move || {
                    runs[idx].fetch_add(1, Ordering::SeqCst);
                    idx
                });
                // Half of them get a continuation, which exercises re-enqueuing.
                if i % 2 == 0 { task.continue_with(|idx| idx) } else { task }
            }).collect::<Vec<_>>()
        })
    }).collect();

    let tasks: Vec<Task<usize>> = submitters.into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();

    for task in &tasks {
        task.wait();
        assert!(!task.is_aborted());
    }

    let mut results: Vec<usize> = tasks.iter().map(|task| task.result().unwrap()).collect();
    results.sort();
    assert_eq!(results, (0..SUBMITTERS * PER_SUBMITTER).collect::<Vec<_>>());

    for run in runs.iter() {
        assert_eq!(run.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn shutdown_with_pending_work_terminates_every_task() {
    init_logger();

    for queue in queues(2) {
        let pool = ThreadPool::new(2, queue).unwrap();

        let mut tasks = Vec::new();
        for i in 0..1000u64 {
            let task = pool.enqueue(move || {
                std::thread::sleep(std::time::Duration::from_micros(50));
                i
            });
            tasks.push(task.continue_with(|v| v * 2));
            tasks.push(task);
        }

        pool.shutdown();

        let mut completed = 0;
        for task in &tasks {
            assert!(task.is_completed());
            match task.result() {
                Ok(_) => completed += 1,
                Err(TaskError::Shutdown) | Err(TaskError::ParentAborted(_)) => {}
                Err(err) => panic!("unexpected fault {:?}", err),
            }
        }

        assert!(completed < tasks.len());
    }
}

/// A queue that hands out the most recently submitted job first, to check
/// that the pool only relies on the `WorkQueue` contract.
struct LifoQueue {
    jobs: Mutex<Option<Vec<JobRef>>>,
    num_workers: usize,
}

impl WorkQueue for LifoQueue {
    fn pop(&self, _worker_idx: usize) -> Option<JobRef> {
        self.jobs.lock().unwrap().as_mut().and_then(Vec::pop)
    }

    fn enqueue(&self, job: JobRef) {
        let rejected = match self.jobs.lock().unwrap().as_mut() {
            Some(jobs) => {
                jobs.push(job);
                None
            }
            None => Some(job),
        };

        if let Some(job) = rejected {
            job.abort(TaskError::Shutdown);
        }
    }

    fn shutdown(&self) {
        let drained = self.jobs.lock().unwrap().take().unwrap_or_default();
        for job in drained {
            job.abort(TaskError::Shutdown);
        }
    }

    fn is_shut_down(&self) -> bool {
        self.jobs.lock().unwrap().is_none()
    }

    fn num_workers(&self) -> usize {
        self.num_workers
    }
}

#[test]
fn custom_work_queue() {
    init_logger();

    let queue = Arc::new(LifoQueue { jobs: Mutex::new(Some(Vec::new())), num_workers: 3 });
    let pool = ThreadPool::builder()
        .with_worker_threads(3)
        .with_work_queue(queue.clone())
        .build()
        .unwrap();

    let mut task = pool.enqueue(|| 1u64);
    for _ in 0..20 {
        task = task.continue_with(|v| v * 2);
    }
    let others: Vec<Task<u64>> = (0..50).map(|i| pool.enqueue(move || i)).collect();

    task.wait();
    assert_eq!(task.result().unwrap(), 1 << 20);
    for (i, other) in others.iter().enumerate() {
        other.wait();
        assert_eq!(other.result().unwrap(), i as u64);
    }

    drop(pool);
    assert!(queue.is_shut_down());
}

#[test]
fn builder_strategies_match_explicit_queues() {
    init_logger();

    for strategy in [Strategy::Sharing, Strategy::Stealing] {
        let pool = ThreadPool::builder().with_worker_threads(2).with_strategy(strategy).build().unwrap();
        assert_eq!(pool.work_queue().num_workers(), 2);

        let task = pool.enqueue(|| "ok");
        task.wait();
        assert_eq!(task.result().unwrap(), "ok");
    }
}
