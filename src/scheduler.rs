//! Priority-levelled task runner
//!
//! Tasks are grouped into batches. A batch can be promoted, demoted or
//! cancelled as a whole, which is how a scale switch pushes the work of the
//! newly active grid ahead of work queued for the previous one. Lower levels
//! are only served once every higher level is drained.
//!
//! With zero workers the scheduler is cooperative: nothing runs until the
//! owner calls [`Scheduler::run_until_idle`] (or [`Scheduler::run_one`]).

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use log::{debug, error};

/// Queue levels, served highest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Priority {
    Now,
    Next,
    Idle,
}

impl Priority {
    pub const LEVELS: usize = 3;

    const fn index(self) -> usize {
        match self {
            Priority::Now => 0,
            Priority::Next => 1,
            Priority::Idle => 2,
        }
    }
}

/// Shared flag telling queued and running work to stop.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BatchId(pub u64);

/// Handle on a group of tasks submitted together.
#[derive(Clone, Debug)]
pub struct Batch {
    id: BatchId,
    token: CancelToken,
}

impl Batch {
    #[must_use]
    pub fn id(&self) -> BatchId {
        self.id
    }

    /// Token observed by every task of the batch.
    #[must_use]
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Task {
    batch: BatchId,
    token: CancelToken,
    job: Job,
}

#[derive(Default)]
struct Queue {
    levels: [VecDeque<Task>; Priority::LEVELS],
    running: usize,
    shutdown: bool,
}

impl Queue {
    fn pop(&mut self) -> Option<Task> {
        self.levels.iter_mut().find_map(VecDeque::pop_front)
    }

    fn is_idle(&self) -> bool {
        self.running == 0 && self.levels.iter().all(VecDeque::is_empty)
    }

    /// Removes every queued task of `batch`, keeping their relative order.
    fn extract(&mut self, batch: BatchId) -> Vec<Task> {
        let mut taken = Vec::new();
        for level in &mut self.levels {
            let (mine, rest): (VecDeque<Task>, VecDeque<Task>) =
                level.drain(..).partition(|t| t.batch == batch);
            *level = rest;
            taken.extend(mine);
        }
        taken
    }
}

struct Shared {
    queue: Mutex<Queue>,
    work: Condvar,
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn execute(&self, task: Task) {
        if task.token.is_cancelled() {
            debug!("skipping task of cancelled batch {:?}", task.batch);
        } else if panic::catch_unwind(AssertUnwindSafe(task.job)).is_err() {
            error!("task of batch {:?} panicked", task.batch);
        }

        let mut queue = self.lock();
        queue.running -= 1;
        if queue.is_idle() {
            self.idle.notify_all();
        }
    }
}

/// Runs submitted closures by priority, on worker threads or cooperatively.
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    next_batch: AtomicU64,
}

impl Scheduler {
    /// Scheduler with `workers` threads; `0` gives the cooperative mode.
    pub fn new(workers: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            work: Condvar::new(),
            idle: Condvar::new(),
        });

        let workers = (0..workers)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("tilepool-worker-{i}"))
                    .spawn(move || worker_loop(&shared))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    error!("failed to spawn worker: {e}");
                    None
                }
            })
            .collect();

        Self {
            shared,
            workers,
            next_batch: AtomicU64::new(1),
        }
    }

    /// One worker per core, minus `reserve` cores left for the caller.
    pub fn with_reserve(reserve: usize) -> Self {
        Self::new(Self::default_workers(reserve))
    }

    pub fn default_workers(reserve: usize) -> usize {
        std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1)
            .saturating_sub(reserve)
            .max(1)
    }

    pub fn cooperative() -> Self {
        Self::new(0)
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_cooperative(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn batch(&self) -> Batch {
        Batch {
            id: BatchId(self.next_batch.fetch_add(1, Ordering::Relaxed)),
            token: CancelToken::new(),
        }
    }

    pub fn submit(&self, batch: &Batch, priority: Priority, job: impl FnOnce() + Send + 'static) {
        self.push(batch, priority, Box::new(job), false);
    }

    /// Queues `job` ahead of everything already waiting at `priority`.
    pub fn submit_front(
        &self,
        batch: &Batch,
        priority: Priority,
        job: impl FnOnce() + Send + 'static,
    ) {
        self.push(batch, priority, Box::new(job), true);
    }

    fn push(&self, batch: &Batch, priority: Priority, job: Job, front: bool) {
        let task = Task {
            batch: batch.id,
            token: batch.token.clone(),
            job,
        };
        let mut queue = self.shared.lock();
        let level = &mut queue.levels[priority.index()];
        if front {
            level.push_front(task);
        } else {
            level.push_back(task);
        }
        self.shared.work.notify_one();
    }

    /// Moves the queued tasks of `batch` to the front of the top level.
    pub fn promote(&self, batch: BatchId) -> usize {
        let mut queue = self.shared.lock();
        let tasks = queue.extract(batch);
        let moved = tasks.len();
        let now = &mut queue.levels[Priority::Now.index()];
        for task in tasks.into_iter().rev() {
            now.push_front(task);
        }
        if moved > 0 {
            debug!("promoted {moved} tasks of batch {batch:?}");
            self.shared.work.notify_all();
        }
        moved
    }

    /// Moves the queued tasks of `batch` to the back of `priority`.
    pub fn demote(&self, batch: BatchId, priority: Priority) -> usize {
        let mut queue = self.shared.lock();
        let tasks = queue.extract(batch);
        let moved = tasks.len();
        queue.levels[priority.index()].extend(tasks);
        moved
    }

    /// Cancels `batch`: queued tasks are dropped, running ones see the token.
    pub fn cancel(&self, batch: &Batch) -> usize {
        batch.token.cancel();
        let mut queue = self.shared.lock();
        let dropped = queue.extract(batch.id).len();
        if queue.is_idle() {
            self.shared.idle.notify_all();
        }
        if dropped > 0 {
            debug!("cancelled {dropped} queued tasks of batch {:?}", batch.id);
        }
        dropped
    }

    /// Queued tasks per level, highest level first.
    #[must_use]
    pub fn pending(&self) -> [usize; Priority::LEVELS] {
        let queue = self.shared.lock();
        [0, 1, 2].map(|i| queue.levels[i].len())
    }

    #[must_use]
    pub fn pending_in(&self, batch: BatchId) -> usize {
        let queue = self.shared.lock();
        queue
            .levels
            .iter()
            .flatten()
            .filter(|t| t.batch == batch)
            .count()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.shared.lock().is_idle()
    }

    /// Runs the highest priority task on the calling thread.
    pub fn run_one(&self) -> bool {
        let task = {
            let mut queue = self.shared.lock();
            let Some(task) = queue.pop() else {
                return false;
            };
            queue.running += 1;
            task
        };
        self.shared.execute(task);
        true
    }

    /// Drains the queue on the calling thread, returning how many tasks ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }

    /// Blocks until no task is queued or running. In cooperative mode the
    /// queue is drained on the calling thread instead.
    pub fn wait_idle(&self) {
        if self.is_cooperative() {
            self.run_until_idle();
            return;
        }
        let mut queue = self.shared.lock();
        while !queue.is_idle() {
            queue = self
                .shared
                .idle
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stops the workers once their current task is done. Queued tasks are
    /// dropped.
    pub fn shutdown(&mut self) {
        {
            let mut queue = self.shared.lock();
            queue.shutdown = true;
            for level in &mut queue.levels {
                level.clear();
            }
        }
        self.shared.work.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let task = {
            let mut queue = shared.lock();
            loop {
                if queue.shutdown {
                    return;
                }
                if let Some(task) = queue.pop() {
                    queue.running += 1;
                    break task;
                }
                queue = shared
                    .work
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        shared.execute(task);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Job) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = Arc::clone(&log);
        let make = move |name: &'static str| -> Job {
            let log = Arc::clone(&handle);
            Box::new(move || log.lock().unwrap().push(name))
        };
        (log, make)
    }

    #[test]
    fn higher_levels_run_first() {
        let s = Scheduler::cooperative();
        let (log, job) = recorder();
        let b = s.batch();
        s.submit(&b, Priority::Idle, job("idle"));
        s.submit(&b, Priority::Next, job("next"));
        s.submit(&b, Priority::Now, job("now-1"));
        s.submit(&b, Priority::Now, job("now-2"));
        assert_eq!(s.pending(), [2, 1, 1]);

        assert_eq!(s.run_until_idle(), 4);
        assert_eq!(*log.lock().unwrap(), ["now-1", "now-2", "next", "idle"]);
        assert!(s.is_idle());
    }

    #[test]
    fn promote_moves_batch_to_front() {
        let s = Scheduler::cooperative();
        let (log, job) = recorder();
        let stale = s.batch();
        let fresh = s.batch();
        s.submit(&stale, Priority::Now, job("stale-1"));
        s.submit(&stale, Priority::Now, job("stale-2"));
        s.submit(&fresh, Priority::Next, job("fresh-1"));
        s.submit(&fresh, Priority::Next, job("fresh-2"));

        assert_eq!(s.promote(fresh.id()), 2);
        assert_eq!(s.demote(stale.id(), Priority::Next), 2);
        s.run_until_idle();
        assert_eq!(
            *log.lock().unwrap(),
            ["fresh-1", "fresh-2", "stale-1", "stale-2"]
        );
    }

    #[test]
    fn cancel_drops_queued_tasks() {
        let s = Scheduler::cooperative();
        let (log, job) = recorder();
        let keep = s.batch();
        let doomed = s.batch();
        s.submit(&keep, Priority::Now, job("keep"));
        s.submit(&doomed, Priority::Now, job("drop-1"));
        s.submit(&doomed, Priority::Next, job("drop-2"));

        assert_eq!(s.pending_in(doomed.id()), 2);
        assert_eq!(s.cancel(&doomed), 2);
        assert!(doomed.is_cancelled());
        assert_eq!(s.pending_in(doomed.id()), 0);

        // submitting into a cancelled batch is a no-op at run time
        s.submit(&doomed, Priority::Now, job("late"));
        s.run_until_idle();
        assert_eq!(*log.lock().unwrap(), ["keep"]);
    }

    #[test]
    fn panicking_task_does_not_wedge_the_queue() {
        let s = Scheduler::cooperative();
        let b = s.batch();
        let hits = Arc::new(AtomicUsize::new(0));
        s.submit(&b, Priority::Now, || panic!("boom"));
        let h = Arc::clone(&hits);
        s.submit(&b, Priority::Now, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(s.run_until_idle(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(s.is_idle());
    }

    #[test]
    fn workers_drain_the_queue() {
        let s = Scheduler::new(3);
        assert_eq!(s.worker_count(), 3);
        let b = s.batch();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let h = Arc::clone(&hits);
            s.submit(&b, Priority::Next, move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        s.wait_idle();
        assert_eq!(hits.load(Ordering::SeqCst), 64);
        assert_eq!(s.pending(), [0, 0, 0]);
    }

    #[test]
    fn reserve_keeps_at_least_one_worker() {
        assert!(Scheduler::default_workers(usize::MAX) >= 1);
    }
}
