use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::ThreadPool;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    pool: Arc<ThreadPool>,

    queue: Mutex<VecDeque<Task>>,
    idle_cv: Condvar,

    /// Ensures at most one drain is posted to the upstream pool.
    worker_scheduled: AtomicBool,
    /// True while a drain is executing tasks.
    running: AtomicBool,
    /// Queue length, excluding the task currently executing.
    queued_count: AtomicUsize,
}

/// A strand: runs posted tasks one-at-a-time in FIFO order on top of a shared
/// [`ThreadPool`].
///
/// Tasks posted to the same strand never run concurrently. Panics inside a
/// task are caught so the strand keeps draining.
#[derive(Clone)]
pub struct SerialExecutor {
    inner: Arc<Inner>,
}

impl SerialExecutor {
    pub fn new(pool: Arc<ThreadPool>) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                queue: Mutex::new(VecDeque::new()),
                idle_cv: Condvar::new(),
                worker_scheduled: AtomicBool::new(false),
                running: AtomicBool::new(false),
                queued_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Enqueues a task and schedules a drain if none is pending.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut queue = self.inner.queue.lock();
            queue.push_back(Box::new(task));
            self.inner.queued_count.fetch_add(1, Ordering::Relaxed);
        }
        Self::schedule_worker_once(&self.inner);
    }

    /// True while the strand's drain loop is executing tasks.
    pub fn running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    /// Number of queued tasks, not counting the one currently executing.
    pub fn queued(&self) -> usize {
        self.inner.queued_count.load(Ordering::Relaxed)
    }

    pub fn is_busy(&self) -> bool {
        self.running() || self.queued() > 0
    }

    /// Blocks until no task is running and the queue is empty.
    pub fn wait_idle(&self) {
        let mut queue = self.inner.queue.lock();
        while self.inner.running.load(Ordering::Relaxed) || !queue.is_empty() {
            self.inner.idle_cv.wait(&mut queue);
        }
    }

    fn schedule_worker_once(inner: &Arc<Inner>) {
        if inner
            .worker_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let drainer = Arc::clone(inner);
            inner.pool.spawn(move || Self::drain(&drainer));
        }
    }

    fn drain(inner: &Arc<Inner>) {
        inner.running.store(true, Ordering::Relaxed);

        loop {
            let task = {
                let mut queue = inner.queue.lock();
                match queue.pop_front() {
                    Some(task) => {
                        inner.queued_count.fetch_sub(1, Ordering::Relaxed);
                        task
                    }
                    None => {
                        // About to go idle.
                        inner.running.store(false, Ordering::Relaxed);
                        inner.worker_scheduled.store(false, Ordering::Release);
                        inner.idle_cv.notify_all();

                        // A task may have been enqueued after we saw the queue
                        // empty but before the flags cleared; reclaim the
                        // drain token and keep going if so.
                        if !queue.is_empty()
                            && inner
                                .worker_scheduled
                                .compare_exchange(
                                    false,
                                    true,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                )
                                .is_ok()
                        {
                            inner.running.store(true, Ordering::Relaxed);
                            continue;
                        }
                        return;
                    }
                }
            };

            // Execute outside the lock so new tasks can be enqueued meanwhile.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task));
            if result.is_err() {
                warn!("strand task panicked, strand kept alive");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::SerialExecutor;
    use crate::ThreadPool;

    fn strand() -> SerialExecutor {
        SerialExecutor::new(Arc::new(ThreadPool::with_workers(4)))
    }

    #[test]
    fn fifo_order() {
        let strand = strand();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..100 {
            let log = Arc::clone(&log);
            strand.post(move || log.lock().push(i));
        }

        strand.wait_idle();
        let log = log.lock();
        assert_eq!(*log, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn never_concurrent() {
        let strand = strand();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            strand.post(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_micros(100));
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }

        strand.wait_idle();
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_idle_observes_empty_queue() {
        let strand = strand();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let done = Arc::clone(&done);
            strand.post(move || {
                std::thread::sleep(Duration::from_millis(1));
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        strand.wait_idle();
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert!(!strand.is_busy());
        assert_eq!(strand.queued(), 0);
    }

    #[test]
    fn survives_panicking_task() {
        let strand = strand();
        let done = Arc::new(AtomicUsize::new(0));

        strand.post(|| panic!("task failure"));
        let d = Arc::clone(&done);
        strand.post(move || {
            d.fetch_add(1, Ordering::SeqCst);
        });

        strand.wait_idle();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn posting_from_within_a_task_continues_drain() {
        let strand = strand();
        let done = Arc::new(AtomicUsize::new(0));

        let inner_strand = strand.clone();
        let d = Arc::clone(&done);
        strand.post(move || {
            let d2 = Arc::clone(&d);
            inner_strand.post(move || {
                d2.fetch_add(1, Ordering::SeqCst);
            });
            d.fetch_add(1, Ordering::SeqCst);
        });

        strand.wait_idle();
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }
}
