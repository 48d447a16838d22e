use std::thread::JoinHandle;

use tracing::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads draining a shared job channel.
///
/// Jobs are executed in arbitrary order and concurrently; callers that need
/// ordering layer a [`crate::SerialExecutor`] on top. Dropping the pool closes
/// the channel and joins every worker.
pub struct ThreadPool {
    sender: Option<crossbeam_channel::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Creates a pool with one worker per available CPU core.
    pub fn new() -> Self {
        Self::with_workers(num_cpus::get().max(1))
    }

    /// Creates a pool with an explicit worker count (at least one).
    pub fn with_workers(count: usize) -> Self {
        let count = count.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();

        let workers = (0..count)
            .map(|index| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("onx-worker-{}", index))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            let result = std::panic::catch_unwind(
                                std::panic::AssertUnwindSafe(job),
                            );
                            if result.is_err() {
                                warn!("worker job panicked, thread kept alive");
                            }
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Queues a job for execution on any worker.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            // Send can only fail after the pool started shutting down.
            let _ = sender.send(Box::new(job));
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Disconnect the channel so workers fall out of their recv loop.
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::ThreadPool;

    #[test]
    fn executes_all_jobs() {
        let pool = ThreadPool::with_workers(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        drop(pool); // joins workers
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn survives_panicking_job() {
        let pool = ThreadPool::with_workers(1);
        let counter = Arc::new(AtomicUsize::new(0));

        pool.spawn(|| panic!("boom"));
        let c = Arc::clone(&counter);
        pool.spawn(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
