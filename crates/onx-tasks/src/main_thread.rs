use crate::{task_channel, TaskCanceled};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Queue of work that must run on the thread owning external resources
/// (entity registry mutations, GPU uploads elsewhere).
///
/// Worker threads call [`push`](Self::push) or
/// [`push_and_wait`](Self::push_and_wait); the owning thread calls
/// [`pump`](Self::pump) once per tick. Direct worker-to-owner calls are
/// forbidden by design.
pub struct MainThreadQueue {
    sender: crossbeam_channel::Sender<Job>,
    receiver: crossbeam_channel::Receiver<Job>,
}

impl MainThreadQueue {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }

    /// Queues a job without waiting for it.
    pub fn push(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.sender.send(Box::new(job));
    }

    /// Queues a job and blocks until the pump thread has executed it.
    ///
    /// # Errors
    /// Returns [`TaskCanceled`] if the queue is dropped before the job runs.
    pub fn push_and_wait<R: Send + Clone + 'static>(
        &self,
        job: impl FnOnce() -> R + Send + 'static,
    ) -> Result<R, TaskCanceled> {
        let (promise, future) = task_channel();
        self.push(move || {
            let _ = promise.fulfill(job());
        });
        future.wait()
    }

    /// Runs every currently queued job. Returns the number executed.
    pub fn pump(&self) -> usize {
        let mut executed = 0;
        while let Ok(job) = self.receiver.try_recv() {
            job();
            executed += 1;
        }
        executed
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl Default for MainThreadQueue {
    fn default() -> Self {
        Self::new()
    }
}
