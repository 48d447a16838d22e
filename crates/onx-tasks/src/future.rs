use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};

/// Error returned by [`TaskFuture::wait`] when the promise side was dropped
/// without producing a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskCanceled;

impl std::fmt::Display for TaskCanceled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task was dropped before completing")
    }
}

impl std::error::Error for TaskCanceled {}

/// Fulfilling side of a one-shot task channel.
pub struct TaskPromise<T> {
    sender: oneshot::Sender<T>,
}

impl<T> TaskPromise<T> {
    /// Completes the task. Returns the value back if every future was dropped.
    pub fn fulfill(self, value: T) -> Result<(), T> {
        self.sender.send(value)
    }
}

/// Waiting side of a one-shot task channel.
///
/// Cloneable: every clone resolves to the same value. `wait` blocks the
/// calling thread; there is no continuation chaining, completion events are
/// delivered separately through the event bus.
pub struct TaskFuture<T: Clone> {
    shared: Shared<oneshot::Receiver<T>>,
}

impl<T: Clone> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone> TaskFuture<T> {
    /// Blocks until the task completes.
    pub fn wait(&self) -> Result<T, TaskCanceled> {
        futures::executor::block_on(self.shared.clone()).map_err(|_| TaskCanceled)
    }

    /// Non-blocking poll; `None` while the task is still pending.
    pub fn try_get(&self) -> Option<Result<T, TaskCanceled>> {
        self.shared
            .clone()
            .now_or_never()
            .map(|result| result.map_err(|_| TaskCanceled))
    }

    /// Creates an already-completed future, for operations that can be
    /// answered without queueing.
    pub fn ready(value: T) -> Self {
        let (promise, future) = task_channel();
        let _ = promise.fulfill(value);
        future
    }
}

/// Creates a linked promise/future pair.
pub fn task_channel<T: Clone>() -> (TaskPromise<T>, TaskFuture<T>) {
    let (sender, receiver) = oneshot::channel();
    (
        TaskPromise { sender },
        TaskFuture {
            shared: receiver.shared(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::{task_channel, TaskCanceled, TaskFuture};

    #[test]
    fn wait_returns_value_to_every_clone() {
        let (promise, future) = task_channel::<u32>();
        let other = future.clone();

        let waiter = std::thread::spawn(move || other.wait());
        promise.fulfill(7).unwrap();

        assert_eq!(future.wait(), Ok(7));
        assert_eq!(waiter.join().unwrap(), Ok(7));
    }

    #[test]
    fn dropped_promise_cancels() {
        let (promise, future) = task_channel::<u32>();
        drop(promise);
        assert_eq!(future.wait(), Err(TaskCanceled));
    }

    #[test]
    fn try_get_pending_then_ready() {
        let (promise, future) = task_channel::<&'static str>();
        assert!(future.try_get().is_none());
        promise.fulfill("done").unwrap();
        assert_eq!(future.try_get(), Some(Ok("done")));
    }

    #[test]
    fn ready_future() {
        assert_eq!(TaskFuture::ready(3).wait(), Ok(3));
    }
}
