//! Task scheduling primitives shared by the asset runtime.
//!
//! The engine runs mutating work on *strands*: FIFO serializers layered on a
//! shared [`ThreadPool`]. Completion is signalled through one-shot shared
//! [`TaskFuture`]s, and work that must touch main-thread-owned resources is
//! routed through a [`MainThreadQueue`].

// crate-specific lint exceptions:
//#![allow()]

mod event_bus;
pub use event_bus::EventBus;

mod future;
pub use future::{task_channel, TaskCanceled, TaskFuture, TaskPromise};

mod main_thread;
pub use main_thread::MainThreadQueue;

mod serial_executor;
pub use serial_executor::SerialExecutor;

mod thread_pool;
pub use thread_pool::ThreadPool;
