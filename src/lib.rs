//! Thread-backed worker pools and schedulers whose tasks report through composable,
//! cancellable futures.
//!
//! A [`WorkerPool`] runs submitted closures on fixed, elastic or single-thread worker sets, and a
//! [`Scheduler`] adds delayed and periodic execution. Each submission returns a [`TaskFuture`]
//! that can be waited on, cancelled, completed by hand, or chained with combinators such as
//! [`TaskFuture::map`], [`TaskFuture::zip`], [`all`] and [`any`]. Both executors share the
//! two-phase shutdown of [`ExecutorService`].

mod compose;
mod config;
mod error;
mod future;
mod notifier;
mod pool;
mod queue;
mod scheduler;
mod shutdown;
mod task;
mod worker;

pub use compose::{all, any};
pub use config::{GrowthPolicy, PoolBuilder, PoolConfig, DEFAULT_IDLE_TIMEOUT, DEFAULT_POOL_NAME};
pub use error::{BoxError, PoolError, TaskFailure};
pub use future::{FutureStatus, TaskFuture};
pub use notifier::{CompletionHook, TaskCompletionInfo, TaskCompletionStatus};
pub use pool::WorkerPool;
pub use queue::{Delayed, DelayQueue, Dequeue, FifoQueue, HandoffQueue, QueueClosed, TaskQueue};
pub use scheduler::{PeriodicHandle, Scheduler};
pub use shutdown::{ExecutorService, PendingTask, PoolState};
pub use task::{Callable, TaskContext, TaskId, TaskToExecute};
