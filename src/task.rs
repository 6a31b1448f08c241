use crate::error::{BoxError, PoolError};
use crate::future::TaskFuture;
use crate::notifier::TaskCompletionStatus;
use crate::queue::Delayed;
use crate::shutdown::PendingTask;

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::thread;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

lazy_static::lazy_static! {
  static ref NEXT_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
}

/// Process-unique identifier of a submitted task, used for diagnostics.
pub type TaskId = u64;

pub(crate) fn next_task_id() -> TaskId {
  NEXT_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Stand-in for delays too large to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// End of a wait of `timeout` from now, or `None` when that lies beyond what `Instant` can
/// represent. Callers treat `None` as "wait without a deadline".
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
  Instant::now().checked_add(timeout)
}

/// `base + delay`, saturating to roughly a century out instead of overflowing.
pub(crate) fn saturating_after(base: Instant, delay: Duration) -> Instant {
  base
    .checked_add(delay)
    .or_else(|| base.checked_add(FAR_FUTURE))
    .unwrap_or(base)
}

/// An asynchronous task body. It is driven to completion on a worker thread.
pub type TaskToExecute<T> = Pin<Box<dyn Future<Output = Result<T, BoxError>> + Send + 'static>>;

const SLEEP_SLICE: Duration = Duration::from_millis(5);

/// Per-run view a task body gets of its own execution.
///
/// Cancellation is cooperative: an interrupting cancel or `shutdown_now` only fires the token,
/// and a body that never looks at it runs to the end.
#[derive(Debug, Clone)]
pub struct TaskContext {
  task_id: TaskId,
  token: CancellationToken,
  scheduled_time: Option<Instant>,
}

impl TaskContext {
  pub(crate) fn new(task_id: TaskId, token: CancellationToken, scheduled_time: Option<Instant>) -> Self {
    Self {
      task_id,
      token,
      scheduled_time,
    }
  }

  pub fn task_id(&self) -> TaskId {
    self.task_id
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  /// The token that fires when this task is interrupted.
  pub fn token(&self) -> &CancellationToken {
    &self.token
  }

  /// Nominal due-time of this run. For plain pool submissions this is the submission time.
  pub fn scheduled_time(&self) -> Option<Instant> {
    self.scheduled_time
  }

  /// Returns `Err(PoolError::Cancelled)` once the task has been interrupted, so a body can
  /// bail out with `ctx.checkpoint()?`.
  pub fn checkpoint(&self) -> Result<(), PoolError> {
    if self.token.is_cancelled() {
      Err(PoolError::Cancelled)
    } else {
      Ok(())
    }
  }

  /// Sleeps for `duration`, waking early with `Err(PoolError::Cancelled)` if interrupted.
  pub fn sleep(&self, duration: Duration) -> Result<(), PoolError> {
    let deadline = deadline_after(duration);
    loop {
      self.checkpoint()?;
      let slice = match deadline {
        Some(deadline) => {
          let now = Instant::now();
          if now >= deadline {
            return Ok(());
          }
          SLEEP_SLICE.min(deadline - now)
        }
        None => SLEEP_SLICE,
      };
      thread::sleep(slice);
    }
  }
}

/// A unit of work: invoked once, producing a value or an error.
///
/// Implemented for every `FnOnce(&TaskContext) -> Result<T, BoxError>` closure; implement it
/// directly for task types that carry their own state.
pub trait Callable<T>: Send + 'static {
  fn call(self: Box<Self>, ctx: &TaskContext) -> Result<T, BoxError>;
}

impl<T, F> Callable<T> for F
where
  F: FnOnce(&TaskContext) -> Result<T, BoxError> + Send + 'static,
{
  fn call(self: Box<Self>, ctx: &TaskContext) -> Result<T, BoxError> {
    (*self)(ctx)
  }
}

/// Type-erased work item as it travels through a queue.
pub(crate) trait Runnable: Send + 'static {
  fn run(self: Box<Self>, ctx: &TaskContext) -> RunReport;

  /// Called instead of `run` when the job is discarded without executing.
  fn abandon(self: Box<Self>);

  /// True once the owning future is terminal, e.g. cancelled while queued.
  fn is_settled(&self) -> bool;
}

pub(crate) struct RunReport {
  pub(crate) status: TaskCompletionStatus,
  /// Follow-up run of the same task, for periodic work.
  pub(crate) reschedule: Option<Job>,
}

impl RunReport {
  pub(crate) fn finished(status: TaskCompletionStatus) -> Self {
    Self {
      status,
      reschedule: None,
    }
  }
}

/// Internal representation of a task managed by a pool.
pub(crate) struct Job {
  pub(crate) task_id: TaskId,
  pub(crate) token: CancellationToken,
  pub(crate) due: Instant,
  pub(crate) periodic: bool,
  pub(crate) runnable: Box<dyn Runnable>,
}

impl Job {
  pub(crate) fn new(task_id: TaskId, token: CancellationToken, runnable: Box<dyn Runnable>) -> Self {
    Self {
      task_id,
      token,
      due: Instant::now(),
      periodic: false,
      runnable,
    }
  }

  /// Defers eligibility until `due`.
  pub(crate) fn due_at(mut self, due: Instant) -> Self {
    self.due = due;
    self
  }

  pub(crate) fn repeating(mut self) -> Self {
    self.periodic = true;
    self
  }

  pub(crate) fn run(self) -> RunReport {
    let ctx = TaskContext::new(self.task_id, self.token, Some(self.due));
    self.runnable.run(&ctx)
  }

  pub(crate) fn is_settled(&self) -> bool {
    self.runnable.is_settled()
  }

  pub(crate) fn abandon(self) -> PendingTask {
    trace!(task_id = %self.task_id, "Abandoning job without running it.");
    let pending = PendingTask::new(self.task_id, self.due, self.periodic);
    self.runnable.abandon();
    pending
  }
}

impl Delayed for Job {
  fn due(&self) -> Instant {
    self.due
  }
}

/// A one-shot synchronous task completing a [`TaskFuture`].
pub(crate) struct OneShotTask<T> {
  future: TaskFuture<T>,
  callable: Box<dyn Callable<T>>,
}

impl<T: Clone + Send + 'static> OneShotTask<T> {
  pub(crate) fn new(future: TaskFuture<T>, callable: Box<dyn Callable<T>>) -> Self {
    Self { future, callable }
  }
}

impl<T: Clone + Send + 'static> Runnable for OneShotTask<T> {
  fn run(self: Box<Self>, ctx: &TaskContext) -> RunReport {
    let OneShotTask { future, callable } = *self;
    if !future.try_start() {
      debug!(task_id = %ctx.task_id(), "Dequeued task already settled (cancelled before start); skipping.");
      return RunReport::finished(TaskCompletionStatus::Cancelled);
    }
    let result = panic::catch_unwind(AssertUnwindSafe(move || callable.call(ctx)));
    RunReport::finished(settle_run(&future, ctx, result))
  }

  fn abandon(self: Box<Self>) {
    self.future.cancel(false);
  }

  fn is_settled(&self) -> bool {
    self.future.is_done()
  }
}

/// A one-shot asynchronous task, raced against its cancellation token.
pub(crate) struct AsyncTask<T> {
  future: TaskFuture<T>,
  body: TaskToExecute<T>,
}

impl<T: Clone + Send + 'static> AsyncTask<T> {
  pub(crate) fn new(future: TaskFuture<T>, body: TaskToExecute<T>) -> Self {
    Self { future, body }
  }
}

impl<T: Clone + Send + 'static> Runnable for AsyncTask<T> {
  fn run(self: Box<Self>, ctx: &TaskContext) -> RunReport {
    let AsyncTask { future, body } = *self;
    if !future.try_start() {
      debug!(task_id = %ctx.task_id(), "Dequeued async task already settled; skipping.");
      return RunReport::finished(TaskCompletionStatus::Cancelled);
    }

    let token = ctx.token().clone();
    let execution_outcome = futures::executor::block_on(async move {
      tokio::select! {
        biased;
        _ = token.cancelled() => None,
        task_result = AssertUnwindSafe(body).catch_unwind() => Some(task_result),
      }
    });

    let status = match execution_outcome {
      Some(result) => settle_run(&future, ctx, result),
      None => {
        debug!(task_id = %ctx.task_id(), "Async task execution cancelled by its token.");
        future.finish_cancelled();
        TaskCompletionStatus::Cancelled
      }
    };
    RunReport::finished(status)
  }

  fn abandon(self: Box<Self>) {
    self.future.cancel(false);
  }

  fn is_settled(&self) -> bool {
    self.future.is_done()
  }
}

/// Moves `future` to the terminal state matching one execution's result.
///
/// An interrupted task ends `Cancelled` whatever it returned, including when the interrupt
/// lands after the token check below.
pub(crate) fn settle_run<T: Clone + Send + 'static>(
  future: &TaskFuture<T>,
  ctx: &TaskContext,
  result: thread::Result<Result<T, BoxError>>,
) -> TaskCompletionStatus {
  let outcome = if ctx.is_cancelled() {
    Err(PoolError::Cancelled)
  } else {
    match result {
      Ok(task_result) => task_result.map_err(PoolError::from_task_error),
      Err(panic_payload) => {
        let error = PoolError::from_panic(panic_payload);
        debug!(task_id = %ctx.task_id(), %error, "Task panicked during execution.");
        Err(error)
      }
    }
  };
  let status = TaskCompletionStatus::from(&outcome);
  future.settle(outcome);
  if future.is_cancelled() {
    TaskCompletionStatus::Cancelled
  } else {
    status
  }
}
