use crate::error::{BoxError, PoolError};
use crate::future::{FutureStatus, TaskFuture};
use crate::notifier::{TaskCompletionInfo, TaskCompletionStatus};
use crate::queue::DelayQueue;
use crate::shutdown::{ExecutorService, PendingTask, PoolState};
use crate::task::{next_task_id, saturating_after, Job, OneShotTask, RunReport, Runnable, TaskContext, TaskId};
use crate::worker::{CoreHandle, PoolCore, WorkerLimits};

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

lazy_static::lazy_static! {
  static ref TIMEOUT_DELAYER: Option<Scheduler> = match Scheduler::new(1, "timeout-delayer") {
    Ok(scheduler) => Some(scheduler),
    Err(e) => {
      error!("Failed to start the shared timeout delayer: {}", e);
      None
    }
  };
}

/// Process-wide single-thread scheduler that fires `or_timeout` deadlines.
pub(crate) fn timeout_delayer() -> Result<&'static Scheduler, PoolError> {
  TIMEOUT_DELAYER
    .as_ref()
    .ok_or_else(|| PoolError::WorkerSpawn("timeout delayer is unavailable".to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cadence {
  /// Due-times stay on the grid `first + k * period`.
  FixedRate(Duration),
  /// Next due-time is the end of the previous run plus the delay.
  FixedDelay(Duration),
}

impl Cadence {
  /// Due-time of the run after the one that was due at `nominal` and ended at `finished_at`.
  fn next_due(self, nominal: Instant, finished_at: Instant) -> Instant {
    match self {
      Cadence::FixedDelay(delay) => saturating_after(finished_at, delay),
      Cadence::FixedRate(period) => {
        let next = saturating_after(nominal, period);
        if next > finished_at {
          return next;
        }
        // Overrun: run once right away at the latest missed grid point, skip the others.
        let missed = finished_at.duration_since(nominal).as_nanos() / period.as_nanos();
        nominal + period * u32::try_from(missed).unwrap_or(u32::MAX)
      }
    }
  }
}

type PeriodicBody = Box<dyn FnMut(&TaskContext) -> Result<(), BoxError> + Send + 'static>;

/// A repeating task. Each run re-inserts the task with its next due-time until the handle is
/// cancelled, a run fails, or the scheduler shuts down.
struct PeriodicTask {
  task_id: TaskId,
  token: CancellationToken,
  future: TaskFuture<()>,
  body: PeriodicBody,
  cadence: Cadence,
  runs: Arc<AtomicU64>,
}

impl Runnable for PeriodicTask {
  fn run(self: Box<Self>, ctx: &TaskContext) -> RunReport {
    let mut this = self;
    if this.future.is_done() {
      return RunReport::finished(TaskCompletionStatus::Cancelled);
    }

    let result = panic::catch_unwind(AssertUnwindSafe(|| (this.body)(ctx)));
    let run = this.runs.fetch_add(1, AtomicOrdering::Relaxed) + 1;
    if ctx.is_cancelled() {
      this.future.finish_cancelled();
      return RunReport::finished(TaskCompletionStatus::Cancelled);
    }

    let outcome = match result {
      Ok(run_result) => run_result.map_err(PoolError::from_task_error),
      Err(payload) => Err(PoolError::from_panic(payload)),
    };
    let status = TaskCompletionStatus::from(&outcome);
    if let Err(error) = outcome {
      warn!(task_id = %this.task_id, run, %error, "Periodic run did not succeed; no further runs.");
      this.future.fail(error);
      return RunReport::finished(status);
    }

    if this.future.is_done() {
      debug!(task_id = %this.task_id, run, "Periodic task cancelled during its run; not re-scheduling.");
      return RunReport::finished(TaskCompletionStatus::Success);
    }

    let nominal = ctx.scheduled_time().unwrap_or_else(Instant::now);
    let due = this.cadence.next_due(nominal, Instant::now());
    trace!(task_id = %this.task_id, run, "Periodic task re-scheduled.");
    let (task_id, token) = (this.task_id, this.token.clone());
    RunReport {
      status: TaskCompletionStatus::Success,
      reschedule: Some(Job::new(task_id, token, this).due_at(due).repeating()),
    }
  }

  fn abandon(self: Box<Self>) {
    self.future.cancel(false);
  }

  fn is_settled(&self) -> bool {
    self.future.is_done()
  }
}

/// Handle to a repeating task.
///
/// The handle stays `Pending` across runs. It becomes `Cancelled` when cancelled or when the
/// scheduler shuts down, and `Failed` when a run fails or panics.
#[derive(Debug, Clone)]
pub struct PeriodicHandle {
  future: TaskFuture<()>,
  runs: Arc<AtomicU64>,
}

impl PeriodicHandle {
  pub fn id(&self) -> TaskId {
    self.future.id()
  }

  /// Stops future runs. An in-flight run is only interrupted when `interrupt_if_running` is set.
  pub fn cancel(&self, interrupt_if_running: bool) -> bool {
    self.future.cancel(interrupt_if_running)
  }

  pub fn is_cancelled(&self) -> bool {
    self.future.is_cancelled()
  }

  pub fn is_done(&self) -> bool {
    self.future.is_done()
  }

  pub fn status(&self) -> FutureStatus {
    self.future.status()
  }

  /// Runs started so far, including one that may still be executing.
  pub fn run_count(&self) -> u64 {
    self.runs.load(AtomicOrdering::Relaxed)
  }

  /// Blocks until the series ends. Always an error: `Cancelled`, or the failure of the last run.
  pub fn get(&self) -> Result<(), PoolError> {
    self.future.get()
  }

  pub fn get_timeout(&self, timeout: Duration) -> Result<(), PoolError> {
    self.future.get_timeout(timeout)
  }

  /// The underlying future, for use with the combinators.
  pub fn future(&self) -> TaskFuture<()> {
    self.future.clone()
  }
}

/// A pool of workers fed by a delay-ordered queue: tasks become eligible at their due-time.
#[derive(Clone)]
pub struct Scheduler {
  handle: Arc<CoreHandle>,
}

impl fmt::Debug for Scheduler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Scheduler")
      .field("name", &self.name())
      .field("state", &self.state())
      .field("workers", &self.worker_count())
      .field("scheduled", &self.queued_task_count())
      .finish()
  }
}

impl Scheduler {
  /// Starts `workers` persistent threads.
  ///
  /// # Errors
  /// `PoolError::WorkerSpawn` if a worker thread cannot be started.
  pub fn new(workers: usize, name: &str) -> Result<Self, PoolError> {
    let workers = workers.max(1);
    let limits = WorkerLimits {
      min_workers: workers,
      max_workers: Some(workers),
      keep_alive: None,
      spawn_on_demand: false,
    };
    let core = PoolCore::new(name, Arc::new(DelayQueue::new()), limits, Vec::new());
    core.prestart()?;
    Ok(Self {
      handle: CoreHandle::new(core, "Scheduler"),
    })
  }

  fn core(&self) -> &Arc<PoolCore> {
    self.handle.core()
  }

  /// Runs `task` as soon as a worker is free.
  pub fn submit<T, F>(&self, task: F) -> Result<TaskFuture<T>, PoolError>
  where
    T: Clone + Send + 'static,
    F: FnOnce(&TaskContext) -> Result<T, BoxError> + Send + 'static,
  {
    self.schedule(task, Duration::ZERO)
  }

  /// Like `submit`, but `task` is not eligible to run until `delay` has passed.
  ///
  /// # Errors
  /// `PoolError::RejectedSubmission` once the scheduler is shutting down.
  pub fn schedule<T, F>(&self, task: F, delay: Duration) -> Result<TaskFuture<T>, PoolError>
  where
    T: Clone + Send + 'static,
    F: FnOnce(&TaskContext) -> Result<T, BoxError> + Send + 'static,
  {
    let task_id = next_task_id();
    let token = CancellationToken::new();
    let future = TaskFuture::with_id(task_id);
    future.attach_interrupt(token.clone());

    let job = Job::new(task_id, token, Box::new(OneShotTask::new(future.clone(), Box::new(task))))
      .due_at(saturating_after(Instant::now(), delay));
    debug!(pool_name = %self.name(), %task_id, ?delay, "Scheduling delayed task.");
    self.core().dispatch(job)?;
    self.remove_on_cancel(&future);
    Ok(future)
  }

  /// Runs `task` after `initial_delay`, then on the grid `first_run + k * period`.
  ///
  /// Run durations do not shift the grid. A run that overruns its period is followed by one
  /// immediate run; the missed grid points in between are skipped.
  ///
  /// # Errors
  /// `PoolError::ZeroPeriod` for a zero `period`, `PoolError::RejectedSubmission` once the
  /// scheduler is shutting down.
  pub fn schedule_at_fixed_rate<F>(
    &self,
    task: F,
    initial_delay: Duration,
    period: Duration,
  ) -> Result<PeriodicHandle, PoolError>
  where
    F: FnMut(&TaskContext) -> Result<(), BoxError> + Send + 'static,
  {
    self.schedule_periodic(Box::new(task), initial_delay, Cadence::FixedRate(period))
  }

  /// Runs `task` after `initial_delay`, then `delay` after the end of each previous run.
  pub fn schedule_with_fixed_delay<F>(
    &self,
    task: F,
    initial_delay: Duration,
    delay: Duration,
  ) -> Result<PeriodicHandle, PoolError>
  where
    F: FnMut(&TaskContext) -> Result<(), BoxError> + Send + 'static,
  {
    self.schedule_periodic(Box::new(task), initial_delay, Cadence::FixedDelay(delay))
  }

  fn schedule_periodic(
    &self,
    body: PeriodicBody,
    initial_delay: Duration,
    cadence: Cadence,
  ) -> Result<PeriodicHandle, PoolError> {
    let (Cadence::FixedRate(interval) | Cadence::FixedDelay(interval)) = cadence;
    if interval.is_zero() {
      return Err(PoolError::ZeroPeriod);
    }

    let task_id = next_task_id();
    let token = CancellationToken::new();
    let future = TaskFuture::with_id(task_id);
    future.attach_interrupt(token.clone());
    let runs = Arc::new(AtomicU64::new(0));

    let periodic = PeriodicTask {
      task_id,
      token: token.clone(),
      future: future.clone(),
      body,
      cadence,
      runs: runs.clone(),
    };
    let job = Job::new(task_id, token, Box::new(periodic))
      .due_at(saturating_after(Instant::now(), initial_delay))
      .repeating();
    debug!(pool_name = %self.name(), %task_id, ?cadence, ?initial_delay, "Scheduling periodic task.");
    self.core().dispatch(job)?;
    self.remove_on_cancel(&future);
    Ok(PeriodicHandle { future, runs })
  }

  /// Takes a cancelled task out of the delay queue right away instead of at its due-time.
  fn remove_on_cancel<T: Clone + Send + 'static>(&self, future: &TaskFuture<T>) {
    let core: Weak<PoolCore> = Arc::downgrade(self.core());
    let task_id = future.id();
    future.on_terminal(move |outcome| {
      if !matches!(outcome, Err(PoolError::Cancelled)) {
        return;
      }
      if let Some(core) = core.upgrade() {
        let removed = core.queue.remove_if(&mut |job: &Job| job.task_id == task_id);
        if !removed.is_empty() {
          trace!(pool_name = %*core.name, %task_id, "Removed cancelled task from the delay queue.");
        }
      }
    });
  }

  pub fn add_completion_handler(&self, hook: impl Fn(&TaskCompletionInfo) + Send + Sync + 'static) {
    self.core().notifier.add_handler(Arc::new(hook));
  }

  pub fn active_task_count(&self) -> usize {
    self.core().active_task_count()
  }

  /// Entries waiting in the delay queue, due or not.
  pub fn queued_task_count(&self) -> usize {
    self.core().queued_task_count()
  }

  pub fn worker_count(&self) -> usize {
    self.core().lifecycle.worker_count()
  }

  pub fn purge(&self) -> usize {
    self.core().purge()
  }
}

impl ExecutorService for Scheduler {
  fn name(&self) -> &str {
    &self.core().name
  }

  fn state(&self) -> PoolState {
    self.core().lifecycle.state()
  }

  /// Cancels periodic tasks and stops accepting work. Delayed one-shot tasks still run when due.
  fn shutdown(&self) {
    self.core().shutdown();
  }

  fn shutdown_now(&self) -> Vec<PendingTask> {
    self.core().shutdown_now()
  }

  fn await_termination(&self, timeout: Duration) -> bool {
    self.core().lifecycle.await_termination(timeout)
  }
}
