use crate::error::PoolError;
use crate::task::{deadline_after, TaskId};

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a pool or scheduler. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PoolState {
  Running,
  ShuttingDown,
  Terminated,
}

/// A task that was still queued when `shutdown_now` ran. Its future is already cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTask {
  task_id: TaskId,
  due: Instant,
  periodic: bool,
}

impl PendingTask {
  pub(crate) fn new(task_id: TaskId, due: Instant, periodic: bool) -> Self {
    Self { task_id, due, periodic }
  }

  pub fn task_id(&self) -> TaskId {
    self.task_id
  }

  /// When the task was (or would have been) eligible to run.
  pub fn due(&self) -> Instant {
    self.due
  }

  pub fn is_periodic(&self) -> bool {
    self.periodic
  }
}

/// Two-phase shutdown shared by [`WorkerPool`](crate::WorkerPool) and
/// [`Scheduler`](crate::Scheduler).
pub trait ExecutorService {
  fn name(&self) -> &str;

  fn state(&self) -> PoolState;

  /// Phase 1: stop accepting work and let queued tasks drain.
  fn shutdown(&self);

  /// Phase 2: cancel every queued task, interrupt running ones, and return what was queued.
  fn shutdown_now(&self) -> Vec<PendingTask>;

  /// Blocks until the pool is terminated or `timeout` elapses. Returns `true` if terminated.
  fn await_termination(&self, timeout: Duration) -> bool;

  fn is_shutdown(&self) -> bool {
    self.state() != PoolState::Running
  }

  fn is_terminated(&self) -> bool {
    self.state() == PoolState::Terminated
  }

  /// `shutdown`, wait, escalate to `shutdown_now`, wait again.
  ///
  /// # Errors
  /// `PoolError::DidNotTerminate` if the pool is still alive after the second wait.
  fn shutdown_and_await_termination(&self, timeout: Duration) -> Result<(), PoolError> {
    self.shutdown();
    if self.await_termination(timeout) {
      return Ok(());
    }

    warn!(pool_name = %self.name(), ?timeout, "Pool did not drain in time. Escalating to shutdown_now.");
    let pending = self.shutdown_now();
    debug!(pool_name = %self.name(), "shutdown_now cancelled {} queued tasks.", pending.len());

    if self.await_termination(timeout) {
      Ok(())
    } else {
      error!(pool_name = %self.name(), "Executor did not terminate");
      Err(PoolError::DidNotTerminate {
        pool_name: self.name().to_string(),
      })
    }
  }
}

struct LifecycleInner {
  state: PoolState,
  workers: usize,
}

/// Owns the lifecycle state and the live-worker count of one pool.
pub(crate) struct ShutdownCoordinator {
  pool_name: Arc<String>,
  inner: Mutex<LifecycleInner>,
  terminated: Condvar,
  stop_token: CancellationToken,
}

impl ShutdownCoordinator {
  pub(crate) fn new(pool_name: Arc<String>) -> Self {
    Self {
      pool_name,
      inner: Mutex::new(LifecycleInner {
        state: PoolState::Running,
        workers: 0,
      }),
      terminated: Condvar::new(),
      stop_token: CancellationToken::new(),
    }
  }

  pub(crate) fn state(&self) -> PoolState {
    self.inner.lock().state
  }

  pub(crate) fn is_running(&self) -> bool {
    self.state() == PoolState::Running
  }

  /// True once `shutdown_now` has been requested.
  pub(crate) fn is_stopping(&self) -> bool {
    self.stop_token.is_cancelled()
  }

  pub(crate) fn worker_count(&self) -> usize {
    self.inner.lock().workers
  }

  /// `Running -> ShuttingDown`. Returns `true` for the call that made the transition.
  pub(crate) fn begin_shutdown(&self) -> bool {
    let mut inner = self.inner.lock();
    if inner.state != PoolState::Running {
      return false;
    }
    inner.state = PoolState::ShuttingDown;
    info!(pool_name = %*self.pool_name, "Pool transitioned Running -> ShuttingDown.");
    true
  }

  /// Phase 2 marker. Returns `true` for the first call.
  pub(crate) fn begin_stop(&self) -> bool {
    self.begin_shutdown();
    if self.stop_token.is_cancelled() {
      return false;
    }
    self.stop_token.cancel();
    true
  }

  /// Reserves a slot for a new worker. New workers are refused once the pool is shutting down
  /// unless `for_replacement` is set and the pool has not been stopped.
  pub(crate) fn try_add_worker(&self, limit: Option<usize>, for_replacement: bool) -> bool {
    let mut inner = self.inner.lock();
    let allowed = match inner.state {
      PoolState::Running => true,
      PoolState::ShuttingDown => for_replacement && !self.stop_token.is_cancelled(),
      PoolState::Terminated => false,
    };
    if !allowed || limit.is_some_and(|max| inner.workers >= max) {
      return false;
    }
    inner.workers += 1;
    true
  }

  /// Releases an idle worker's slot if more than `min_workers` remain.
  pub(crate) fn try_retire_worker(&self, min_workers: usize) -> bool {
    let mut inner = self.inner.lock();
    if inner.state == PoolState::Running && inner.workers > min_workers {
      inner.workers -= 1;
      true
    } else {
      false
    }
  }

  pub(crate) fn release_worker(&self) {
    let mut inner = self.inner.lock();
    inner.workers = inner.workers.saturating_sub(1);
  }

  /// `ShuttingDown -> Terminated` once no worker is left and nothing is queued.
  pub(crate) fn try_terminate(&self, queue_is_empty: bool) -> bool {
    let mut inner = self.inner.lock();
    if inner.state != PoolState::ShuttingDown || inner.workers > 0 || !queue_is_empty {
      return inner.state == PoolState::Terminated;
    }
    inner.state = PoolState::Terminated;
    drop(inner);
    self.terminated.notify_all();
    info!(pool_name = %*self.pool_name, "Pool terminated.");
    true
  }

  pub(crate) fn await_termination(&self, timeout: Duration) -> bool {
    let deadline = deadline_after(timeout);
    let mut inner = self.inner.lock();
    while inner.state != PoolState::Terminated {
      match deadline {
        Some(deadline) => {
          if self.terminated.wait_until(&mut inner, deadline).timed_out() {
            return inner.state == PoolState::Terminated;
          }
        }
        None => self.terminated.wait(&mut inner),
      }
    }
    true
  }
}
