use crate::error::PoolError;
use crate::task::TaskId;

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tracing::trace;

/// Outcome of one execution as reported to completion hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCompletionStatus {
  Success,
  Failed,
  Cancelled,
  Panicked,
}

impl<R> From<&Result<R, PoolError>> for TaskCompletionStatus {
  fn from(result: &Result<R, PoolError>) -> Self {
    match result {
      Ok(_) => TaskCompletionStatus::Success,
      Err(PoolError::Cancelled) => TaskCompletionStatus::Cancelled,
      Err(PoolError::TaskPanicked(_)) => TaskCompletionStatus::Panicked,
      Err(_) => TaskCompletionStatus::Failed,
    }
  }
}

/// What a completion hook learns about one finished execution.
#[derive(Debug, Clone)]
pub struct TaskCompletionInfo {
  pub task_id: TaskId,
  pub pool_name: Arc<String>,
  pub worker_id: usize,
  pub status: TaskCompletionStatus,
  pub completion_time: SystemTime,
}

/// After-execute hook. Runs on the worker thread that executed the task.
pub type CompletionHook = Arc<dyn Fn(&TaskCompletionInfo) + Send + Sync + 'static>;

/// Dispatches completion info to the registered hooks, in registration order.
///
/// Hooks are not guarded: a panicking hook takes its worker thread down, and the pool replaces
/// that worker.
pub(crate) struct CompletionNotifier {
  pool_name: Arc<String>,
  handlers: RwLock<Vec<CompletionHook>>,
}

impl fmt::Debug for CompletionNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let handler_count = self.handlers.try_read().map_or(0, |guard| guard.len());
    f.debug_struct("CompletionNotifier")
      .field("pool_name", &self.pool_name)
      .field("handler_count", &handler_count)
      .finish()
  }
}

impl CompletionNotifier {
  pub(crate) fn new(pool_name: Arc<String>, hooks: Vec<CompletionHook>) -> Self {
    Self {
      pool_name,
      handlers: RwLock::new(hooks),
    }
  }

  pub(crate) fn add_handler(&self, handler: CompletionHook) {
    let mut handlers_guard = self.handlers.write();
    handlers_guard.push(handler);
    trace!(pool_name = %*self.pool_name, "Added completion hook. Total hooks: {}", handlers_guard.len());
  }

  pub(crate) fn notify(&self, task_id: TaskId, worker_id: usize, status: TaskCompletionStatus) {
    // Clone the list so a hook may register further hooks without deadlocking.
    let handlers: Vec<CompletionHook> = self.handlers.read().clone();
    if handlers.is_empty() {
      return;
    }

    let info = TaskCompletionInfo {
      task_id,
      pool_name: self.pool_name.clone(),
      worker_id,
      status,
      completion_time: SystemTime::now(),
    };
    trace!(%task_id, ?status, "Dispatching completion info to {} hooks.", handlers.len());
    for handler in handlers {
      handler(&info);
    }
  }
}
