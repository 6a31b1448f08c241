use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Error type returned by task bodies. Any `std::error::Error` converts into it with `?`.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors surfaced by pools, schedulers and futures of `futures_conductor`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
  #[error("Pool '{pool_name}' is shutting down or terminated, cannot accept new tasks")]
  RejectedSubmission { pool_name: String },

  #[error("Task failed asynchronously: {0}")]
  TaskFailure(#[source] TaskFailure),

  #[error("Task panicked: {0}")]
  TaskPanicked(String),

  #[error("Task was cancelled")]
  Cancelled,

  #[error("Timed out waiting for task outcome")]
  Timeout,

  #[error("{} branches failed", .0.len())]
  AggregateFailure(Vec<PoolError>),

  #[error("Failed to spawn worker thread: {0}")]
  WorkerSpawn(String),

  #[error("Period of a repeating task must be greater than zero")]
  ZeroPeriod,

  #[error("Pool '{pool_name}' did not terminate")]
  DidNotTerminate { pool_name: String },
}

impl PoolError {
  /// Wraps an error raised by a task body, preserving it as the cause.
  ///
  /// A body that bails out with [`PoolError`] itself is passed through unchanged, so a
  /// `checkpoint()?` inside a task still reads as a cancellation.
  pub fn from_task_error(error: BoxError) -> Self {
    match error.downcast::<PoolError>() {
      Ok(pool_error) => *pool_error,
      Err(other) => PoolError::TaskFailure(TaskFailure::new(other)),
    }
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, PoolError::Cancelled)
  }

  pub fn is_timeout(&self) -> bool {
    matches!(self, PoolError::Timeout)
  }

  pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
    let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
      (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
      s.clone()
    } else {
      "non-string panic payload".to_string()
    };
    PoolError::TaskPanicked(message)
  }
}

/// The original error raised by a task body, shared between every observer of the future.
#[derive(Clone)]
pub struct TaskFailure {
  cause: Arc<dyn StdError + Send + Sync + 'static>,
}

impl TaskFailure {
  pub fn new(cause: BoxError) -> Self {
    Self { cause: Arc::from(cause) }
  }

  /// The error exactly as the task raised it.
  pub fn cause(&self) -> &(dyn StdError + Send + Sync + 'static) {
    &*self.cause
  }
}

/// Two failures are equal when they share the same underlying error.
impl PartialEq for TaskFailure {
  fn eq(&self, other: &Self) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(&self.cause), Arc::as_ptr(&other.cause))
  }
}

impl fmt::Debug for TaskFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("TaskFailure").field(&self.cause).finish()
  }
}

impl fmt::Display for TaskFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&self.cause, f)
  }
}

impl StdError for TaskFailure {
  fn source(&self) -> Option<&(dyn StdError + 'static)> {
    Some(&*self.cause)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn task_error_is_wrapped_with_cause_preserved() {
    let err = PoolError::from_task_error("disk on fire".into());
    match &err {
      PoolError::TaskFailure(failure) => assert_eq!(failure.cause().to_string(), "disk on fire"),
      other => panic!("Expected TaskFailure, got {:?}", other),
    }
    assert_eq!(err.to_string(), "Task failed asynchronously: disk on fire");
  }

  #[test]
  fn pool_error_from_body_is_not_rewrapped() {
    let err = PoolError::from_task_error(Box::new(PoolError::Cancelled));
    assert!(err.is_cancelled());
  }

  #[test]
  fn panic_payloads_become_messages() {
    let err = PoolError::from_panic(Box::new("boom"));
    assert!(matches!(err, PoolError::TaskPanicked(ref m) if m == "boom"));
    let err = PoolError::from_panic(Box::new(String::from("owned boom")));
    assert!(matches!(err, PoolError::TaskPanicked(ref m) if m == "owned boom"));
  }
}
