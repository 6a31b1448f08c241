use crate::error::{BoxError, PoolError};
use crate::task::{deadline_after, next_task_id, TaskId};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Callback invoked once with the terminal outcome of a future.
pub(crate) type Continuation<T> = Box<dyn FnOnce(&Result<T, PoolError>) + Send + 'static>;

type Deferred = Box<dyn FnOnce()>;

thread_local! {
  /// Continuations queued on this thread while an outer settle drains them. `None` when no
  /// settle is running here.
  static DEFERRED: RefCell<Option<VecDeque<Deferred>>> = const { RefCell::new(None) };
}

/// Runs `batch` without nesting settles on the stack.
///
/// The outermost call on a thread drains a FIFO of continuations; a settle made from inside a
/// continuation only appends its own batch. Deep dependent chains therefore run in constant
/// stack space, and each future's continuations still run in registration order.
fn run_continuations(batch: Vec<Deferred>) {
  let outermost = DEFERRED.with(|slot| {
    let mut slot = slot.borrow_mut();
    if let Some(queue) = slot.as_mut() {
      queue.extend(batch);
      return false;
    }
    *slot = Some(VecDeque::from(batch));
    true
  });
  if !outermost {
    return;
  }

  let mut first_panic = None;
  while let Some(job) = DEFERRED.with(|slot| slot.borrow_mut().as_mut().and_then(VecDeque::pop_front)) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
      first_panic.get_or_insert(payload);
    }
  }
  DEFERRED.with(|slot| slot.borrow_mut().take());
  if let Some(payload) = first_panic {
    panic::resume_unwind(payload);
  }
}

/// Observable lifecycle position of a [`TaskFuture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureStatus {
  Pending,
  Running,
  Completed,
  Failed,
  Cancelled,
}

impl FutureStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, FutureStatus::Completed | FutureStatus::Failed | FutureStatus::Cancelled)
  }
}

enum State<T> {
  Pending,
  Running,
  Completed(T),
  Failed(PoolError),
  Cancelled,
}

impl<T: Clone> State<T> {
  fn status(&self) -> FutureStatus {
    match self {
      State::Pending => FutureStatus::Pending,
      State::Running => FutureStatus::Running,
      State::Completed(_) => FutureStatus::Completed,
      State::Failed(_) => FutureStatus::Failed,
      State::Cancelled => FutureStatus::Cancelled,
    }
  }

  fn outcome(&self) -> Option<Result<T, PoolError>> {
    match self {
      State::Pending | State::Running => None,
      State::Completed(value) => Some(Ok(value.clone())),
      State::Failed(error) => Some(Err(error.clone())),
      State::Cancelled => Some(Err(PoolError::Cancelled)),
    }
  }
}

struct Inner<T> {
  state: State<T>,
  continuations: Vec<Continuation<T>>,
  interrupt: Option<CancellationToken>,
  cancel_requested: bool,
}

struct Shared<T> {
  id: TaskId,
  inner: Mutex<Inner<T>>,
  settled: Condvar,
}

/// Handle to the eventual outcome of one task.
///
/// A `TaskFuture` moves through `Pending -> Running -> {Completed, Failed, Cancelled}`. Exactly
/// one terminal transition ever happens; every later attempt to complete, fail or cancel is a
/// no-op that returns `false`. Clones share the same state, so any clone can observe or
/// complete it.
///
/// Continuations registered before the terminal transition run in registration order on the
/// thread performing that transition, before the outermost settling call returns. Continuations
/// registered afterwards run immediately on the registering thread.
pub struct TaskFuture<T> {
  shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskFuture<T> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<T: Clone + Send + 'static> fmt::Debug for TaskFuture<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskFuture")
      .field("id", &self.shared.id)
      .field("status", &self.status())
      .finish_non_exhaustive()
  }
}

impl<T: Clone + Send + 'static> Default for TaskFuture<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Clone + Send + 'static> TaskFuture<T> {
  /// Creates a pending future with no task attached, to be settled by
  /// [`complete`](Self::complete) or [`complete_exceptionally`](Self::complete_exceptionally).
  pub fn new() -> Self {
    Self::with_id(next_task_id())
  }

  pub(crate) fn with_id(id: TaskId) -> Self {
    Self {
      shared: Arc::new(Shared {
        id,
        inner: Mutex::new(Inner {
          state: State::Pending,
          continuations: Vec::new(),
          interrupt: None,
          cancel_requested: false,
        }),
        settled: Condvar::new(),
      }),
    }
  }

  /// A future that is already completed with `value`.
  pub fn completed(value: T) -> Self {
    let future = Self::new();
    future.complete(value);
    future
  }

  /// A future that has already failed with `error`.
  pub fn failed(error: PoolError) -> Self {
    let future = Self::new();
    future.fail(error);
    future
  }

  pub fn id(&self) -> TaskId {
    self.shared.id
  }

  pub fn status(&self) -> FutureStatus {
    self.shared.inner.lock().state.status()
  }

  pub fn is_done(&self) -> bool {
    self.status().is_terminal()
  }

  pub fn is_cancelled(&self) -> bool {
    self.status() == FutureStatus::Cancelled
  }

  /// True when the future failed, was cancelled or timed out.
  pub fn is_completed_exceptionally(&self) -> bool {
    matches!(self.status(), FutureStatus::Failed | FutureStatus::Cancelled)
  }

  /// True once an interrupting cancel has been requested, even if the task has not yet
  /// observed it.
  pub fn is_cancellation_requested(&self) -> bool {
    let inner = self.shared.inner.lock();
    inner.cancel_requested || inner.interrupt.as_ref().is_some_and(|t| t.is_cancelled())
  }

  /// Blocks until the future is terminal and returns its outcome.
  ///
  /// # Errors
  /// Returns `PoolError::TaskFailure` (original cause preserved) or `PoolError::TaskPanicked`
  /// if the task failed, and `PoolError::Cancelled` if it was cancelled.
  pub fn get(&self) -> Result<T, PoolError> {
    let mut inner = self.shared.inner.lock();
    loop {
      if let Some(outcome) = inner.state.outcome() {
        return outcome;
      }
      self.shared.settled.wait(&mut inner);
    }
  }

  /// Like [`get`](Self::get) but gives up with `PoolError::Timeout` once `timeout` elapses.
  /// The underlying task is left running.
  pub fn get_timeout(&self, timeout: Duration) -> Result<T, PoolError> {
    let Some(deadline) = deadline_after(timeout) else {
      return self.get();
    };
    let mut inner = self.shared.inner.lock();
    loop {
      if let Some(outcome) = inner.state.outcome() {
        return outcome;
      }
      if self.shared.settled.wait_until(&mut inner, deadline).timed_out() {
        return inner.state.outcome().unwrap_or(Err(PoolError::Timeout));
      }
    }
  }

  /// Returns the outcome if terminal, without blocking.
  pub fn try_get(&self) -> Option<Result<T, PoolError>> {
    self.shared.inner.lock().state.outcome()
  }

  /// Attempts to cancel the task behind this future.
  ///
  /// A pending future is cancelled immediately and its task never runs. A running task is only
  /// interrupted when `interrupt_if_running` is set: its cancellation token fires and the
  /// future becomes `Cancelled` once the task returns. Returns `false` when the future is
  /// already terminal or when a running task is left alone.
  pub fn cancel(&self, interrupt_if_running: bool) -> bool {
    let mut inner = self.shared.inner.lock();
    match inner.state.status() {
      FutureStatus::Pending => {
        if interrupt_if_running {
          inner.cancel_requested = true;
          if let Some(token) = &inner.interrupt {
            token.cancel();
          }
        }
        trace!(task_id = %self.shared.id, "Cancelling pending future.");
        self.settle_locked(inner, State::Cancelled);
        true
      }
      FutureStatus::Running if interrupt_if_running => match inner.interrupt.clone() {
        Some(token) => {
          inner.cancel_requested = true;
          drop(inner);
          trace!(task_id = %self.shared.id, "Interrupting running task.");
          token.cancel();
          true
        }
        None => false,
      },
      _ => false,
    }
  }

  /// Completes the future with `value`. Only the first settling call wins.
  pub fn complete(&self, value: T) -> bool {
    self.settle_state(State::Completed(value))
  }

  /// Fails the future with `error`, which is kept as the cause of a `PoolError::TaskFailure`.
  /// Only the first settling call wins.
  pub fn complete_exceptionally(&self, error: impl Into<BoxError>) -> bool {
    self.fail(PoolError::from_task_error(error.into()))
  }

  pub(crate) fn fail(&self, error: PoolError) -> bool {
    if error.is_cancelled() {
      return self.settle_state(State::Cancelled);
    }
    self.settle_state(State::Failed(error))
  }

  pub(crate) fn settle(&self, outcome: Result<T, PoolError>) -> bool {
    match outcome {
      Ok(value) => self.complete(value),
      Err(error) => self.fail(error),
    }
  }

  pub(crate) fn finish_cancelled(&self) -> bool {
    self.settle_state(State::Cancelled)
  }

  pub(crate) fn attach_interrupt(&self, token: CancellationToken) {
    self.shared.inner.lock().interrupt = Some(token);
  }

  /// `Pending -> Running`. Fails if the future was cancelled or settled before the task started.
  pub(crate) fn try_start(&self) -> bool {
    let mut inner = self.shared.inner.lock();
    if matches!(inner.state, State::Pending) {
      inner.state = State::Running;
      true
    } else {
      false
    }
  }

  /// Registers `continuation` to run exactly once with the terminal outcome.
  pub(crate) fn on_terminal(&self, continuation: impl FnOnce(&Result<T, PoolError>) + Send + 'static) {
    let mut inner = self.shared.inner.lock();
    match inner.state.outcome() {
      Some(outcome) => {
        drop(inner);
        continuation(&outcome);
      }
      None => inner.continuations.push(Box::new(continuation)),
    }
  }

  fn settle_state(&self, next: State<T>) -> bool {
    let inner = self.shared.inner.lock();
    if inner.state.status().is_terminal() {
      return false;
    }
    // An interrupt accepted while running outranks whatever the task produced afterwards.
    if inner.cancel_requested && matches!(inner.state, State::Running) && !matches!(next, State::Cancelled) {
      self.settle_locked(inner, State::Cancelled);
      return false;
    }
    self.settle_locked(inner, next);
    true
  }

  fn settle_locked(&self, mut inner: MutexGuard<'_, Inner<T>>, next: State<T>) {
    inner.state = next;
    let continuations = std::mem::take(&mut inner.continuations);
    let outcome = if continuations.is_empty() {
      None
    } else {
      inner.state.outcome()
    };
    drop(inner);
    self.shared.settled.notify_all();

    if let Some(outcome) = outcome {
      let outcome = Arc::new(outcome);
      let batch = continuations
        .into_iter()
        .map(|continuation| {
          let outcome = outcome.clone();
          Box::new(move || continuation(&*outcome)) as Deferred
        })
        .collect();
      run_continuations(batch);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  #[test]
  fn second_complete_is_a_noop() {
    let future = TaskFuture::new();
    assert!(future.complete(7));
    assert!(!future.complete(8));
    assert!(!future.complete_exceptionally("late"));
    assert_eq!(future.get().unwrap(), 7);
  }

  #[test]
  fn cancel_pending_is_final() {
    let future = TaskFuture::<u32>::new();
    assert!(future.cancel(false));
    assert!(future.is_cancelled());
    assert!(!future.complete(1));
    assert!(!future.cancel(true));
    assert!(matches!(future.get(), Err(PoolError::Cancelled)));
  }

  #[test]
  fn running_future_refuses_non_interrupting_cancel() {
    let future = TaskFuture::<u32>::new();
    let token = CancellationToken::new();
    future.attach_interrupt(token.clone());
    assert!(future.try_start());
    assert!(!future.cancel(false));
    assert!(!token.is_cancelled());

    assert!(future.cancel(true));
    assert!(token.is_cancelled());
    assert_eq!(future.status(), FutureStatus::Running);
    assert!(future.is_cancellation_requested());

    future.finish_cancelled();
    assert!(future.is_cancelled());
  }

  #[test]
  fn continuations_fire_in_registration_order_and_late_ones_fire_immediately() {
    let future = TaskFuture::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for i in 0..3 {
      let seen = seen.clone();
      future.on_terminal(move |outcome: &Result<u32, PoolError>| {
        seen.lock().push((i, outcome.clone().unwrap()));
      });
    }
    assert!(seen.lock().is_empty());
    future.complete(5);
    assert_eq!(*seen.lock(), vec![(0, 5), (1, 5), (2, 5)]);

    let seen_late = seen.clone();
    future.on_terminal(move |outcome| seen_late.lock().push((3, outcome.clone().unwrap())));
    assert_eq!(seen.lock().last(), Some(&(3, 5)));
  }

  #[test]
  fn completion_after_accepted_interrupt_settles_cancelled() {
    let future = TaskFuture::<u32>::new();
    future.attach_interrupt(CancellationToken::new());
    assert!(future.try_start());
    assert!(future.cancel(true));

    assert!(!future.complete(5));
    assert!(future.is_cancelled());
    assert!(matches!(future.get(), Err(PoolError::Cancelled)));
  }

  #[test]
  fn nested_settles_run_after_the_current_batch() {
    let first = TaskFuture::<u32>::new();
    let second = TaskFuture::<u32>::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let (chained, seen_a) = (second.clone(), seen.clone());
    first.on_terminal(move |_| {
      seen_a.lock().push("first:a");
      chained.complete(1);
      seen_a.lock().push("first:a settled second");
    });
    let seen_b = seen.clone();
    first.on_terminal(move |_| seen_b.lock().push("first:b"));
    let seen_c = seen.clone();
    second.on_terminal(move |_| seen_c.lock().push("second"));

    first.complete(0);
    assert_eq!(*seen.lock(), vec!["first:a", "first:a settled second", "first:b", "second"]);
  }

  #[test]
  fn max_timeout_waits_without_overflowing() {
    assert_eq!(TaskFuture::completed(5u32).get_timeout(Duration::MAX), Ok(5));

    let future = TaskFuture::<u32>::new();
    let completer = future.clone();
    let handle = thread::spawn(move || {
      thread::sleep(Duration::from_millis(20));
      completer.complete(9);
    });
    assert_eq!(future.get_timeout(Duration::MAX), Ok(9));
    handle.join().unwrap();
  }

  #[test]
  fn get_timeout_elapses_without_settling() {
    let future = TaskFuture::<u32>::new();
    let result = future.get_timeout(Duration::from_millis(30));
    assert!(matches!(result, Err(PoolError::Timeout)));
    assert_eq!(future.status(), FutureStatus::Pending);
  }

  #[test]
  fn blocked_getters_wake_on_completion_from_another_thread() {
    let future = TaskFuture::<String>::new();
    let waiters: Vec<_> = (0..4)
      .map(|_| {
        let f = future.clone();
        thread::spawn(move || f.get())
      })
      .collect();
    thread::sleep(Duration::from_millis(30));
    future.complete("ready".to_string());
    for waiter in waiters {
      assert_eq!(waiter.join().unwrap().unwrap(), "ready");
    }
  }

  #[test]
  fn exceptional_completion_preserves_cause() {
    let future = TaskFuture::<u32>::new();
    future.complete_exceptionally(std::io::Error::new(std::io::ErrorKind::Other, "io gone"));
    match future.get() {
      Err(PoolError::TaskFailure(failure)) => assert_eq!(failure.cause().to_string(), "io gone"),
      other => panic!("Expected TaskFailure, got {:?}", other),
    }
    assert!(future.is_completed_exceptionally());
  }
}
