//! Combinators deriving new [`TaskFuture`]s from existing ones.
//!
//! Every combinator returns a fresh future immediately and settles it from a continuation on
//! its upstream. User closures run on whichever thread settles the upstream, except for
//! [`TaskFuture::map_async`], which hands the closure to a pool. A closure that panics fails
//! the derived future with `PoolError::TaskPanicked`.

use crate::error::{BoxError, PoolError};
use crate::future::TaskFuture;
use crate::pool::WorkerPool;
use crate::scheduler::timeout_delayer;

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{trace, warn};

fn guarded<R>(f: impl FnOnce() -> R) -> Result<R, PoolError> {
  panic::catch_unwind(AssertUnwindSafe(f)).map_err(PoolError::from_panic)
}

impl<T: Clone + Send + 'static> TaskFuture<T> {
  /// Completes with `f(value)` on success. Failures and cancellation pass through without
  /// calling `f`.
  pub fn map<U, F>(&self, f: F) -> TaskFuture<U>
  where
    U: Clone + Send + 'static,
    F: FnOnce(T) -> U + Send + 'static,
  {
    let derived = TaskFuture::new();
    let target = derived.clone();
    self.on_terminal(move |outcome| match outcome {
      Ok(value) => {
        let value = value.clone();
        target.settle(guarded(move || f(value)));
      }
      Err(error) => {
        target.fail(error.clone());
      }
    });
    derived
  }

  /// Like [`map`](Self::map) for a fallible `f`; an `Err` becomes a `TaskFailure`.
  pub fn try_map<U, F>(&self, f: F) -> TaskFuture<U>
  where
    U: Clone + Send + 'static,
    F: FnOnce(T) -> Result<U, BoxError> + Send + 'static,
  {
    let derived = TaskFuture::new();
    let target = derived.clone();
    self.on_terminal(move |outcome| match outcome {
      Ok(value) => {
        let value = value.clone();
        let result = guarded(move || f(value)).and_then(|r| r.map_err(PoolError::from_task_error));
        target.settle(result);
      }
      Err(error) => {
        target.fail(error.clone());
      }
    });
    derived
  }

  /// Chains a step that itself returns a future. The result carries the inner future's outcome.
  pub fn and_then<U, F>(&self, f: F) -> TaskFuture<U>
  where
    U: Clone + Send + 'static,
    F: FnOnce(T) -> TaskFuture<U> + Send + 'static,
  {
    let derived = TaskFuture::new();
    let target = derived.clone();
    self.on_terminal(move |outcome| match outcome {
      Ok(value) => {
        let value = value.clone();
        match guarded(move || f(value)) {
          Ok(inner) => inner.on_terminal(move |inner_outcome| {
            target.settle(inner_outcome.clone());
          }),
          Err(error) => {
            target.fail(error);
          }
        }
      }
      Err(error) => {
        target.fail(error.clone());
      }
    });
    derived
  }

  /// Waits for both futures and completes with `combiner(a, b)` when both succeed.
  ///
  /// If either branch fails or is cancelled, the result takes that branch's outcome. When both
  /// fail, the failure observed first wins; which one that is depends on thread timing.
  pub fn zip<U, R, F>(&self, other: &TaskFuture<U>, combiner: F) -> TaskFuture<R>
  where
    U: Clone + Send + 'static,
    R: Clone + Send + 'static,
    F: FnOnce(T, U) -> R + Send + 'static,
  {
    let derived = TaskFuture::new();
    let state = Arc::new(Mutex::new(ZipState {
      left: None,
      right: None,
      first_error: None,
      pending: 2,
      combiner: Some(combiner),
    }));

    let (left_state, left_target) = (state.clone(), derived.clone());
    self.on_terminal(move |outcome| {
      let ready = {
        let mut state = left_state.lock();
        match outcome {
          Ok(value) => state.left = Some(value.clone()),
          Err(error) => state.record_failure(error),
        }
        state.arrive()
      };
      resolve_zip(&left_target, ready);
    });

    let right_target = derived.clone();
    other.on_terminal(move |outcome| {
      let ready = {
        let mut state = state.lock();
        match outcome {
          Ok(value) => state.right = Some(value.clone()),
          Err(error) => state.record_failure(error),
        }
        state.arrive()
      };
      resolve_zip(&right_target, ready);
    });
    derived
  }

  /// Replaces a failure with `f(error)`. Cancellation counts as a failure. Successes pass
  /// through unchanged.
  pub fn recover<F>(&self, f: F) -> TaskFuture<T>
  where
    F: FnOnce(PoolError) -> T + Send + 'static,
  {
    let derived = TaskFuture::new();
    let target = derived.clone();
    self.on_terminal(move |outcome| match outcome {
      Ok(value) => {
        target.complete(value.clone());
      }
      Err(error) => {
        let error = error.clone();
        target.settle(guarded(move || f(error)));
      }
    });
    derived
  }

  /// Maps every terminal outcome, success or failure, to a new value.
  pub fn fold<U, F>(&self, f: F) -> TaskFuture<U>
  where
    U: Clone + Send + 'static,
    F: FnOnce(Result<T, PoolError>) -> U + Send + 'static,
  {
    let derived = TaskFuture::new();
    let target = derived.clone();
    self.on_terminal(move |outcome| {
      let outcome = outcome.clone();
      target.settle(guarded(move || f(outcome)));
    });
    derived
  }

  /// Observes the outcome for side effects. The result carries the original outcome unless
  /// `f` returns an error or panics, in which case that error replaces it.
  pub fn on_complete<F>(&self, f: F) -> TaskFuture<T>
  where
    F: FnOnce(&Result<T, PoolError>) -> Result<(), BoxError> + Send + 'static,
  {
    let derived = TaskFuture::new();
    let target = derived.clone();
    self.on_terminal(move |outcome| match guarded(|| f(outcome)) {
      Ok(Ok(())) => {
        target.settle(outcome.clone());
      }
      Ok(Err(error)) => {
        target.fail(PoolError::from_task_error(error));
      }
      Err(panicked) => {
        target.fail(panicked);
      }
    });
    derived
  }

  /// Fails with `PoolError::Timeout` unless this future settles within `timeout`.
  ///
  /// The underlying task is not cancelled and may still run to completion.
  pub fn or_timeout(&self, timeout: Duration) -> TaskFuture<T> {
    self.settle_after(timeout, || Err(PoolError::Timeout))
  }

  /// Completes with `value` unless this future settles within `timeout`.
  pub fn complete_on_timeout(&self, value: T, timeout: Duration) -> TaskFuture<T> {
    self.settle_after(timeout, move || Ok(value))
  }

  fn settle_after<F>(&self, timeout: Duration, fallback: F) -> TaskFuture<T>
  where
    F: FnOnce() -> Result<T, PoolError> + Send + 'static,
  {
    let derived = TaskFuture::new();
    let delayer = match timeout_delayer() {
      Ok(delayer) => delayer,
      Err(error) => {
        warn!(%error, "Cannot arm timeout.");
        derived.fail(error);
        return derived;
      }
    };

    let on_deadline = derived.clone();
    let timer = delayer.schedule(
      move |_ctx| {
        if on_deadline.settle(fallback()) {
          trace!(task_id = %on_deadline.id(), "Deadline reached before upstream settled.");
        }
        Ok(())
      },
      timeout,
    );
    let timer = match timer {
      Ok(timer) => timer,
      Err(error) => {
        warn!(%error, "Cannot arm timeout.");
        derived.fail(error);
        return derived;
      }
    };

    let target = derived.clone();
    self.on_terminal(move |outcome| {
      target.settle(outcome.clone());
      timer.cancel(false);
    });
    derived
  }

  /// Like [`map`](Self::map), but `f` runs as a new task on `pool` instead of on the thread
  /// that settled this future.
  pub fn map_async<U, F>(&self, pool: &WorkerPool, f: F) -> TaskFuture<U>
  where
    U: Clone + Send + 'static,
    F: FnOnce(T) -> U + Send + 'static,
  {
    let derived = TaskFuture::new();
    let target = derived.clone();
    let pool = pool.clone();
    self.on_terminal(move |outcome| match outcome {
      Ok(value) => {
        let value = value.clone();
        match pool.submit(move |_ctx| Ok(f(value))) {
          Ok(step) => step.on_terminal(move |step_outcome| {
            target.settle(step_outcome.clone());
          }),
          Err(error) => {
            target.fail(error);
          }
        }
      }
      Err(error) => {
        target.fail(error.clone());
      }
    });
    derived
  }

  /// Bridges into async code: the returned future resolves with this future's outcome.
  pub fn into_async(&self) -> impl Future<Output = Result<T, PoolError>> + Send + 'static {
    let (sender, receiver) = tokio::sync::oneshot::channel();
    self.on_terminal(move |outcome| {
      let _ = sender.send(outcome.clone());
    });
    async move { receiver.await.unwrap_or(Err(PoolError::Cancelled)) }
  }
}

struct ZipState<T, U, F> {
  left: Option<T>,
  right: Option<U>,
  first_error: Option<PoolError>,
  pending: u8,
  combiner: Option<F>,
}

enum ZipReady<T, U, F> {
  Failed(PoolError),
  Combine(T, U, F),
}

impl<T, U, F> ZipState<T, U, F> {
  fn record_failure(&mut self, error: &PoolError) {
    if self.first_error.is_none() {
      self.first_error = Some(error.clone());
    }
  }

  /// Counts one settled branch; yields the resolution once both have settled.
  fn arrive(&mut self) -> Option<ZipReady<T, U, F>> {
    self.pending -= 1;
    if self.pending > 0 {
      return None;
    }
    if let Some(error) = self.first_error.take() {
      return Some(ZipReady::Failed(error));
    }
    match (self.left.take(), self.right.take(), self.combiner.take()) {
      (Some(left), Some(right), Some(combiner)) => Some(ZipReady::Combine(left, right, combiner)),
      _ => None,
    }
  }
}

fn resolve_zip<T, U, R, F>(target: &TaskFuture<R>, ready: Option<ZipReady<T, U, F>>)
where
  R: Clone + Send + 'static,
  F: FnOnce(T, U) -> R,
{
  match ready {
    Some(ZipReady::Failed(error)) => {
      target.fail(error);
    }
    Some(ZipReady::Combine(left, right, combiner)) => {
      target.settle(guarded(move || combiner(left, right)));
    }
    None => {}
  }
}

/// Completes with every value, in input order, once all inputs have settled.
///
/// A single failed input fails the result with that input's error (a cancelled input cancels
/// it). Several failures become `PoolError::AggregateFailure` in input order. An empty input
/// completes immediately with an empty vector.
pub fn all<T: Clone + Send + 'static>(futures: &[TaskFuture<T>]) -> TaskFuture<Vec<T>> {
  if futures.is_empty() {
    return TaskFuture::completed(Vec::new());
  }
  let derived = TaskFuture::new();
  let slots: Arc<Mutex<(Vec<Option<Result<T, PoolError>>>, usize)>> =
    Arc::new(Mutex::new((vec![None; futures.len()], futures.len())));

  for (index, future) in futures.iter().enumerate() {
    let (slots, target) = (slots.clone(), derived.clone());
    future.on_terminal(move |outcome| {
      let settled = {
        let mut guard = slots.lock();
        let (results, remaining) = &mut *guard;
        results[index] = Some(outcome.clone());
        *remaining -= 1;
        if *remaining > 0 {
          return;
        }
        std::mem::take(results)
      };

      let mut values = Vec::with_capacity(settled.len());
      let mut errors = Vec::new();
      for result in settled.into_iter().flatten() {
        match result {
          Ok(value) => values.push(value),
          Err(error) => errors.push(error),
        }
      }
      let outcome = match errors.len() {
        0 => Ok(values),
        1 => Err(errors.remove(0)),
        _ => Err(PoolError::AggregateFailure(errors)),
      };
      target.settle(outcome);
    });
  }
  derived
}

/// Completes with the first successful value.
///
/// Fails with `PoolError::AggregateFailure`, holding each input's error in input order, only
/// when every input fails. An empty input fails immediately with an empty aggregate.
pub fn any<T: Clone + Send + 'static>(futures: &[TaskFuture<T>]) -> TaskFuture<T> {
  if futures.is_empty() {
    return TaskFuture::failed(PoolError::AggregateFailure(Vec::new()));
  }
  let derived = TaskFuture::new();
  let failures: Arc<Mutex<(Vec<Option<PoolError>>, usize)>> =
    Arc::new(Mutex::new((vec![None; futures.len()], 0)));
  let total = futures.len();

  for (index, future) in futures.iter().enumerate() {
    let (failures, target) = (failures.clone(), derived.clone());
    future.on_terminal(move |outcome| match outcome {
      Ok(value) => {
        target.complete(value.clone());
      }
      Err(error) => {
        let errors = {
          let mut guard = failures.lock();
          let (errors, failed) = &mut *guard;
          errors[index] = Some(error.clone());
          *failed += 1;
          if *failed < total {
            return;
          }
          std::mem::take(errors)
        };
        target.fail(PoolError::AggregateFailure(errors.into_iter().flatten().collect()));
      }
    });
  }
  derived
}
