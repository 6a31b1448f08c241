use crate::compose::any;
use crate::config::{GrowthPolicy, PoolBuilder, PoolConfig};
use crate::error::{BoxError, PoolError};
use crate::future::TaskFuture;
use crate::notifier::TaskCompletionInfo;
use crate::queue::{FifoQueue, HandoffQueue, TaskQueue};
use crate::shutdown::{ExecutorService, PendingTask, PoolState};
use crate::task::{next_task_id, AsyncTask, Callable, Job, OneShotTask, Runnable, TaskContext};
use crate::worker::{CoreHandle, PoolCore, WorkerLimits};

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A set of worker threads executing submitted tasks.
///
/// Every accepted task eventually runs on some worker or ends cancelled; its outcome is
/// delivered through the [`TaskFuture`] returned by `submit`.
///
/// Clones share the same workers. Dropping the last clone starts a graceful shutdown.
#[derive(Clone)]
pub struct WorkerPool {
  handle: Arc<CoreHandle>,
  policy: GrowthPolicy,
}

impl fmt::Debug for WorkerPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkerPool")
      .field("name", &self.name())
      .field("policy", &self.policy)
      .field("state", &self.state())
      .field("workers", &self.worker_count())
      .field("queued", &self.queued_task_count())
      .finish()
  }
}

impl WorkerPool {
  pub fn builder() -> PoolBuilder {
    PoolBuilder::new()
  }

  /// `workers` persistent threads over an unbounded FIFO queue.
  pub fn fixed(workers: usize, name: &str) -> Result<Self, PoolError> {
    Self::builder().name(name).fixed(workers).build()
  }

  /// Threads created on demand with no cap, retired after [`DEFAULT_IDLE_TIMEOUT`](crate::DEFAULT_IDLE_TIMEOUT).
  pub fn elastic(name: &str) -> Result<Self, PoolError> {
    Self::builder().name(name).elastic().build()
  }

  /// One worker; tasks start and complete in submission order.
  pub fn single(name: &str) -> Result<Self, PoolError> {
    Self::builder().name(name).single().build()
  }

  pub(crate) fn from_config(config: PoolConfig) -> Result<Self, PoolError> {
    let queue: Arc<dyn TaskQueue<Job>> = match config.policy {
      GrowthPolicy::Fixed(_) => match config.queue_capacity {
        Some(capacity) => Arc::new(FifoQueue::bounded(capacity)),
        None => Arc::new(FifoQueue::unbounded()),
      },
      GrowthPolicy::Single => Arc::new(FifoQueue::unbounded()),
      GrowthPolicy::Elastic => Arc::new(HandoffQueue::new()),
    };
    let elastic = config.policy == GrowthPolicy::Elastic;
    let limits = WorkerLimits {
      min_workers: config.min_workers(),
      max_workers: config.worker_limit(),
      keep_alive: elastic.then_some(config.idle_timeout),
      spawn_on_demand: elastic,
    };

    debug!(pool_name = %config.name, ?config, "Building worker pool.");
    let core = PoolCore::new(&config.name, queue, limits, config.hooks);
    core.prestart()?;
    Ok(Self {
      handle: CoreHandle::new(core, "WorkerPool"),
      policy: config.policy,
    })
  }

  fn core(&self) -> &Arc<PoolCore> {
    self.handle.core()
  }

  pub fn policy(&self) -> GrowthPolicy {
    self.policy
  }

  /// Submits a closure. Returns immediately with the task's pending future.
  ///
  /// # Errors
  /// `PoolError::RejectedSubmission` once the pool is shutting down or terminated.
  pub fn submit<T, F>(&self, task: F) -> Result<TaskFuture<T>, PoolError>
  where
    T: Clone + Send + 'static,
    F: FnOnce(&TaskContext) -> Result<T, BoxError> + Send + 'static,
  {
    self.submit_task(task)
  }

  /// Submits any [`Callable`].
  pub fn submit_task<T, C>(&self, callable: C) -> Result<TaskFuture<T>, PoolError>
  where
    T: Clone + Send + 'static,
    C: Callable<T>,
  {
    self.submit_runnable(|future| Box::new(OneShotTask::new(future, Box::new(callable))) as Box<dyn Runnable>)
  }

  /// Submits a future to be driven to completion on a worker thread.
  ///
  /// The future is raced against the task's cancellation token, so an interrupting cancel stops
  /// it at its next suspension point. It must not depend on a tokio reactor.
  pub fn submit_async<T, Fut>(&self, body: Fut) -> Result<TaskFuture<T>, PoolError>
  where
    T: Clone + Send + 'static,
    Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
  {
    self.submit_runnable(|future| Box::new(AsyncTask::new(future, Box::pin(body))) as Box<dyn Runnable>)
  }

  fn submit_runnable<T>(
    &self,
    build: impl FnOnce(TaskFuture<T>) -> Box<dyn Runnable>,
  ) -> Result<TaskFuture<T>, PoolError>
  where
    T: Clone + Send + 'static,
  {
    let task_id = next_task_id();
    let token = CancellationToken::new();
    let future = TaskFuture::with_id(task_id);
    future.attach_interrupt(token.clone());

    debug!(pool_name = %self.name(), %task_id, "Submitting task.");
    self.core().dispatch(Job::new(task_id, token, build(future.clone())))?;
    Ok(future)
  }

  /// Submits every task and blocks until all of them are terminal.
  ///
  /// Returns the settled futures in input order, so each one's outcome can be read without
  /// blocking.
  ///
  /// # Errors
  /// `PoolError::RejectedSubmission` if the pool stops accepting work part way through; tasks
  /// already submitted from `tasks` are then cancelled with interrupt.
  pub fn invoke_all<T, C, I>(&self, tasks: I) -> Result<Vec<TaskFuture<T>>, PoolError>
  where
    T: Clone + Send + 'static,
    C: Callable<T>,
    I: IntoIterator<Item = C>,
  {
    let futures = self.submit_batch(tasks)?;
    debug!(pool_name = %self.name(), count = futures.len(), "Waiting for invoked batch.");
    for future in &futures {
      let _ = future.get();
    }
    Ok(futures)
  }

  /// Submits every task, blocks for the first one to succeed and returns its value.
  ///
  /// The remaining tasks are cancelled with interrupt once the call returns.
  ///
  /// # Errors
  /// `PoolError::AggregateFailure` with every task's error in input order when none succeeds
  /// (empty for an empty batch), or `PoolError::RejectedSubmission` as for
  /// [`invoke_all`](Self::invoke_all).
  pub fn invoke_any<T, C, I>(&self, tasks: I) -> Result<T, PoolError>
  where
    T: Clone + Send + 'static,
    C: Callable<T>,
    I: IntoIterator<Item = C>,
  {
    let futures = self.submit_batch(tasks)?;
    let outcome = any(&futures).get();
    let cancelled = futures.iter().filter(|future| future.cancel(true)).count();
    debug!(pool_name = %self.name(), cancelled, "Invoked batch resolved; cancelled the rest.");
    outcome
  }

  fn submit_batch<T, C, I>(&self, tasks: I) -> Result<Vec<TaskFuture<T>>, PoolError>
  where
    T: Clone + Send + 'static,
    C: Callable<T>,
    I: IntoIterator<Item = C>,
  {
    let mut futures = Vec::new();
    for task in tasks {
      match self.submit_task(task) {
        Ok(future) => futures.push(future),
        Err(error) => {
          for future in &futures {
            future.cancel(true);
          }
          return Err(error);
        }
      }
    }
    Ok(futures)
  }

  /// Registers an after-execute hook on a running pool.
  pub fn add_completion_handler(&self, hook: impl Fn(&TaskCompletionInfo) + Send + Sync + 'static) {
    self.core().notifier.add_handler(Arc::new(hook));
  }

  /// Tasks currently executing on a worker.
  pub fn active_task_count(&self) -> usize {
    self.core().active_task_count()
  }

  /// Tasks waiting in the queue.
  pub fn queued_task_count(&self) -> usize {
    self.core().queued_task_count()
  }

  /// Live worker threads.
  pub fn worker_count(&self) -> usize {
    self.core().lifecycle.worker_count()
  }

  /// Drops queued tasks that were cancelled before starting. Returns how many were removed.
  pub fn purge(&self) -> usize {
    self.core().purge()
  }
}

impl ExecutorService for WorkerPool {
  fn name(&self) -> &str {
    &self.core().name
  }

  fn state(&self) -> PoolState {
    self.core().lifecycle.state()
  }

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
