use crate::error::PoolError;
use crate::notifier::{CompletionHook, TaskCompletionInfo};
use crate::pool::WorkerPool;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How long an elastic worker may sit idle before it retires.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub const DEFAULT_POOL_NAME: &str = "pool";

/// How a [`WorkerPool`] sizes its set of worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthPolicy {
  /// N persistent workers fed by a FIFO queue; surplus tasks wait in the queue.
  Fixed(usize),
  /// Workers created on demand through a direct hand-off, retired after the idle timeout.
  Elastic,
  /// Exactly one worker: tasks run one at a time in submission order.
  Single,
}

/// Everything needed to build a [`WorkerPool`].
#[derive(Clone)]
pub struct PoolConfig {
  pub name: String,
  pub policy: GrowthPolicy,
  /// Bound on queued tasks for fixed pools. `None` means unbounded. When full, `submit` blocks.
  pub queue_capacity: Option<usize>,
  /// Idle window after which an elastic worker retires.
  pub idle_timeout: Duration,
  /// Upper bound on elastic workers. `None` means no cap.
  pub max_workers: Option<usize>,
  pub(crate) hooks: Vec<CompletionHook>,
}

impl fmt::Debug for PoolConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PoolConfig")
      .field("name", &self.name)
      .field("policy", &self.policy)
      .field("queue_capacity", &self.queue_capacity)
      .field("idle_timeout", &self.idle_timeout)
      .field("max_workers", &self.max_workers)
      .field("hook_count", &self.hooks.len())
      .finish()
  }
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      name: DEFAULT_POOL_NAME.to_string(),
      policy: GrowthPolicy::Fixed(default_parallelism()),
      queue_capacity: None,
      idle_timeout: DEFAULT_IDLE_TIMEOUT,
      max_workers: None,
      hooks: Vec::new(),
    }
  }
}

impl PoolConfig {
  /// Workers kept alive regardless of idleness.
  pub(crate) fn min_workers(&self) -> usize {
    match self.policy {
      GrowthPolicy::Fixed(n) => n.max(1),
      GrowthPolicy::Single => 1,
      GrowthPolicy::Elastic => 0,
    }
  }

  pub(crate) fn worker_limit(&self) -> Option<usize> {
    match self.policy {
      GrowthPolicy::Fixed(n) => Some(n.max(1)),
      GrowthPolicy::Single => Some(1),
      GrowthPolicy::Elastic => self.max_workers,
    }
  }
}

fn default_parallelism() -> usize {
  std::thread::available_parallelism().map_or(4, |n| n.get())
}

/// Builder for [`WorkerPool`].
///
/// ```no_run
/// use futures_conductor::WorkerPool;
/// use std::time::Duration;
///
/// let pool = WorkerPool::builder()
///   .name("ingest")
///   .fixed(4)
///   .queue_capacity(128)
///   .build()?;
/// let answer = pool.submit(|_ctx| Ok(6 * 7))?;
/// assert_eq!(answer.get_timeout(Duration::from_secs(1))?, 42);
/// # Ok::<(), futures_conductor::PoolError>(())
/// ```
#[derive(Debug, Default)]
pub struct PoolBuilder {
  config: PoolConfig,
}

impl PoolBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Name used in logs and as the worker thread name prefix.
  pub fn name<S: Into<String>>(mut self, name: S) -> Self {
    self.config.name = name.into();
    self
  }

  pub fn policy(mut self, policy: GrowthPolicy) -> Self {
    self.config.policy = policy;
    self
  }

  pub fn fixed(self, workers: usize) -> Self {
    self.policy(GrowthPolicy::Fixed(workers))
  }

  pub fn elastic(self) -> Self {
    self.policy(GrowthPolicy::Elastic)
  }

  pub fn single(self) -> Self {
    self.policy(GrowthPolicy::Single)
  }

  pub fn queue_capacity(mut self, capacity: usize) -> Self {
    self.config.queue_capacity = Some(capacity);
    self
  }

  pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
    self.config.idle_timeout = idle_timeout;
    self
  }

  pub fn max_workers(mut self, max_workers: usize) -> Self {
    self.config.max_workers = Some(max_workers.max(1));
    self
  }

  /// Registers an after-execute hook. See [`TaskCompletionInfo`].
  pub fn on_task_complete(mut self, hook: impl Fn(&TaskCompletionInfo) + Send + Sync + 'static) -> Self {
    self.config.hooks.push(Arc::new(hook));
    self
  }

  pub fn config(&self) -> &PoolConfig {
    &self.config
  }

  /// Starts the pool's persistent workers.
  ///
  /// # Errors
  /// `PoolError::WorkerSpawn` if a worker thread cannot be started.
  pub fn build(self) -> Result<WorkerPool, PoolError> {
    WorkerPool::from_config(self.config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn policies_map_to_worker_bounds() {
    let fixed = PoolBuilder::new().fixed(3).config().clone();
    assert_eq!((fixed.min_workers(), fixed.worker_limit()), (3, Some(3)));

    let single = PoolBuilder::new().single().config().clone();
    assert_eq!((single.min_workers(), single.worker_limit()), (1, Some(1)));

    let elastic = PoolBuilder::new().elastic().config().clone();
    assert_eq!((elastic.min_workers(), elastic.worker_limit()), (0, None));
    assert_eq!(elastic.idle_timeout, DEFAULT_IDLE_TIMEOUT);

    let capped = PoolBuilder::new().elastic().max_workers(8).config().clone();
    assert_eq!(capped.worker_limit(), Some(8));
  }
}
