use crate::error::PoolError;
use crate::notifier::{CompletionHook, CompletionNotifier};
use crate::queue::{Dequeue, QueueClosed, TaskQueue};
use crate::shutdown::{PendingTask, ShutdownCoordinator};
use crate::task::{Job, TaskId};

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn};

/// Sizing rules for the workers of one pool.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerLimits {
  pub(crate) min_workers: usize,
  pub(crate) max_workers: Option<usize>,
  /// Idle window after which workers above `min_workers` retire. `None` keeps them forever.
  pub(crate) keep_alive: Option<Duration>,
  /// Offer each task to an idle worker and start a new worker when none is waiting.
  pub(crate) spawn_on_demand: bool,
}

enum SpawnRefusal {
  NotAccepting,
  AtCapacity,
  Io(io::Error),
}

enum NextJob {
  Run(Job),
  Retire,
  Exit,
}

/// State shared between a pool handle and its worker threads.
pub(crate) struct PoolCore {
  pub(crate) name: Arc<String>,
  pub(crate) queue: Arc<dyn TaskQueue<Job>>,
  pub(crate) lifecycle: ShutdownCoordinator,
  pub(crate) notifier: CompletionNotifier,
  active_tasks: DashMap<TaskId, CancellationToken>,
  limits: WorkerLimits,
  next_worker_id: AtomicUsize,
}

impl PoolCore {
  pub(crate) fn new(
    name: &str,
    queue: Arc<dyn TaskQueue<Job>>,
    limits: WorkerLimits,
    hooks: Vec<CompletionHook>,
  ) -> Arc<Self> {
    let name = Arc::new(name.to_string());
    Arc::new(Self {
      lifecycle: ShutdownCoordinator::new(name.clone()),
      notifier: CompletionNotifier::new(name.clone(), hooks),
      name,
      queue,
      active_tasks: DashMap::new(),
      limits,
      next_worker_id: AtomicUsize::new(0),
    })
  }

  /// Starts the persistent workers.
  pub(crate) fn prestart(self: &Arc<Self>) -> Result<(), PoolError> {
    for _ in 0..self.limits.min_workers {
      match self.spawn_worker(None, false) {
        Ok(()) => {}
        Err((SpawnRefusal::Io(e), _)) => {
          error!(pool_name = %*self.name, "Failed to start worker: {}", e);
          self.shutdown();
          return Err(PoolError::WorkerSpawn(e.to_string()));
        }
        Err(_) => break,
      }
    }
    info!(pool_name = %*self.name, workers = self.lifecycle.worker_count(), "Pool started.");
    Ok(())
  }

  pub(crate) fn active_task_count(&self) -> usize {
    self.active_tasks.len()
  }

  pub(crate) fn queued_task_count(&self) -> usize {
    self.queue.len()
  }

  pub(crate) fn rejected(&self) -> PoolError {
    PoolError::RejectedSubmission {
      pool_name: self.name.to_string(),
    }
  }

  /// Hands `job` to the workers according to the growth policy.
  pub(crate) fn dispatch(self: &Arc<Self>, job: Job) -> Result<(), PoolError> {
    if !self.lifecycle.is_running() {
      warn!(pool_name = %*self.name, task_id = %job.task_id, "Submit: pool is shutting down or terminated.");
      job.abandon();
      return Err(self.rejected());
    }
    if !self.limits.spawn_on_demand {
      return self.enqueue(job);
    }

    let job = match self.queue.offer(job) {
      Ok(()) => return Ok(()),
      Err(job) => job,
    };
    match self.spawn_worker(Some(job), false) {
      Ok(()) => Ok(()),
      Err((SpawnRefusal::AtCapacity, Some(job))) => {
        trace!(pool_name = %*self.name, "Worker cap reached; waiting for an idle worker.");
        self.enqueue(job)
      }
      Err((SpawnRefusal::NotAccepting, job)) => {
        if let Some(job) = job {
          job.abandon();
        }
        Err(self.rejected())
      }
      Err((SpawnRefusal::Io(e), job)) => {
        error!(pool_name = %*self.name, "Failed to start worker for submitted task: {}", e);
        if let Some(job) = job {
          job.abandon();
        }
        Err(PoolError::WorkerSpawn(e.to_string()))
      }
      Err((SpawnRefusal::AtCapacity, None)) => Ok(()),
    }
  }

  /// Blocking enqueue; rejects once the queue has been closed by shutdown.
  pub(crate) fn enqueue(&self, job: Job) -> Result<(), PoolError> {
    let task_id = job.task_id;
    match self.queue.enqueue(job) {
      Ok(()) => {
        trace!(pool_name = %*self.name, %task_id, "Task enqueued.");
        Ok(())
      }
      Err(QueueClosed(job)) => {
        warn!(pool_name = %*self.name, %task_id, "Submit: queue closed by shutdown.");
        job.abandon();
        Err(self.rejected())
      }
    }
  }

  /// Removes queued jobs whose futures are already terminal.
  pub(crate) fn purge(&self) -> usize {
    let removed = self.queue.remove_if(&mut |job: &Job| job.is_settled());
    if !removed.is_empty() {
      debug!(pool_name = %*self.name, "Purged {} cancelled tasks from the queue.", removed.len());
    }
    removed.len()
  }

  pub(crate) fn shutdown(&self) {
    self.lifecycle.begin_shutdown();
    // Periodic tasks never outlive shutdown; one-shot delayed tasks still run when due.
    let periodic = self.queue.remove_if(&mut |job: &Job| job.periodic);
    if !periodic.is_empty() {
      debug!(pool_name = %*self.name, "Cancelling {} periodic tasks on shutdown.", periodic.len());
      for job in periodic {
        job.abandon();
      }
    }
    self.queue.close();
    self.lifecycle.try_terminate(self.queue.is_empty());
  }

  pub(crate) fn shutdown_now(&self) -> Vec<PendingTask> {
    if self.lifecycle.begin_stop() {
      info!(pool_name = %*self.name, "Forceful shutdown: cancelling queued tasks and interrupting active ones.");
    }
    self.queue.close();
    let pending: Vec<PendingTask> = self.queue.drain().into_iter().map(Job::abandon).collect();

    let active: Vec<(TaskId, CancellationToken)> = self
      .active_tasks
      .iter()
      .map(|entry| (*entry.key(), entry.value().clone()))
      .collect();
    for (task_id, token) in active {
      debug!(pool_name = %*self.name, %task_id, "Interrupting active task during shutdown.");
      token.cancel();
    }

    self.lifecycle.try_terminate(true);
    pending
  }

  /// Puts the follow-up run of a periodic task back in the queue, or drops it after shutdown.
  fn requeue(&self, job: Job) {
    if !self.lifecycle.is_running() {
      debug!(pool_name = %*self.name, task_id = %job.task_id, "Not re-scheduling periodic task after shutdown.");
      job.abandon();
      return;
    }
    if let Err(QueueClosed(job)) = self.queue.enqueue(job) {
      job.abandon();
    }
  }

  fn spawn_worker(
    self: &Arc<Self>,
    first_job: Option<Job>,
    for_replacement: bool,
  ) -> Result<(), (SpawnRefusal, Option<Job>)> {
    if !self.lifecycle.try_add_worker(self.limits.max_workers, for_replacement) {
      let reason = if self.lifecycle.is_running() {
        SpawnRefusal::AtCapacity
      } else {
        SpawnRefusal::NotAccepting
      };
      return Err((reason, first_job));
    }

    let worker_id = self.next_worker_id.fetch_add(1, AtomicOrdering::Relaxed);
    // The job is parked here so it can be recovered if the thread never starts.
    let first_job_slot = Arc::new(Mutex::new(first_job));
    let worker_slot = first_job_slot.clone();
    let core = self.clone();
    let spawn_result = thread::Builder::new()
      .name(format!("{}-worker-{}", self.name, worker_id))
      .spawn(move || {
        let first = worker_slot.lock().take();
        run_worker(core, worker_id, first);
      });

    match spawn_result {
      Ok(_) => {
        trace!(pool_name = %*self.name, worker_id, "Spawned worker thread.");
        Ok(())
      }
      Err(e) => {
        self.lifecycle.release_worker();
        Err((SpawnRefusal::Io(e), first_job_slot.lock().take()))
      }
    }
  }

  fn next_job(&self) -> NextJob {
    loop {
      let job = match self.limits.keep_alive {
        None => match self.queue.dequeue() {
          Some(job) => job,
          None => return NextJob::Exit,
        },
        Some(keep_alive) => match self.queue.dequeue_timeout(keep_alive) {
          Dequeue::Item(job) => job,
          Dequeue::Closed => return NextJob::Exit,
          Dequeue::TimedOut => {
            if self.lifecycle.try_retire_worker(self.limits.min_workers) {
              return NextJob::Retire;
            }
            continue;
          }
        },
      };
      if job.is_settled() {
        trace!(pool_name = %*self.name, task_id = %job.task_id, "Discarding task cancelled while queued.");
        continue;
      }
      return NextJob::Run(job);
    }
  }

  fn execute(&self, job: Job, worker_id: usize) {
    if self.lifecycle.is_stopping() {
      job.abandon();
      return;
    }
    let task_id = job.task_id;
    self.active_tasks.insert(task_id, job.token.clone());
    // shutdown_now may have swept the active set between the check above and the insert.
    if self.lifecycle.is_stopping() {
      job.token.cancel();
    }

    trace!(pool_name = %*self.name, %task_id, "Running task.");
    let report = job.run();
    self.active_tasks.remove(&task_id);
    debug!(pool_name = %*self.name, %task_id, status = ?report.status, "Task finished.");

    if let Some(next_run) = report.reschedule {
      self.requeue(next_run);
    }
    self.notifier.notify(task_id, worker_id, report.status);
  }

  /// Starts a fresh worker after a fault, keeping the pool at its configured minimum.
  fn replace_worker(self: &Arc<Self>) {
    if self.lifecycle.is_stopping() {
      return;
    }
    let below_minimum = self.lifecycle.worker_count() < self.limits.min_workers;
    if !below_minimum && self.queue.is_empty() {
      return;
    }
    match self.spawn_worker(None, true) {
      Ok(()) => info!(pool_name = %*self.name, "Replaced faulted worker."),
      Err((SpawnRefusal::Io(e), _)) => error!(pool_name = %*self.name, "Could not replace faulted worker: {}", e),
      Err(_) => trace!(pool_name = %*self.name, "No replacement needed for faulted worker."),
    }
  }
}

/// Owning handle shared by the clones of a pool or scheduler. Worker threads only hold the
/// core, so this drops when the last user-facing clone does, which starts a graceful shutdown.
pub(crate) struct CoreHandle {
  core: Arc<PoolCore>,
  kind: &'static str,
}

impl CoreHandle {
  pub(crate) fn new(core: Arc<PoolCore>, kind: &'static str) -> Arc<Self> {
    Arc::new(Self { core, kind })
  }

  pub(crate) fn core(&self) -> &Arc<PoolCore> {
    &self.core
  }
}

impl Drop for CoreHandle {
  fn drop(&mut self) {
    if self.core.lifecycle.is_running() {
      info!(
        pool_name = %*self.core.name,
        "{} dropped without explicit shutdown. Initiating implicit shutdown.",
        self.kind
      );
      self.core.shutdown();
    }
  }
}

/// Releases the worker's slot on every exit path, including unwinding out of a hook.
struct WorkerExitGuard {
  core: Arc<PoolCore>,
  worker_id: usize,
  retired: bool,
}

impl Drop for WorkerExitGuard {
  fn drop(&mut self) {
    if !self.retired {
      self.core.lifecycle.release_worker();
    }
    if thread::panicking() {
      error!(pool_name = %*self.core.name, worker_id = self.worker_id, "Worker thread faulted.");
      self.core.replace_worker();
    }
    self.core.lifecycle.try_terminate(self.core.queue.is_empty());
  }
}

fn run_worker(core: Arc<PoolCore>, worker_id: usize, first_job: Option<Job>) {
  let _span = info_span!("pool_worker", pool_name = %*core.name, worker_id).entered();
  let mut guard = WorkerExitGuard {
    core: core.clone(),
    worker_id,
    retired: false,
  };
  debug!("Worker started.");

  let mut next = first_job;
  loop {
    let job = match next.take() {
      Some(job) => job,
      None => match core.next_job() {
        NextJob::Run(job) => job,
        NextJob::Retire => {
          debug!("Worker idle past keep-alive; retiring.");
          guard.retired = true;
          break;
        }
        NextJob::Exit => {
          debug!("Queue closed and drained; worker exiting.");
          break;
        }
      },
    };
    core.execute(job, worker_id);
  }
}
