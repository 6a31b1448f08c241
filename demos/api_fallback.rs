//! Parallel calls to three backends with per-call timeouts, falling back from the fastest to
//! the slowest until one answers.

use futures_conductor::{BoxError, ExecutorService, PoolError, TaskContext, TaskFuture, WorkerPool};
use rand::Rng;
use std::time::Duration;
use tracing::info;

fn call_backend(
  pool: &WorkerPool,
  name: &'static str,
  latency: Duration,
  failure_rate: f64,
  budget: Duration,
) -> Result<TaskFuture<Option<String>>, PoolError> {
  let call = pool.submit(move |ctx: &TaskContext| -> Result<Option<String>, BoxError> {
    info!(backend = name, "Calling backend.");
    ctx.sleep(latency)?;
    if rand::rng().random_bool(failure_rate) {
      return Err(format!("{} backend failed", name).into());
    }
    Ok(Some(format!("{} response", name)))
  })?;
  // A timed-out call answers `None` so the chain moves on to the next backend.
  Ok(call.complete_on_timeout(None, budget))
}

fn main() -> Result<(), PoolError> {
  tracing_subscriber::fmt().with_env_filter("info").init();
  let pool = WorkerPool::fixed(4, "api-fallback")?;

  let fast = call_backend(&pool, "fast", Duration::from_millis(300), 0.1, Duration::from_millis(500))?;
  let reliable = call_backend(&pool, "reliable", Duration::from_millis(800), 0.0, Duration::from_secs(1))?;
  let slow = call_backend(&pool, "slow", Duration::from_millis(1500), 0.0, Duration::from_secs(1))?;

  let response = fast
    .recover(|error| {
      info!(%error, "Fast backend failed; falling back to the reliable backend.");
      None
    })
    .and_then(move |answer| match answer {
      Some(answer) => TaskFuture::completed(Some(answer)),
      None => reliable,
    })
    .recover(|error| {
      info!(%error, "Reliable backend failed; falling back to the slow backend.");
      None
    })
    .and_then(move |answer| match answer {
      Some(answer) => TaskFuture::completed(Some(answer)),
      None => slow,
    })
    .map(|answer| answer.unwrap_or_else(|| "every backend timed out".to_string()))
    .recover(|_| "every backend failed".to_string());

  info!(response = %response.get()?, "Final answer.");
  pool.shutdown_and_await_termination(Duration::from_secs(2))
}
