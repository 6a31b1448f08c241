mod common;

use common::{gate, setup_tracing_for_test};
use futures_conductor::{ExecutorService, FutureStatus, PoolError, PoolState, TaskContext, WorkerPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const LONG_WAIT: Duration = Duration::from_secs(5);

#[test]
fn test_graceful_shutdown_drains_queued_tasks() {
  setup_tracing_for_test();
  let pool = WorkerPool::fixed(2, "test_shutdown_graceful").unwrap();
  let completed = Arc::new(AtomicUsize::new(0));

  let futures: Vec<_> = (0..10)
    .map(|_| {
      let completed = completed.clone();
      pool
        .submit(move |_ctx| {
          thread::sleep(Duration::from_millis(10));
          completed.fetch_add(1, Ordering::SeqCst);
          Ok(())
        })
        .unwrap()
    })
    .collect();

  pool.shutdown();
  assert!(pool.is_shutdown());
  assert!(pool.submit(|_ctx| Ok(())).is_err());
  assert!(pool.await_termination(LONG_WAIT));

  assert_eq!(completed.load(Ordering::SeqCst), 10);
  assert!(futures.iter().all(|f| f.status() == FutureStatus::Completed));
  assert_eq!(pool.state(), PoolState::Terminated);
  assert_eq!(pool.worker_count(), 0);
}

#[test]
fn test_await_termination_reports_timeout() {
  setup_tracing_for_test();
  let pool = WorkerPool::fixed(1, "test_shutdown_await_timeout").unwrap();
  let (open, blocked) = gate();
  let blocker = pool
    .submit(move |_ctx| {
      blocked.recv().ok();
      Ok(())
    })
    .unwrap();

  pool.shutdown();
  assert!(!pool.await_termination(Duration::from_millis(50)));
  assert_eq!(pool.state(), PoolState::ShuttingDown);

  open.send(()).unwrap();
  assert!(pool.await_termination(LONG_WAIT));
  assert_eq!(blocker.get(), Ok(()));
}

#[test]
fn test_shutdown_now_cancels_queue_and_interrupts_running() {
  setup_tracing_for_test();
  let pool = WorkerPool::fixed(1, "test_shutdown_now").unwrap();
  let started = Arc::new(Barrier::new(2));

  let started_in_task = started.clone();
  let running = pool
    .submit(move |ctx: &TaskContext| {
      started_in_task.wait();
      ctx.sleep(Duration::from_secs(30))?;
      Ok(0)
    })
    .unwrap();
  started.wait();
  let queued: Vec<_> = (1..=3).map(|i| pool.submit(move |_ctx| Ok(i)).unwrap()).collect();

  let pending = pool.shutdown_now();
  let pending_ids: Vec<_> = pending.iter().map(|task| task.task_id()).collect();
  let queued_ids: Vec<_> = queued.iter().map(|f| f.id()).collect();
  assert_eq!(pending_ids, queued_ids);
  assert!(queued.iter().all(|f| f.get() == Err(PoolError::Cancelled)));

  assert_eq!(running.get_timeout(LONG_WAIT), Err(PoolError::Cancelled));
  assert!(pool.await_termination(LONG_WAIT));
  assert!(pool.is_terminated());
}

#[test]
fn test_shutdown_and_await_termination_escalates() {
  setup_tracing_for_test();
  let pool = WorkerPool::fixed(1, "test_shutdown_escalate").unwrap();
  let started = Arc::new(Barrier::new(2));

  let started_in_task = started.clone();
  let cooperative = pool
    .submit(move |ctx: &TaskContext| {
      started_in_task.wait();
      ctx.sleep(Duration::from_secs(30))?;
      Ok(())
    })
    .unwrap();
  started.wait();

  let began = Instant::now();
  pool.shutdown_and_await_termination(Duration::from_millis(100)).unwrap();
  assert!(began.elapsed() < Duration::from_secs(2));
  assert!(cooperative.is_cancelled());
}

#[test]
fn test_uncooperative_task_reports_did_not_terminate() {
  setup_tracing_for_test();
  let pool = WorkerPool::fixed(1, "test_shutdown_stubborn").unwrap();
  let started = Arc::new(Barrier::new(2));

  let started_in_task = started.clone();
  let stubborn = pool
    .submit(move |_ctx| {
      started_in_task.wait();
      // Ignores its cancellation token.
      thread::sleep(Duration::from_millis(400));
      Ok("done anyway")
    })
    .unwrap();
  started.wait();

  match pool.shutdown_and_await_termination(Duration::from_millis(50)) {
    Err(PoolError::DidNotTerminate { pool_name }) => assert_eq!(pool_name, "test_shutdown_stubborn"),
    other => panic!("expected DidNotTerminate, got {:?}", other),
  }
  // The token fired while it ran, so the outcome is Cancelled even though the body finished.
  assert_eq!(stubborn.get_timeout(LONG_WAIT), Err(PoolError::Cancelled));
  assert!(pool.await_termination(LONG_WAIT));
}

#[test]
fn test_shutdown_is_idempotent() {
  setup_tracing_for_test();
  let pool = WorkerPool::single("test_shutdown_idempotent").unwrap();
  pool.shutdown();
  pool.shutdown();
  assert!(pool.await_termination(LONG_WAIT));
  assert!(pool.shutdown_now().is_empty());
  pool.shutdown();
  assert_eq!(pool.state(), PoolState::Terminated);
}

#[test]
fn test_dropping_last_handle_finishes_queued_work() {
  setup_tracing_for_test();
  let completed = Arc::new(AtomicUsize::new(0));
  let futures: Vec<_> = {
    let pool = WorkerPool::fixed(2, "test_shutdown_on_drop").unwrap();
    (0..6)
      .map(|_| {
        let completed = completed.clone();
        pool
          .submit(move |_ctx| {
            thread::sleep(Duration::from_millis(10));
            completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
          })
          .unwrap()
      })
      .collect()
  };

  for future in &futures {
    assert_eq!(future.get_timeout(LONG_WAIT), Ok(()));
  }
  assert_eq!(completed.load(Ordering::SeqCst), 6);
}

#[test]
fn test_await_termination_accepts_unbounded_timeout() {
  setup_tracing_for_test();
  let pool = WorkerPool::fixed(1, "test_shutdown_unbounded_wait").unwrap();
  let task = pool
    .submit(|_ctx| {
      thread::sleep(Duration::from_millis(20));
      Ok(1)
    })
    .unwrap();

  pool.shutdown();
  assert!(pool.await_termination(Duration::MAX));
  assert_eq!(task.get_timeout(Duration::MAX), Ok(1));
  pool.shutdown_and_await_termination(Duration::MAX).unwrap();
}
