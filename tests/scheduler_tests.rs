mod common;

use common::setup_tracing_for_test;
use futures_conductor::{BoxError, ExecutorService, PoolError, PoolState, Scheduler, TaskContext};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const LONG_WAIT: Duration = Duration::from_secs(5);

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + LONG_WAIT;
  while !condition() {
    if Instant::now() >= deadline {
      return false;
    }
    thread::sleep(Duration::from_millis(5));
  }
  true
}

#[test]
fn test_schedule_waits_for_delay() {
  setup_tracing_for_test();
  let scheduler = Scheduler::new(1, "test_sched_delay").unwrap();

  let submitted = Instant::now();
  let future = scheduler.schedule(move |_ctx| Ok(submitted.elapsed()), Duration::from_millis(80)).unwrap();
  let waited = future.get_timeout(LONG_WAIT).unwrap();
  assert!(waited >= Duration::from_millis(80), "ran after only {:?}", waited);

  scheduler.shutdown_and_await_termination(LONG_WAIT).unwrap();
}

#[test]
fn test_delayed_tasks_run_in_due_order() {
  setup_tracing_for_test();
  let scheduler = Scheduler::new(1, "test_sched_order").unwrap();
  let order = Arc::new(Mutex::new(Vec::new()));

  let futures: Vec<_> = [(3, 90), (1, 30), (2, 60), (0, 0)]
    .into_iter()
    .map(|(label, delay_ms)| {
      let order = order.clone();
      scheduler
        .schedule(
          move |_ctx| {
            order.lock().push(label);
            Ok(())
          },
          Duration::from_millis(delay_ms),
        )
        .unwrap()
    })
    .collect();
  for future in &futures {
    future.get_timeout(LONG_WAIT).unwrap();
  }
  assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
  scheduler.shutdown_and_await_termination(LONG_WAIT).unwrap();
}

#[test]
fn test_cancelled_delayed_task_leaves_the_queue() {
  setup_tracing_for_test();
  let scheduler = Scheduler::new(1, "test_sched_cancel_delayed").unwrap();

  let future = scheduler.schedule(|_ctx| Ok("too late"), Duration::from_secs(30)).unwrap();
  assert_eq!(scheduler.queued_task_count(), 1);
  assert!(future.cancel(false));
  assert_eq!(scheduler.queued_task_count(), 0, "cancelled entries are removed right away");
  assert_eq!(future.get(), Err(PoolError::Cancelled));

  // Nothing due is left, so termination does not wait 30 seconds.
  scheduler.shutdown();
  assert!(scheduler.await_termination(LONG_WAIT));
}

#[test]
fn test_fixed_rate_runs_stay_on_the_period_grid() {
  setup_tracing_for_test();
  let scheduler = Scheduler::new(1, "test_sched_fixed_rate").unwrap();
  let period = Duration::from_millis(30);
  let nominal = Arc::new(Mutex::new(Vec::new()));

  let sink = nominal.clone();
  let handle = scheduler
    .schedule_at_fixed_rate(
      move |ctx: &TaskContext| {
        sink.lock().extend(ctx.scheduled_time());
        Ok(())
      },
      Duration::from_millis(10),
      period,
    )
    .unwrap();

  assert!(wait_until(|| handle.run_count() >= 5));
  handle.cancel(false);
  let nominal = nominal.lock().clone();
  assert!(nominal.len() >= 5);
  for pair in nominal.windows(2) {
    let gap = pair[1] - pair[0];
    assert!(gap >= period, "runs closer than one period: {:?}", gap);
    assert_eq!(gap.as_nanos() % period.as_nanos(), 0, "due-times drifted off the grid: {:?}", gap);
  }
  scheduler.shutdown_and_await_termination(LONG_WAIT).unwrap();
}

#[test]
fn test_fixed_rate_overrun_does_not_burst() {
  setup_tracing_for_test();
  let scheduler = Scheduler::new(1, "test_sched_overrun").unwrap();
  let period = Duration::from_millis(50);
  let nominal = Arc::new(Mutex::new(Vec::new()));

  let sink = nominal.clone();
  let handle = scheduler
    .schedule_at_fixed_rate(
      move |ctx: &TaskContext| {
        sink.lock().extend(ctx.scheduled_time());
        thread::sleep(Duration::from_millis(120));
        Ok(())
      },
      Duration::ZERO,
      period,
    )
    .unwrap();

  assert!(wait_until(|| handle.run_count() >= 4));
  handle.cancel(false);
  let nominal = nominal.lock().clone();
  // Each 120ms run misses at least two grid points, which are skipped rather than replayed.
  for pair in nominal.windows(2) {
    let gap = pair[1] - pair[0];
    assert!(gap >= period * 2, "missed runs were replayed: {:?}", gap);
    assert_eq!(gap.as_nanos() % period.as_nanos(), 0);
  }
  scheduler.shutdown_and_await_termination(LONG_WAIT).unwrap();
}

#[test]
fn test_fixed_delay_is_measured_from_run_end() {
  setup_tracing_for_test();
  let scheduler = Scheduler::new(1, "test_sched_fixed_delay").unwrap();
  let delay = Duration::from_millis(40);
  let spans = Arc::new(Mutex::new(Vec::new()));

  let sink = spans.clone();
  let handle = scheduler
    .schedule_with_fixed_delay(
      move |_ctx: &TaskContext| {
        let start = Instant::now();
        thread::sleep(Duration::from_millis(25));
        sink.lock().push((start, Instant::now()));
        Ok(())
      },
      Duration::ZERO,
      delay,
    )
    .unwrap();

  assert!(wait_until(|| spans.lock().len() >= 4));
  handle.cancel(false);
  let spans = spans.lock().clone();
  for pair in spans.windows(2) {
    let (_, previous_end) = pair[0];
    let (next_start, _) = pair[1];
    assert!(next_start - previous_end >= delay);
  }
  scheduler.shutdown_and_await_termination(LONG_WAIT).unwrap();
}

#[test]
fn test_cancel_stops_periodic_rescheduling() {
  setup_tracing_for_test();
  let scheduler = Scheduler::new(2, "test_sched_cancel_periodic").unwrap();
  let runs = Arc::new(AtomicUsize::new(0));

  let counter = runs.clone();
  let handle = scheduler
    .schedule_at_fixed_rate(
      move |_ctx: &TaskContext| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
      },
      Duration::ZERO,
      Duration::from_millis(10),
    )
    .unwrap();
  assert!(wait_until(|| runs.load(Ordering::SeqCst) >= 3));
  assert!(!handle.is_done(), "a live periodic handle stays pending");

  assert!(handle.cancel(false));
  assert!(handle.is_cancelled());
  assert_eq!(handle.get(), Err(PoolError::Cancelled));
  // Allow an in-flight run to finish, then the count must hold still.
  thread::sleep(Duration::from_millis(50));
  let settled = runs.load(Ordering::SeqCst);
  thread::sleep(Duration::from_millis(60));
  assert_eq!(runs.load(Ordering::SeqCst), settled);
  assert_eq!(scheduler.queued_task_count(), 0);
  scheduler.shutdown_and_await_termination(LONG_WAIT).unwrap();
}

#[test]
fn test_interrupting_cancel_reaches_in_flight_run() {
  setup_tracing_for_test();
  let scheduler = Scheduler::new(1, "test_sched_interrupt_periodic").unwrap();
  let interrupted = Arc::new(AtomicUsize::new(0));

  let flag = interrupted.clone();
  let handle = scheduler
    .schedule_with_fixed_delay(
      move |ctx: &TaskContext| {
        if ctx.sleep(Duration::from_secs(30)).is_err() {
          flag.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
      },
      Duration::ZERO,
      Duration::from_millis(10),
    )
    .unwrap();
  assert!(wait_until(|| scheduler.active_task_count() == 1));

  assert!(handle.cancel(true));
  assert!(wait_until(|| interrupted.load(Ordering::SeqCst) == 1));
  assert!(wait_until(|| handle.run_count() == 1));
  assert!(handle.is_cancelled());
  scheduler.shutdown_and_await_termination(LONG_WAIT).unwrap();
}

#[test]
fn test_failing_periodic_run_ends_the_series() {
  setup_tracing_for_test();
  let scheduler = Scheduler::new(1, "test_sched_periodic_failure").unwrap();

  let mut remaining = 3;
  let handle = scheduler
    .schedule_at_fixed_rate(
      move |_ctx: &TaskContext| -> Result<(), BoxError> {
        remaining -= 1;
        if remaining == 0 {
          return Err("sensor offline".into());
        }
        Ok(())
      },
      Duration::ZERO,
      Duration::from_millis(10),
    )
    .unwrap();

  match handle.get_timeout(LONG_WAIT) {
    Err(PoolError::TaskFailure(failure)) => assert_eq!(failure.cause().to_string(), "sensor offline"),
    other => panic!("expected the run's failure, got {:?}", other),
  }
  assert_eq!(handle.run_count(), 3);
  thread::sleep(Duration::from_millis(40));
  assert_eq!(handle.run_count(), 3);
  scheduler.shutdown_and_await_termination(LONG_WAIT).unwrap();
}

#[test]
fn test_zero_period_is_rejected() {
  setup_tracing_for_test();
  let scheduler = Scheduler::new(1, "test_sched_zero_period").unwrap();
  let result = scheduler.schedule_at_fixed_rate(|_ctx: &TaskContext| Ok(()), Duration::ZERO, Duration::ZERO);
  assert!(matches!(result, Err(PoolError::ZeroPeriod)));
  scheduler.shutdown_and_await_termination(LONG_WAIT).unwrap();
}

#[test]
fn test_shutdown_cancels_periodic_but_runs_delayed_one_shots() {
  setup_tracing_for_test();
  let scheduler = Scheduler::new(1, "test_sched_shutdown").unwrap();

  let periodic = scheduler
    .schedule_at_fixed_rate(|_ctx: &TaskContext| Ok(()), Duration::from_millis(500), Duration::from_millis(20))
    .unwrap();
  let delayed = scheduler.schedule(|_ctx| Ok("delivered"), Duration::from_millis(100)).unwrap();

  scheduler.shutdown();
  assert_eq!(scheduler.state(), PoolState::ShuttingDown);
  assert!(periodic.is_cancelled());
  assert!(scheduler.schedule(|_ctx| Ok("rejected"), Duration::ZERO).is_err());

  assert_eq!(delayed.get_timeout(LONG_WAIT), Ok("delivered"));
  assert!(scheduler.await_termination(LONG_WAIT));
  assert!(scheduler.is_terminated());
}

#[test]
fn test_shutdown_now_returns_pending_entries() {
  setup_tracing_for_test();
  let scheduler = Scheduler::new(1, "test_sched_shutdown_now").unwrap();

  let first = scheduler.schedule(|_ctx| Ok(1), Duration::from_secs(10)).unwrap();
  let second = scheduler.schedule(|_ctx| Ok(2), Duration::from_secs(20)).unwrap();
  let periodic = scheduler
    .schedule_with_fixed_delay(|_ctx: &TaskContext| Ok(()), Duration::from_secs(5), Duration::from_secs(1))
    .unwrap();

  let pending = scheduler.shutdown_now();
  let ids: Vec<_> = pending.iter().map(|task| task.task_id()).collect();
  assert_eq!(ids, vec![periodic.id(), first.id(), second.id()], "returned in due order");
  assert!(pending[0].is_periodic());
  assert_eq!(first.get(), Err(PoolError::Cancelled));
  assert!(periodic.is_cancelled());
  assert!(scheduler.await_termination(LONG_WAIT));
}

#[test]
fn test_unrepresentable_delays_are_accepted() {
  setup_tracing_for_test();
  let scheduler = Scheduler::new(1, "test_sched_huge_delay").unwrap();

  let someday = scheduler.schedule(|_ctx| Ok("someday"), Duration::MAX).unwrap();
  let periodic = scheduler
    .schedule_with_fixed_delay(|_ctx: &TaskContext| Ok(()), Duration::MAX, Duration::MAX)
    .unwrap();
  assert_eq!(scheduler.queued_task_count(), 2);
  assert_eq!(someday.get_timeout(Duration::from_millis(20)), Err(PoolError::Timeout));

  assert!(someday.cancel(false));
  assert!(periodic.cancel(false));
  assert_eq!(scheduler.queued_task_count(), 0);
  scheduler.shutdown_and_await_termination(LONG_WAIT).unwrap();
}
