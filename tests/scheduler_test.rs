//! Integration tests for the transactional scheduler surface:
//! submission timing, admission, reservations, recurring handles, and the
//! synchronous run paths.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded};
use prometheus_task_kernel::builders::{Kernel, KernelBuilder};
use prometheus_task_kernel::config::{KernelConfig, RetryConfig};
use prometheus_task_kernel::core::{FnTask, Identity, KernelError, TaskError, TransactionManager};

fn build_kernel(config: KernelConfig) -> Kernel {
    KernelBuilder::new(config).build().expect("kernel builds")
}

fn small_config() -> KernelConfig {
    KernelConfig {
        worker_threads: 2,
        executor_queue_depth: 64,
        max_ready_tasks: 32,
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 10,
        },
        ..KernelConfig::default()
    }
}

#[test]
fn past_start_time_runs_immediately() {
    let kernel = build_kernel(small_config());
    let (tx, rx) = bounded(1);

    kernel
        .transaction_scheduler()
        .schedule_task_at(
            Arc::new(FnTask::new("test::Immediate", move |_| {
                let _ = tx.send(());
                Ok(())
            })),
            Identity::named("tester"),
            1, // long past
        )
        .unwrap();

    assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    kernel.shutdown();
}

#[test]
fn future_start_time_is_honored() {
    let kernel = build_kernel(small_config());
    let (tx, rx) = bounded(1);

    let start_at = prometheus_task_kernel::util::now_ms() + 150;
    kernel
        .transaction_scheduler()
        .schedule_task_at(
            Arc::new(FnTask::new("test::Delayed", move |_| {
                let _ = tx.send(());
                Ok(())
            })),
            Identity::named("tester"),
            start_at,
        )
        .unwrap();

    // Not yet due.
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    // Fires once the start time passes.
    assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    kernel.shutdown();
}

#[test]
fn admission_rejects_when_at_capacity() {
    let kernel = build_kernel(KernelConfig {
        worker_threads: 1,
        executor_queue_depth: 1,
        max_ready_tasks: 1,
        ..small_config()
    });
    let scheduler = kernel.transaction_scheduler();
    let (gate_tx, gate_rx) = bounded::<()>(1);

    scheduler
        .schedule_task(
            Arc::new(FnTask::new("test::Blocker", move |_| {
                let _ = gate_rx.recv_timeout(Duration::from_secs(10));
                Ok(())
            })),
            Identity::named("tester"),
        )
        .unwrap();

    let err = scheduler
        .schedule_task(
            Arc::new(FnTask::new("test::Overflow", |_| Ok(()))),
            Identity::named("tester"),
        )
        .unwrap_err();
    assert!(matches!(err, KernelError::TaskRejected(_)));

    gate_tx.send(()).unwrap();
    kernel.shutdown();
}

#[test]
fn owner_quota_is_independent_of_total_capacity() {
    let kernel = build_kernel(KernelConfig {
        max_tasks_per_owner: 1,
        ..small_config()
    });
    let scheduler = kernel.transaction_scheduler();
    let (gate_tx, gate_rx) = bounded::<()>(2);

    let gate_a = gate_rx.clone();
    scheduler
        .schedule_task(
            Arc::new(FnTask::new("test::AliceTask", move |_| {
                let _ = gate_a.recv_timeout(Duration::from_secs(10));
                Ok(())
            })),
            Identity::named("alice"),
        )
        .unwrap();

    // Alice is at quota; Bob is not.
    assert!(scheduler
        .schedule_task(
            Arc::new(FnTask::new("test::AliceTask", |_| Ok(()))),
            Identity::named("alice"),
        )
        .is_err());
    let gate_b = gate_rx.clone();
    assert!(scheduler
        .schedule_task(
            Arc::new(FnTask::new("test::BobTask", move |_| {
                let _ = gate_b.recv_timeout(Duration::from_secs(10));
                Ok(())
            })),
            Identity::named("bob"),
        )
        .is_ok());

    gate_tx.send(()).unwrap();
    gate_tx.send(()).unwrap();
    kernel.shutdown();
}

#[test]
fn run_task_retries_until_budget_is_exhausted() {
    let kernel = build_kernel(small_config());
    let attempts = Arc::new(AtomicU32::new(0));
    let task_attempts = Arc::clone(&attempts);

    let err = kernel
        .transaction_scheduler()
        .run_task(
            Arc::new(FnTask::new("test::AlwaysConflicted", move |_| {
                task_attempts.fetch_add(1, Ordering::Relaxed);
                Err(TaskError::retryable("simulated transient failure"))
            })),
            Identity::named("tester"),
        )
        .unwrap_err();

    // Every attempt in the budget ran; the terminal error is the last
    // transient failure.
    assert_eq!(attempts.load(Ordering::Relaxed), 3);
    assert!(err.is_retry_eligible());
    kernel.shutdown();
}

#[test]
fn run_task_returns_once_the_task_succeeds() {
    let kernel = build_kernel(small_config());
    let attempts = Arc::new(AtomicU32::new(0));
    let task_attempts = Arc::clone(&attempts);

    kernel
        .transaction_scheduler()
        .run_task(
            Arc::new(FnTask::new("test::EventuallyFine", move |_| {
                if task_attempts.fetch_add(1, Ordering::Relaxed) < 2 {
                    Err(TaskError::retryable("not yet"))
                } else {
                    Ok(())
                }
            })),
            Identity::named("tester"),
        )
        .unwrap();

    assert_eq!(attempts.load(Ordering::Relaxed), 3);
    let stats = kernel.transaction_scheduler().stats();
    assert!(stats.retried >= 2);
    assert_eq!(stats.completed, 1);
    kernel.shutdown();
}

#[test]
fn run_task_fatal_errors_are_not_retried() {
    let kernel = build_kernel(small_config());
    let attempts = Arc::new(AtomicU32::new(0));
    let task_attempts = Arc::clone(&attempts);

    let err = kernel
        .transaction_scheduler()
        .run_task(
            Arc::new(FnTask::new("test::Broken", move |_| {
                task_attempts.fetch_add(1, Ordering::Relaxed);
                Err(TaskError::fatal("corrupt input"))
            })),
            Identity::named("tester"),
        )
        .unwrap_err();

    assert_eq!(attempts.load(Ordering::Relaxed), 1);
    assert!(!err.is_retry_eligible());
    kernel.shutdown();
}

#[test]
fn run_task_in_ambient_transaction_neither_commits_nor_retries() {
    let kernel = build_kernel(small_config());
    let manager = kernel.transaction_manager();
    let attempts = Arc::new(AtomicU32::new(0));
    let task_attempts = Arc::clone(&attempts);

    let txn = manager.begin(Identity::named("tester"));
    let err = kernel
        .transaction_scheduler()
        .run_task_in(
            Arc::new(FnTask::new("test::NestedWork", move |ctx| {
                assert!(ctx.transaction().is_some());
                task_attempts.fetch_add(1, Ordering::Relaxed);
                Err(TaskError::retryable("would retry outside ambient txn"))
            })),
            &txn,
        )
        .unwrap_err();

    // Propagated immediately: one attempt, no retry.
    assert_eq!(attempts.load(Ordering::Relaxed), 1);
    assert!(err.is_retry_eligible());

    // The enclosing transaction is untouched and still commits.
    assert!(manager.is_active(txn.id()));
    manager.commit(&txn).unwrap();
    kernel.shutdown();
}

#[test]
fn run_task_in_requires_an_active_transaction() {
    let kernel = build_kernel(small_config());
    let manager = kernel.transaction_manager();

    let txn = manager.begin(Identity::named("tester"));
    manager.commit(&txn).unwrap();

    let err = kernel
        .transaction_scheduler()
        .run_task_in(Arc::new(FnTask::new("test::Late", |_| Ok(()))), &txn)
        .unwrap_err();
    assert!(matches!(err, KernelError::TransactionState(_)));
    kernel.shutdown();
}

#[test]
fn reservation_use_and_cancel_are_mutually_exclusive() {
    let kernel = build_kernel(small_config());
    let scheduler = kernel.transaction_scheduler();

    let used = scheduler
        .reserve_task(
            Arc::new(FnTask::new("test::Reserved", |_| Ok(()))),
            Identity::named("tester"),
        )
        .unwrap();
    used.use_reservation().unwrap();
    assert!(matches!(
        used.use_reservation(),
        Err(KernelError::InvalidState(_))
    ));
    assert!(matches!(used.cancel(), Err(KernelError::InvalidState(_))));

    let cancelled = scheduler
        .reserve_task(
            Arc::new(FnTask::new("test::Reserved", |_| Ok(()))),
            Identity::named("tester"),
        )
        .unwrap();
    cancelled.cancel().unwrap();
    assert!(matches!(
        cancelled.use_reservation(),
        Err(KernelError::InvalidState(_))
    ));
    assert!(matches!(cancelled.cancel(), Err(KernelError::InvalidState(_))));
    kernel.shutdown();
}

#[test]
fn racing_use_and_cancel_admit_exactly_one_winner() {
    let kernel = build_kernel(small_config());
    let reservation = Arc::new(
        kernel
            .transaction_scheduler()
            .reserve_task(
                Arc::new(FnTask::new("test::Raced", |_| Ok(()))),
                Identity::named("tester"),
            )
            .unwrap(),
    );

    let user = Arc::clone(&reservation);
    let canceller = Arc::clone(&reservation);
    let use_handle = thread::spawn(move || user.use_reservation().is_ok());
    let cancel_handle = thread::spawn(move || canceller.cancel().is_ok());

    let use_won = use_handle.join().unwrap();
    let cancel_won = cancel_handle.join().unwrap();
    assert!(use_won ^ cancel_won, "exactly one transition must win");
    kernel.shutdown();
}

#[test]
fn reservation_holds_capacity_until_resolved() {
    let kernel = build_kernel(KernelConfig {
        max_ready_tasks: 1,
        executor_queue_depth: 1,
        ..small_config()
    });
    let scheduler = kernel.transaction_scheduler();

    let reservation = scheduler
        .reserve_task(
            Arc::new(FnTask::new("test::Hold", |_| Ok(()))),
            Identity::named("tester"),
        )
        .unwrap();

    // The promise holds the only capacity unit.
    assert!(scheduler
        .schedule_task(
            Arc::new(FnTask::new("test::Crowded", |_| Ok(()))),
            Identity::named("tester"),
        )
        .is_err());

    // Cancelling releases it at no cost.
    reservation.cancel().unwrap();
    assert!(scheduler
        .schedule_task(
            Arc::new(FnTask::new("test::NowFits", |_| Ok(()))),
            Identity::named("tester"),
        )
        .is_ok());
    kernel.shutdown();
}

#[test]
fn reservation_with_elapsed_start_time_runs_immediately_on_use() {
    let kernel = build_kernel(small_config());
    let (tx, rx) = bounded(1);

    let reservation = kernel
        .transaction_scheduler()
        .reserve_task_at(
            Arc::new(FnTask::new("test::Overdue", move |_| {
                let _ = tx.send(());
                Ok(())
            })),
            Identity::named("tester"),
            1, // long past by the time use() is called
        )
        .unwrap();

    thread::sleep(Duration::from_millis(20));
    reservation.use_reservation().unwrap();
    assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    kernel.shutdown();
}

#[test]
fn recurring_period_must_be_positive() {
    let kernel = build_kernel(small_config());
    let err = kernel
        .transaction_scheduler()
        .schedule_recurring_task(
            Arc::new(FnTask::new("test::NoPeriod", |_| Ok(()))),
            Identity::named("tester"),
            0,
            0,
        )
        .unwrap_err();
    assert!(matches!(err, KernelError::InvalidArgument(_)));
    kernel.shutdown();
}

#[test]
fn recurring_task_ticks_until_cancelled() {
    let kernel = build_kernel(small_config());
    let ticks = Arc::new(AtomicU32::new(0));
    let task_ticks = Arc::clone(&ticks);

    let handle = kernel
        .transaction_scheduler()
        .schedule_recurring_task(
            Arc::new(FnTask::new("test::Heartbeat", move |_| {
                task_ticks.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })),
            Identity::named("tester"),
            0,
            25,
        )
        .unwrap();

    // Nothing runs before start().
    thread::sleep(Duration::from_millis(80));
    assert_eq!(ticks.load(Ordering::Relaxed), 0);

    handle.start().unwrap();
    thread::sleep(Duration::from_millis(300));
    assert!(ticks.load(Ordering::Relaxed) >= 2);

    handle.cancel().unwrap();
    assert!(handle.is_cancelled());
    // Let any already-submitted tick drain, then verify the recurrence is dead.
    thread::sleep(Duration::from_millis(60));
    let settled = ticks.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(ticks.load(Ordering::Relaxed), settled);
    kernel.shutdown();
}

#[test]
fn recurring_cancel_before_start_prevents_any_execution() {
    let kernel = build_kernel(small_config());
    let ticks = Arc::new(AtomicU32::new(0));
    let task_ticks = Arc::clone(&ticks);

    let handle = kernel
        .transaction_scheduler()
        .schedule_recurring_task(
            Arc::new(FnTask::new("test::NeverRuns", move |_| {
                task_ticks.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })),
            Identity::named("tester"),
            0,
            20,
        )
        .unwrap();

    handle.cancel().unwrap();
    assert!(matches!(handle.start(), Err(KernelError::InvalidState(_))));
    assert!(matches!(handle.cancel(), Err(KernelError::InvalidState(_))));

    thread::sleep(Duration::from_millis(150));
    assert_eq!(ticks.load(Ordering::Relaxed), 0);
    kernel.shutdown();
}

#[test]
fn recurring_tick_failure_does_not_stop_the_recurrence() {
    // One capacity unit, permanently occupied: every tick is rejected at
    // admission, yet ticking continues and resumes once capacity frees up.
    let kernel = build_kernel(KernelConfig {
        worker_threads: 1,
        executor_queue_depth: 2,
        max_ready_tasks: 2,
        ..small_config()
    });
    let scheduler = kernel.transaction_scheduler();
    let (gate_tx, gate_rx) = unbounded::<()>();

    scheduler
        .schedule_task(
            Arc::new(FnTask::new("test::Hog", move |_| {
                let _ = gate_rx.recv_timeout(Duration::from_secs(10));
                Ok(())
            })),
            Identity::named("hog"),
        )
        .unwrap();

    let ticks = Arc::new(AtomicU32::new(0));
    let task_ticks = Arc::clone(&ticks);
    let handle = scheduler
        .schedule_recurring_task(
            Arc::new(FnTask::new("test::Persistent", move |_| {
                task_ticks.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })),
            Identity::named("tester"),
            0,
            20,
        )
        .unwrap();
    // Saturate the remaining capacity so ticks get rejected for a while.
    let (hold_tx, hold_rx) = unbounded::<()>();
    scheduler
        .schedule_task(
            Arc::new(FnTask::new("test::Hog2", move |_| {
                let _ = hold_rx.recv_timeout(Duration::from_secs(10));
                Ok(())
            })),
            Identity::named("hog"),
        )
        .unwrap();

    handle.start().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(ticks.load(Ordering::Relaxed), 0, "capacity was saturated");

    // Free capacity; the recurrence must pick up again on later ticks.
    hold_tx.send(()).unwrap();
    gate_tx.send(()).unwrap();
    thread::sleep(Duration::from_millis(300));
    assert!(ticks.load(Ordering::Relaxed) >= 1);

    handle.cancel().unwrap();
    kernel.shutdown();
}
