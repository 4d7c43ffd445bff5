//! End-to-end access-conflict arbitration: data layers report accesses from
//! inside scheduled transactions, the coordinator aborts the younger side,
//! and the scheduler retries it to completion.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded};
use prometheus_task_kernel::access::AccessType;
use prometheus_task_kernel::builders::{Kernel, KernelBuilder};
use prometheus_task_kernel::config::{KernelConfig, RetryConfig};
use prometheus_task_kernel::core::{FnTask, Identity, TaskError, TransactionManager};
use prometheus_task_kernel::profile::InMemoryProfileListener;

fn conflict_kernel() -> (Kernel, Arc<InMemoryProfileListener>) {
    let listener = Arc::new(InMemoryProfileListener::new(64));
    let kernel = KernelBuilder::new(KernelConfig {
        worker_threads: 2,
        retry: RetryConfig {
            max_attempts: 50,
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
        },
        ..KernelConfig::default()
    })
    .with_profile_listener(listener.clone())
    .build()
    .expect("kernel builds");
    (kernel, listener)
}

#[test]
fn conflicting_writers_both_eventually_commit() {
    let (kernel, listener) = conflict_kernel();
    let kernel = Arc::new(kernel);
    let reporter = kernel.coordinator().register_source("ledger-service");

    let (a_reported_tx, a_reported_rx) = bounded::<()>(1);
    let (gate_tx, gate_rx) = unbounded::<()>();

    // Writer A: touches the ledger first, then holds its transaction open
    // until the gate opens.
    let kernel_a = Arc::clone(&kernel);
    let reporter_a = reporter.clone();
    let writer_a = thread::spawn(move || {
        kernel_a.transaction_scheduler().run_task(
            Arc::new(FnTask::new("test::WriterA", move |ctx| {
                let txn = ctx.transaction().expect("runs transactionally");
                reporter_a
                    .report_object_access(txn, "ledger", AccessType::Write)
                    .map_err(TaskError::from)?;
                let _ = a_reported_tx.try_send(());
                let _ = gate_rx.recv_timeout(Duration::from_secs(10));
                Ok(())
            })),
            Identity::named("writer-a"),
        )
    });

    a_reported_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("writer A reported its access");

    // Writer B begins strictly after A, so B is the younger transaction and
    // loses the arbitration until A commits.
    let kernel_b = Arc::clone(&kernel);
    let reporter_b = reporter.clone();
    let writer_b = thread::spawn(move || {
        kernel_b.transaction_scheduler().run_task(
            Arc::new(FnTask::new("test::WriterB", move |ctx| {
                let txn = ctx.transaction().expect("runs transactionally");
                reporter_b
                    .report_object_access(txn, "ledger", AccessType::Write)
                    .map_err(TaskError::from)?;
                Ok(())
            })),
            Identity::named("writer-b"),
        )
    });

    // Let B collide with A a few times before releasing A.
    thread::sleep(Duration::from_millis(50));
    gate_tx.send(()).unwrap();

    writer_a.join().unwrap().expect("writer A commits");
    writer_b.join().unwrap().expect("writer B commits after retrying");

    let stats = kernel.transaction_scheduler().stats();
    assert!(stats.retried >= 1, "writer B must have been retried");
    assert!(!listener.conflicts().is_empty());
    kernel.shutdown();
}

#[test]
fn conflict_aborts_exactly_one_transaction_deterministically() {
    let (kernel, listener) = conflict_kernel();
    let manager = kernel.transaction_manager();
    let reporter = kernel.coordinator().register_source("data-service");

    let older = manager.begin(Identity::named("older"));
    let younger = manager.begin(Identity::named("younger"));

    reporter
        .report_object_access(&older, "acct-7", AccessType::Write)
        .unwrap();
    let err = reporter
        .report_object_access(&younger, "acct-7", AccessType::Read)
        .unwrap_err();
    assert!(err.is_retry_eligible());

    assert!(manager.is_active(older.id()));
    assert!(!manager.is_active(younger.id()));

    let conflicts = listener.conflicts();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].winner, older.id());
    assert_eq!(conflicts[0].victim, younger.id());
    assert_eq!(conflicts[0].source.as_ref(), "data-service");

    manager.commit(&older).unwrap();
    kernel.shutdown();
}

#[test]
fn concurrent_readers_are_left_alone() {
    let (kernel, listener) = conflict_kernel();
    let manager = kernel.transaction_manager();
    let reporter = kernel.coordinator().register_source("data-service");

    let a = manager.begin(Identity::named("a"));
    let b = manager.begin(Identity::named("b"));
    reporter
        .report_object_access(&a, "config", AccessType::Read)
        .unwrap();
    reporter
        .report_object_access(&b, "config", AccessType::Read)
        .unwrap();

    assert!(manager.is_active(a.id()));
    assert!(manager.is_active(b.id()));
    assert!(listener.conflicts().is_empty());
    assert_eq!(listener.accesses().len(), 2);

    manager.commit(&a).unwrap();
    manager.commit(&b).unwrap();
    kernel.shutdown();
}
