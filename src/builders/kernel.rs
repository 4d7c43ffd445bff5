//! Kernel bootstrap: assemble the schedulers from configuration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use crate::access::AccessCoordinator;
use crate::config::KernelConfig;
use crate::core::error::AppResult;
use crate::core::transaction::{
    InMemoryTransactionManager, TransactionManager, TransactionObserver,
};
use crate::profile::ProfileListener;
use crate::runtime::{Executor, ThreadPoolExecutor};
use crate::sched::timer::TimerThread;
use crate::sched::{TaskScheduler, TransactionScheduler};

/// Builder wiring configuration into a running [`Kernel`].
pub struct KernelBuilder {
    config: KernelConfig,
    listeners: Vec<Arc<dyn ProfileListener>>,
    executor: Option<Arc<dyn Executor>>,
}

impl KernelBuilder {
    /// Start a builder from the given configuration.
    #[must_use]
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            listeners: Vec::new(),
            executor: None,
        }
    }

    /// Attach a profiling listener to the access coordinator.
    #[must_use]
    pub fn with_profile_listener(mut self, listener: Arc<dyn ProfileListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Use a caller-provided executor instead of the built-in thread pool.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Assemble the kernel: executor, timer, transaction manager, access
    /// coordinator (wired as the manager's observer), and both schedulers.
    ///
    /// # Errors
    ///
    /// Configuration validation failures and thread-spawn failures.
    pub fn build(self) -> AppResult<Kernel> {
        crate::util::telemetry::init_tracing();
        self.config
            .validate()
            .map_err(|e| anyhow::anyhow!("kernel config invalid: {e}"))?;

        let executor: Arc<dyn Executor> = match self.executor {
            Some(executor) => executor,
            None => Arc::new(
                ThreadPoolExecutor::new(
                    self.config.worker_threads,
                    self.config.executor_queue_depth,
                )
                .context("failed to build thread pool")?,
            ),
        };
        let timer = Arc::new(TimerThread::spawn().context("failed to start timer thread")?);

        let txn_manager = Arc::new(InMemoryTransactionManager::new());
        let dyn_manager: Arc<dyn TransactionManager> = txn_manager.clone();
        let coordinator = Arc::new(AccessCoordinator::new(dyn_manager.clone()));
        let coordinator_observer: Arc<dyn TransactionObserver> = coordinator.clone();
        let observer: Weak<dyn TransactionObserver> = Arc::downgrade(&coordinator_observer);
        txn_manager.set_observer(observer);
        for listener in self.listeners {
            coordinator.add_profile_listener(listener);
        }

        let transaction_scheduler = TransactionScheduler::new(
            dyn_manager,
            Arc::clone(&executor),
            Arc::clone(&timer),
            &self.config,
        );
        let task_scheduler =
            TaskScheduler::new(Arc::clone(&executor), Arc::clone(&timer), &self.config);

        info!(
            worker_threads = self.config.worker_threads,
            max_ready_tasks = self.config.max_ready_tasks,
            "kernel assembled"
        );

        Ok(Kernel {
            config: self.config,
            executor,
            timer,
            txn_manager,
            coordinator,
            transaction_scheduler,
            task_scheduler,
        })
    }
}

/// The assembled kernel: both schedulers plus the collaborators they share.
pub struct Kernel {
    config: KernelConfig,
    executor: Arc<dyn Executor>,
    timer: Arc<TimerThread>,
    txn_manager: Arc<InMemoryTransactionManager>,
    coordinator: Arc<AccessCoordinator>,
    transaction_scheduler: TransactionScheduler,
    task_scheduler: TaskScheduler,
}

impl Kernel {
    /// The transactional scheduler.
    #[must_use]
    pub fn transaction_scheduler(&self) -> &TransactionScheduler {
        &self.transaction_scheduler
    }

    /// The non-transactional scheduler for long-running work.
    #[must_use]
    pub fn task_scheduler(&self) -> &TaskScheduler {
        &self.task_scheduler
    }

    /// The access coordinator; register sources here.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<AccessCoordinator> {
        &self.coordinator
    }

    /// The in-process transaction manager.
    #[must_use]
    pub fn transaction_manager(&self) -> &Arc<InMemoryTransactionManager> {
        &self.txn_manager
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Shut the kernel down.
    ///
    /// A watchdog is armed on the timer for the configured grace period and
    /// disarmed once the executor winds down cleanly; if the grace period
    /// elapses first, the remaining workers are detached and the watchdog
    /// says so.
    pub fn shutdown(&self) {
        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        let done = Arc::new(AtomicBool::new(false));
        let watchdog_done = Arc::clone(&done);
        self.timer.schedule_after(grace, move || {
            if !watchdog_done.load(Ordering::Acquire) {
                warn!("shutdown grace period elapsed; detaching remaining workers");
            }
        });

        self.executor.shutdown(grace);
        done.store(true, Ordering::Release);
        self.timer.shutdown();
        info!("kernel shut down");
    }
}
