//! Thread-pool executor with dedicated OS worker threads.
//!
//! Workers block on a bounded channel; there is no polling anywhere. Dropping
//! the sender unblocks idle workers naturally, so shutdown is just "stop
//! sending, then join with a timeout". A panicking job is isolated and never
//! takes its worker thread down.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::core::error::KernelError;
use crate::runtime::{Executor, Job};

/// Executor backed by dedicated OS threads and a bounded task channel.
pub struct ThreadPoolExecutor {
    /// Task sender to workers. `None` once shutdown has begun.
    task_tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    worker_count: usize,
}

impl ThreadPoolExecutor {
    /// Spawn `worker_count` worker threads sharing a queue of `queue_depth`.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] for zero workers or depth;
    /// [`KernelError::InvalidState`] if a worker thread cannot be spawned.
    pub fn new(worker_count: usize, queue_depth: usize) -> Result<Self, KernelError> {
        if worker_count == 0 {
            return Err(KernelError::InvalidArgument(
                "worker_count must be greater than 0".into(),
            ));
        }
        if queue_depth == 0 {
            return Err(KernelError::InvalidArgument(
                "queue_depth must be greater than 0".into(),
            ));
        }

        let (task_tx, task_rx) = bounded::<Job>(queue_depth);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            workers.push(spawn_worker(
                worker_id,
                task_rx.clone(),
                Arc::clone(&shutdown),
            )?);
        }

        info!(worker_count, queue_depth, "thread pool initialized");

        Ok(Self {
            task_tx: Mutex::new(Some(task_tx)),
            workers: Mutex::new(workers),
            shutdown,
            worker_count,
        })
    }

    /// Number of worker threads.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}

impl Executor for ThreadPoolExecutor {
    fn submit(&self, job: Job) -> Result<(), KernelError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(KernelError::TaskRejected("executor is shut down".into()));
        }

        let task_tx = self.task_tx.lock();
        let Some(tx) = task_tx.as_ref() else {
            return Err(KernelError::TaskRejected("executor is shut down".into()));
        };

        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("executor queue is full");
                Err(KernelError::TaskRejected("executor queue is full".into()))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(KernelError::TaskRejected("executor is shut down".into()))
            }
        }
    }

    fn shutdown(&self, grace: Duration) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return; // already shut down
        }

        info!("shutting down thread pool");

        // Drop the sender to unblock workers waiting on recv().
        {
            let mut task_tx = self.task_tx.lock();
            *task_tx = None;
        }

        let mut workers = self.workers.lock();
        for (worker_id, worker) in workers.drain(..).enumerate() {
            let (tx, rx) = std::sync::mpsc::channel();
            let join_thread = thread::spawn(move || {
                let result = worker.join();
                let _ = tx.send(result.is_ok());
            });

            match rx.recv_timeout(grace) {
                Ok(true) => {
                    debug!(worker_id, "worker joined");
                    let _ = join_thread.join();
                }
                Ok(false) => {
                    warn!(worker_id, "worker panicked");
                    let _ = join_thread.join();
                }
                Err(_) => {
                    // The worker is stuck in a long task; detach it rather
                    // than hold up the rest of shutdown.
                    warn!(worker_id, "worker did not exit within grace period; detaching");
                }
            }
        }
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        // Signal shutdown but do not join in Drop; explicit shutdown() is
        // required for graceful cleanup.
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            let mut task_tx = self.task_tx.lock();
            *task_tx = None;
            debug!("thread pool dropped without explicit shutdown; workers will be detached");
        }
    }
}

fn spawn_worker(
    worker_id: usize,
    task_rx: Receiver<Job>,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, KernelError> {
    thread::Builder::new()
        .name(format!("kernel-worker-{worker_id}"))
        .spawn(move || {
            debug!(worker_id, "worker thread started");

            loop {
                // Blocking recv; when the sender is dropped this returns Err
                // and the worker exits cleanly.
                let job = match task_rx.recv() {
                    Ok(job) => job,
                    Err(_) => {
                        debug!(worker_id, "worker channel closed, exiting");
                        break;
                    }
                };

                if shutdown.load(Ordering::Acquire) {
                    debug!(worker_id, "worker shutting down, exiting");
                    break;
                }

                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    warn!(worker_id, "task panicked");
                }
            }

            debug!(worker_id, "worker thread exiting");
        })
        .map_err(|e| KernelError::Internal(format!("failed to spawn worker thread: {e}")))
}
