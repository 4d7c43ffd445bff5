//! # Prometheus Task Kernel
//!
//! A transactional task-execution kernel for the Prometheus AI Platform.
//!
//! This library provides a scheduling layer that runs short-lived units of
//! work inside transactions, detects read/write conflicts between
//! concurrently running tasks on shared objects, aborts and retries the
//! losing side, and offers capacity reservations so callers can guarantee a
//! task will be accepted before committing other transactional state.
//!
//! ## Core Problem Solved
//!
//! Concurrent workloads that touch shared state have failure modes a plain
//! thread pool cannot express:
//!
//! - **Conflicting work must lose deterministically**: two tasks writing the
//!   same object cannot both commit; one side has to be aborted and re-run
//! - **Transient failure is normal**: a conflict abort is not an error worth
//!   surfacing; the kernel retries the work transparently
//! - **Capacity must be reservable**: transactional code often needs a hard
//!   guarantee that a follow-up task will be accepted before it can commit
//! - **Dependent tasks need ordering**: some chains must run strictly one at
//!   a time regardless of how many workers are free
//!
//! ## Key Features
//!
//! - **Transactional scheduling**: immediate, delayed, and periodic
//!   submission; every task runs in its own transaction with retry on
//!   conflict ([`sched::TransactionScheduler`])
//! - **Access coordination**: data layers report shared-object touches
//!   through per-source reporters; conflicts abort the younger transaction
//!   deterministically ([`access::AccessCoordinator`])
//! - **Reservations**: guaranteed, cancellable claims on scheduler capacity
//!   ([`sched::TaskReservation`])
//! - **Dependency queues**: strict FIFO chains, one transaction at a time
//!   ([`sched::TaskQueue`])
//! - **Non-transactional variant**: the same surface for long-running work
//!   without transaction wrapping ([`sched::TaskScheduler`])
//! - **Profiling hooks**: every access and conflict is observable without
//!   being able to affect the outcome ([`profile::ProfileListener`])
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_task_kernel::builders::KernelBuilder;
//! use prometheus_task_kernel::config::KernelConfig;
//! use prometheus_task_kernel::core::{FnTask, Identity};
//!
//! let kernel = KernelBuilder::new(KernelConfig::default()).build()?;
//! let scheduler = kernel.transaction_scheduler();
//!
//! // Fire-and-forget, retried on conflict until it commits.
//! scheduler.schedule_task(
//!     Arc::new(FnTask::new("billing::Recalculate", |ctx| Ok(()))),
//!     Identity::named("billing"),
//! )?;
//!
//! // Synchronous: blocks until the task terminally succeeds or fails.
//! scheduler.run_task(
//!     Arc::new(FnTask::new("billing::Close", |ctx| Ok(()))),
//!     Identity::named("billing"),
//! )?;
//! ```
//!
//! For complete examples, see the integration tests under `tests/`.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Access coordination: conflict detection and reporter façades.
pub mod access;
/// Builders to construct kernel components from configuration.
pub mod builders;
/// Configuration models for the kernel.
pub mod config;
/// Core task, transaction, and error abstractions.
pub mod core;
/// Profiling listener extension point.
pub mod profile;
/// Runtime adapters and the executor surface.
pub mod runtime;
/// Task scheduling: schedulers, reservations, queues, recurring handles.
pub mod sched;
/// Shared utilities.
pub mod util;
