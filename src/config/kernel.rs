//! Kernel configuration structures.

use serde::{Deserialize, Serialize};

/// Retry policy applied by the transactional scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempt budget per task, including the first attempt.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on the exponential backoff, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Root kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Worker threads in the executor pool.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Depth of the executor's task channel.
    #[serde(default = "default_executor_queue_depth")]
    pub executor_queue_depth: usize,
    /// Capacity units a scheduler admits (queued + reserved + running).
    #[serde(default = "default_max_ready_tasks")]
    pub max_ready_tasks: u32,
    /// Per-owner quota; 0 means unlimited.
    #[serde(default)]
    pub max_tasks_per_owner: u32,
    /// Retry policy for transactional execution.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Grace period granted to workers at shutdown, in milliseconds.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            executor_queue_depth: default_executor_queue_depth(),
            max_ready_tasks: default_max_ready_tasks(),
            max_tasks_per_owner: 0,
            retry: RetryConfig::default(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

fn default_worker_threads() -> usize {
    num_cpus::get().max(1)
}

fn default_executor_queue_depth() -> usize {
    256
}

fn default_max_ready_tasks() -> u32 {
    128
}

fn default_max_attempts() -> u32 {
    8
}

fn default_initial_backoff_ms() -> u64 {
    5
}

fn default_max_backoff_ms() -> u64 {
    1_000
}

fn default_shutdown_grace_ms() -> u64 {
    2_000
}

impl KernelConfig {
    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// A human-readable reason when a value is out of range.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_threads == 0 {
            return Err("worker_threads must be greater than 0".into());
        }
        if self.executor_queue_depth == 0 {
            return Err("executor_queue_depth must be greater than 0".into());
        }
        if self.max_ready_tasks == 0 {
            return Err("max_ready_tasks must be greater than 0".into());
        }
        if self.executor_queue_depth < self.max_ready_tasks as usize {
            return Err("executor_queue_depth must cover max_ready_tasks".into());
        }
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be greater than 0".into());
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err("retry.max_backoff_ms must be at least initial_backoff_ms".into());
        }
        Ok(())
    }

    /// Parse kernel configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// A parse or validation failure message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build a configuration from defaults plus `KERNEL_*` environment
    /// overrides (a `.env` file is honored when present).
    ///
    /// # Errors
    ///
    /// A message naming the variable that failed to parse, or a validation
    /// failure.
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();
        let mut cfg = Self::default();
        read_env("KERNEL_WORKER_THREADS", &mut cfg.worker_threads)?;
        read_env("KERNEL_EXECUTOR_QUEUE_DEPTH", &mut cfg.executor_queue_depth)?;
        read_env("KERNEL_MAX_READY_TASKS", &mut cfg.max_ready_tasks)?;
        read_env("KERNEL_MAX_TASKS_PER_OWNER", &mut cfg.max_tasks_per_owner)?;
        read_env("KERNEL_RETRY_MAX_ATTEMPTS", &mut cfg.retry.max_attempts)?;
        read_env(
            "KERNEL_RETRY_INITIAL_BACKOFF_MS",
            &mut cfg.retry.initial_backoff_ms,
        )?;
        read_env("KERNEL_RETRY_MAX_BACKOFF_MS", &mut cfg.retry.max_backoff_ms)?;
        read_env("KERNEL_SHUTDOWN_GRACE_MS", &mut cfg.shutdown_grace_ms)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

fn read_env<T: std::str::FromStr>(name: &str, slot: &mut T) -> Result<(), String>
where
    T::Err: std::fmt::Display,
{
    if let Ok(value) = std::env::var(name) {
        *slot = value
            .parse()
            .map_err(|e| format!("{name} invalid: {e}"))?;
    }
    Ok(())
}
