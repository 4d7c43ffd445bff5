//! Configuration models for the kernel.

pub mod kernel;

pub use kernel::{KernelConfig, RetryConfig};
