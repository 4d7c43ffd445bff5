//! Builders to construct kernel components from configuration.

pub mod kernel;

pub use kernel::{Kernel, KernelBuilder};
