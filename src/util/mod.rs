//! Shared utilities.

pub mod clock;
pub mod telemetry;

pub use clock::{deadline_for, now_ms};
pub use telemetry::init_tracing;
