//! Shared infrastructure for the batch pipeline:
//! - Telemetry initialization (tracing-subscriber)
//! - Capacity checking (disk space, memory, CPU)

pub mod capacity;
pub mod telemetry;

pub use capacity::CapacityChecker;
pub use telemetry::{init_telemetry, shutdown_telemetry};
