//! Capacity checking
//!
//! Probes host disk space, memory, and CPU against configured thresholds and
//! gates new processing work when the host is under pressure.

pub use checker::CapacityChecker;

mod checker;
