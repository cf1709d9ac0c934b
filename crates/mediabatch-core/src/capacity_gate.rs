//! Capacity gate trait for pipeline workers.
//!
//! Implementations check whether this instance has enough resources (CPU,
//! memory, disk) to start another processing stage. Consulted by the batch
//! orchestrator before heavy work begins.

use async_trait::async_trait;

/// Gate that determines whether this instance can start more work.
///
/// If `can_accept_task` returns false the orchestrator delays the next
/// processing-stage start; retrieval and in-flight stages are unaffected.
#[async_trait]
pub trait CapacityGate: Send + Sync {
    /// Returns true if this instance has enough resources for another task.
    async fn can_accept_task(&self) -> bool;
}
