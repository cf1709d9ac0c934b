//! Batch-level progress aggregation.
//!
//! Composes N per-item outcomes into one parent record keyed by the job id.
//! Parent percent is the share of items that reached a terminal state; the
//! parent auto-completes once every item has.

use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use super::tracker::{ProgressTracker, ProgressUpdate};

#[derive(Debug, Clone, Copy, Default)]
struct Counts {
    completed: usize,
    failed: usize,
    skipped: usize,
    finished: bool,
}

impl Counts {
    fn settled(&self) -> usize {
        self.completed + self.failed + self.skipped
    }
}

/// Aggregate counters for one batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchStatistics {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub success_rate: f64,
    pub is_complete: bool,
}

/// Parent progress record over a batch of items.
///
/// The record lives in the shared tracker under the job id, so job-level
/// subscriptions and snapshots go through the ordinary tracker API.
pub struct BatchProgress {
    tracker: Arc<ProgressTracker>,
    job_id: Uuid,
    total: usize,
    counts: Mutex<Counts>,
}

impl BatchProgress {
    pub fn new(tracker: Arc<ProgressTracker>, job_id: Uuid, total: usize) -> Self {
        tracker.start(
            job_id,
            format!("Batch processing ({} items)", total),
            total as u32,
            json!({
                "batch_type": "media",
                "total_items": total,
                "completed_items": 0,
                "failed_items": 0,
            }),
        );
        Self {
            tracker,
            job_id,
            total,
            counts: Mutex::new(Counts::default()),
        }
    }

    /// Record one successful item.
    pub fn item_completed(&self, label: Option<&str>) {
        let (counts, just_finished) = self.bump(|c| c.completed += 1);
        let message = match label {
            Some(label) => format!("Completed: {}", label),
            None => format!("Completed item {}/{}", counts.settled(), self.total),
        };
        self.publish(&counts, &message);
        if just_finished {
            self.finish(&counts);
        }
    }

    /// Record one failed item. The failure reason lands in the parent's
    /// warning list; individual failures never fail the batch on their own.
    pub fn item_failed(&self, detail: &str) {
        let (counts, just_finished) = self.bump(|c| c.failed += 1);
        if let Err(e) = self
            .tracker
            .add_warning(self.job_id, &format!("Item failed: {}", detail))
        {
            debug!(job_id = %self.job_id, error = %e, "Batch warning dropped");
        }
        let message = format!("Processing items... ({} failed)", counts.failed);
        self.publish(&counts, &message);
        if just_finished {
            self.finish(&counts);
        }
    }

    /// Record one skipped item (duplicate URL or cancelled before start).
    pub fn item_skipped(&self, detail: &str) {
        let (counts, just_finished) = self.bump(|c| c.skipped += 1);
        if let Err(e) = self
            .tracker
            .add_warning(self.job_id, &format!("Item skipped: {}", detail))
        {
            debug!(job_id = %self.job_id, error = %e, "Batch warning dropped");
        }
        let message = format!("Processing items... ({} skipped)", counts.skipped);
        self.publish(&counts, &message);
        if just_finished {
            self.finish(&counts);
        }
    }

    pub fn statistics(&self) -> BatchStatistics {
        let counts = self.lock_counts();
        BatchStatistics {
            total: self.total,
            completed: counts.completed,
            failed: counts.failed,
            skipped: counts.skipped,
            success_rate: if self.total > 0 {
                counts.completed as f64 / self.total as f64 * 100.0
            } else {
                0.0
            },
            is_complete: counts.settled() >= self.total,
        }
    }

    fn lock_counts(&self) -> std::sync::MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(|poisoned| {
            warn!("Batch counts mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Increment under the lock; the returned copy drives publishing outside
    /// it. Exactly one caller observes the crossing into `finished`.
    fn bump(&self, apply: impl FnOnce(&mut Counts)) -> (Counts, bool) {
        let mut counts = self.lock_counts();
        apply(&mut counts);
        let just_finished = counts.settled() >= self.total && !counts.finished;
        if just_finished {
            counts.finished = true;
        }
        (*counts, just_finished)
    }

    fn publish(&self, counts: &Counts, message: &str) {
        let percent = if self.total > 0 {
            counts.settled() as f32 / self.total as f32 * 100.0
        } else {
            100.0
        };
        if let Err(e) = self.tracker.update(
            self.job_id,
            ProgressUpdate::Percent(percent),
            Some(message),
            Some(json!({
                "completed_items": counts.completed,
                "failed_items": counts.failed,
                "skipped_items": counts.skipped,
            })),
        ) {
            debug!(job_id = %self.job_id, error = %e, "Batch progress update dropped");
        }
    }

    fn finish(&self, counts: &Counts) {
        let result = if counts.failed == 0 && counts.completed > 0 {
            self.tracker.complete(
                self.job_id,
                Some(&format!(
                    "Batch completed successfully: {}/{} items",
                    counts.completed, self.total
                )),
            )
        } else if counts.completed > 0 {
            let mut message = format!(
                "Batch completed with errors: {} successful, {} failed",
                counts.completed, counts.failed
            );
            if counts.skipped > 0 {
                message.push_str(&format!(", {} skipped", counts.skipped));
            }
            self.tracker.complete(self.job_id, Some(&message))
        } else {
            self.tracker.fail(self.job_id, "All batch items failed", None)
        };

        if let Err(e) = result {
            debug!(job_id = %self.job_id, error = %e, "Batch completion dropped");
        }
    }
}
