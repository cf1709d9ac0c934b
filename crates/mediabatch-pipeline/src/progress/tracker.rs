//! Per-task progress state machine.
//!
//! `Pending → Running → {Completed, Failed, Cancelled}` with a reversible
//! `Running ↔ Paused` side-transition. Terminal records are immutable. Each
//! record is guarded by its own mutex; the outer map only hands out handles,
//! so updates to different tasks never contend.
//!
//! Every accepted mutation publishes a snapshot on the task's broadcast
//! channel. Consumers that want fewer notifications wrap the receiver in
//! [`DebouncedProgress`], which filters client-side but always lets terminal
//! transitions through.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mediabatch_core::models::{ProgressRecord, TaskStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Broadcast buffer per task. Slow subscribers lag rather than block updates.
const CHANNEL_CAPACITY: usize = 64;

/// A progress mutation expressed either as an absolute step or a percentage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressUpdate {
    Step(u32),
    Percent(f32),
}

struct TaskProgressState {
    record: ProgressRecord,
    sender: broadcast::Sender<ProgressRecord>,
}

impl TaskProgressState {
    /// Send errors only mean nobody is listening right now.
    fn publish(&self) {
        let _ = self.sender.send(self.record.clone());
    }
}

/// Poisoned locks are recovered: records must stay readable after a writer
/// panic.
fn lock_state(state: &Mutex<TaskProgressState>) -> MutexGuard<'_, TaskProgressState> {
    state.lock().unwrap_or_else(|poisoned| {
        warn!("Progress state mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// In-memory registry of task progress records.
///
/// Owned by the orchestrator; everything returned to callers is a clone, so
/// records cannot be mutated from outside.
pub struct ProgressTracker {
    tasks: RwLock<HashMap<Uuid, Arc<Mutex<TaskProgressState>>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    fn state_for(&self, task_id: Uuid) -> Result<Arc<Mutex<TaskProgressState>>> {
        self.tasks
            .read()
            .unwrap_or_else(|poisoned| {
                warn!("Progress registry lock was poisoned, recovering");
                poisoned.into_inner()
            })
            .get(&task_id)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown task id: {}", task_id))
    }

    /// Register a task and mark it running.
    ///
    /// Re-registering an existing id resets the record but keeps the channel,
    /// so subscribers survive a restart of the same task.
    pub fn start(
        &self,
        task_id: Uuid,
        name: impl Into<String>,
        total_steps: u32,
        metadata: serde_json::Value,
    ) -> ProgressRecord {
        let now = Utc::now();
        let mut record = ProgressRecord::new(task_id, name, total_steps);
        record.status = TaskStatus::Running;
        record.message = "Task started".to_string();
        record.started_at = Some(now);
        record.updated_at = now;
        record.metadata = metadata;

        let mut tasks = self.tasks.write().unwrap_or_else(|poisoned| {
            warn!("Progress registry lock was poisoned, recovering");
            poisoned.into_inner()
        });
        match tasks.get(&task_id) {
            Some(existing) => {
                let mut state = lock_state(existing);
                state.record = record.clone();
                state.publish();
            }
            None => {
                let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
                let state = TaskProgressState {
                    record: record.clone(),
                    sender,
                };
                tasks.insert(task_id, Arc::new(Mutex::new(state)));
            }
        }
        record
    }

    /// Apply a progress update. Warns and leaves the record untouched unless
    /// the task is Running or Paused.
    pub fn update(
        &self,
        task_id: Uuid,
        update: ProgressUpdate,
        message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<ProgressRecord> {
        let state = self.state_for(task_id)?;
        let mut state = lock_state(&state);

        if !state.record.status.is_active() {
            warn!(
                task_id = %task_id,
                status = %state.record.status,
                "Dropping progress update for inactive task"
            );
            return Ok(state.record.clone());
        }

        match update {
            ProgressUpdate::Step(step) => {
                state.record.current_step = step;
                if state.record.total_steps > 0 {
                    state.record.progress = (step as f32 / state.record.total_steps as f32
                        * 100.0)
                        .min(100.0);
                }
            }
            ProgressUpdate::Percent(percent) => {
                let percent = percent.clamp(0.0, 100.0);
                state.record.progress = percent;
                state.record.current_step =
                    (percent / 100.0 * state.record.total_steps as f32) as u32;
            }
        }

        if let Some(message) = message {
            state.record.message = message.to_string();
        }
        if let Some(metadata) = metadata {
            merge_metadata(&mut state.record.metadata, metadata);
        }
        state.record.updated_at = Utc::now();
        state.record.estimated_completion = estimate_completion(&state.record);

        state.publish();
        Ok(state.record.clone())
    }

    /// Suspend a running task. Errors unless the task is Running.
    pub fn pause(&self, task_id: Uuid) -> Result<ProgressRecord> {
        let state = self.state_for(task_id)?;
        let mut state = lock_state(&state);

        if state.record.status != TaskStatus::Running {
            return Err(anyhow!(
                "Cannot pause task in status {}",
                state.record.status
            ));
        }
        state.record.status = TaskStatus::Paused;
        state.record.message = "Task paused".to_string();
        state.record.updated_at = Utc::now();
        state.publish();
        Ok(state.record.clone())
    }

    /// Resume a paused task. Errors unless the task is Paused.
    pub fn resume(&self, task_id: Uuid) -> Result<ProgressRecord> {
        let state = self.state_for(task_id)?;
        let mut state = lock_state(&state);

        if state.record.status != TaskStatus::Paused {
            return Err(anyhow!(
                "Cannot resume task in status {}",
                state.record.status
            ));
        }
        state.record.status = TaskStatus::Running;
        state.record.message = "Task resumed".to_string();
        state.record.updated_at = Utc::now();
        state.publish();
        Ok(state.record.clone())
    }

    /// Mark a task completed. No-op with a warning when already terminal.
    pub fn complete(&self, task_id: Uuid, message: Option<&str>) -> Result<ProgressRecord> {
        self.finish(task_id, TaskStatus::Completed, |record| {
            record.progress = 100.0;
            record.current_step = record.total_steps;
            record.message = message.unwrap_or("Task completed successfully").to_string();
        })
    }

    /// Mark a task failed. `message` is user-facing; `detail` lands in the
    /// metadata under `error_detail` for operators.
    pub fn fail(
        &self,
        task_id: Uuid,
        message: &str,
        detail: Option<&str>,
    ) -> Result<ProgressRecord> {
        self.finish(task_id, TaskStatus::Failed, |record| {
            record.message = format!("Task failed: {}", message);
            record.error = Some(message.to_string());
            if let Some(detail) = detail {
                merge_metadata(
                    &mut record.metadata,
                    serde_json::json!({ "error_detail": detail }),
                );
            }
        })
    }

    /// Mark a task cancelled.
    pub fn cancel(&self, task_id: Uuid, reason: Option<&str>) -> Result<ProgressRecord> {
        self.finish(task_id, TaskStatus::Cancelled, |record| {
            record.message = format!("Task cancelled: {}", reason.unwrap_or("User request"));
        })
    }

    fn finish(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        apply: impl FnOnce(&mut ProgressRecord),
    ) -> Result<ProgressRecord> {
        let state = self.state_for(task_id)?;
        let mut state = lock_state(&state);

        if state.record.status.is_terminal() {
            warn!(
                task_id = %task_id,
                current = %state.record.status,
                requested = %status,
                "Dropping transition for terminal task"
            );
            return Ok(state.record.clone());
        }

        let now = Utc::now();
        state.record.status = status;
        apply(&mut state.record);
        state.record.completed_at = Some(now);
        state.record.updated_at = now;
        state.record.duration_seconds = state
            .record
            .started_at
            .map(|started| (now - started).num_milliseconds() as f64 / 1000.0);

        state.publish();
        Ok(state.record.clone())
    }

    /// Append a warning. Valid in any non-terminal state.
    pub fn add_warning(&self, task_id: Uuid, message: &str) -> Result<ProgressRecord> {
        let state = self.state_for(task_id)?;
        let mut state = lock_state(&state);

        if state.record.status.is_terminal() {
            warn!(task_id = %task_id, "Dropping warning for terminal task");
            return Ok(state.record.clone());
        }
        state.record.warnings.push(message.to_string());
        state.record.updated_at = Utc::now();
        state.publish();
        Ok(state.record.clone())
    }

    /// Current record for a task, if registered.
    pub fn snapshot(&self, task_id: Uuid) -> Option<ProgressRecord> {
        let state = self.state_for(task_id).ok()?;
        let state = lock_state(&state);
        Some(state.record.clone())
    }

    /// Drop a task's record. Closes its subscription channel.
    pub fn remove(&self, task_id: Uuid) -> bool {
        self.tasks
            .write()
            .unwrap_or_else(|poisoned| {
                warn!("Progress registry lock was poisoned, recovering");
                poisoned.into_inner()
            })
            .remove(&task_id)
            .is_some()
    }

    /// Raw subscription: one snapshot per accepted mutation.
    pub fn subscribe(&self, task_id: Uuid) -> Result<broadcast::Receiver<ProgressRecord>> {
        let state = self.state_for(task_id)?;
        let state = lock_state(&state);
        Ok(state.sender.subscribe())
    }

    /// Subscription with a minimum re-notification interval.
    pub fn subscribe_debounced(
        &self,
        task_id: Uuid,
        min_interval: Duration,
    ) -> Result<DebouncedProgress> {
        Ok(DebouncedProgress {
            receiver: self.subscribe(task_id)?,
            min_interval,
            last_emit: None,
        })
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Interval-filtered progress subscription.
///
/// At most one record per `min_interval` reaches the consumer, except
/// terminal transitions, which always pass.
pub struct DebouncedProgress {
    receiver: broadcast::Receiver<ProgressRecord>,
    min_interval: Duration,
    last_emit: Option<tokio::time::Instant>,
}

impl DebouncedProgress {
    /// Next record clearing the interval filter; `None` once the task's
    /// channel closes.
    pub async fn recv(&mut self) -> Option<ProgressRecord> {
        loop {
            match self.receiver.recv().await {
                Ok(record) => {
                    let now = tokio::time::Instant::now();
                    if record.status.is_terminal() {
                        self.last_emit = Some(now);
                        return Some(record);
                    }
                    match self.last_emit {
                        Some(last) if now.duration_since(last) < self.min_interval => continue,
                        _ => {
                            self.last_emit = Some(now);
                            return Some(record);
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped = skipped, "Progress subscriber lagged, catching up");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Merge incoming metadata into the record. Object keys overwrite
/// shallowly; a non-object value replaces the whole field.
fn merge_metadata(current: &mut serde_json::Value, incoming: serde_json::Value) {
    match incoming {
        serde_json::Value::Object(entries) => {
            if let Some(map) = current.as_object_mut() {
                for (key, value) in entries {
                    map.insert(key, value);
                }
            } else {
                *current = serde_json::Value::Object(entries);
            }
        }
        other => *current = other,
    }
}

/// Linear extrapolation from elapsed time and percent done.
fn estimate_completion(record: &ProgressRecord) -> Option<DateTime<Utc>> {
    let started = record.started_at?;
    if record.progress <= 0.0 {
        return None;
    }
    let elapsed_ms = (record.updated_at - started).num_milliseconds();
    let total_ms = elapsed_ms as f64 / (record.progress as f64 / 100.0);
    Some(started + ChronoDuration::milliseconds(total_ms as i64))
}
