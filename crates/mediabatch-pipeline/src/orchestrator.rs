//! Batch orchestration: job registration, bounded stage pools, and the
//! per-task retrieve/select/process/upload drive.
//!
//! `submit` returns as soon as the job and its tasks are registered; a
//! spawned driver walks every pending task through its stages, assembles the
//! optional archive, fires the completion hook, and derives the final job
//! status. Stage failures are caught at the stage boundary and recorded on
//! the task; sibling tasks are unaffected.

use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use validator::Validate;

use mediabatch_core::models::{
    BatchJob, JobStatus, MediaTask, ProgressRecord, QualityMode, QualityPolicy, TaskStatus,
};
use mediabatch_core::{CapacityGate, Config, JobCompletionHook, JobOutput, TaskErrorInfo};
use mediabatch_processing::{
    archive_file_name, choose_profile, optimize, parse_sizes, select, ArchiveBuilder,
    ArchiveEntry, ArchiveError, EncodeSpec, Selection, SourceVideoMeta, ThumbnailExtractor,
    TranscodePlan, WatermarkConfig,
};
use mediabatch_storage::keys::archive_object_key;
use mediabatch_storage::{StagingCategory, StagingStore, Storage};

use crate::encode::MediaEncoder;
use crate::error::StageError;
use crate::progress::{BatchProgress, DebouncedProgress, ProgressTracker, ProgressUpdate};
use crate::retrieval::{
    detect_platform, validate_source_url, MediaRetriever, RetrievalRequest, RetrievedMedia,
};
use crate::upload::{compute_retry_backoff_seconds, UploadCoordinator, UploadRequest};

/// Steps reported per task: retrieve, process, thumbnails, upload.
const TASK_TOTAL_STEPS: u32 = 4;

/// Interval between capacity gate polls while the instance is saturated.
const CAPACITY_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// One user-submitted batch of source URLs.
#[derive(Debug, Deserialize, Validate)]
pub struct BatchSubmission {
    #[validate(length(min = 1, max = 20, message = "A batch must contain 1 to 20 URLs"))]
    pub urls: Vec<String>,
    pub policy: QualityPolicy,
    #[serde(default)]
    pub archive_requested: bool,
}

struct JobState {
    job: BatchJob,
    tasks: HashMap<Uuid, MediaTask>,
    batch: Arc<BatchProgress>,
    pause_tx: watch::Sender<bool>,
    cancel: CancellationToken,
}

struct Inner {
    config: Config,
    retriever: Arc<dyn MediaRetriever>,
    encoder: Arc<dyn MediaEncoder>,
    uploader: Arc<UploadCoordinator>,
    staging: Arc<StagingStore>,
    tracker: Arc<ProgressTracker>,
    capacity_gate: Option<Arc<dyn CapacityGate>>,
    hook: Arc<dyn JobCompletionHook>,
    retrieval_pool: Arc<Semaphore>,
    processing_pool: Arc<Semaphore>,
    watermark_data: Option<Vec<u8>>,
    jobs: RwLock<HashMap<Uuid, Arc<Mutex<JobState>>>>,
}

/// Staged outputs of one completed task, kept for archive assembly.
struct TaskSuccess {
    index: usize,
    title: String,
    source_url: String,
    duration_seconds: Option<f64>,
    container: String,
    staged_main: PathBuf,
    staged_thumbnails: Vec<(String, PathBuf)>,
    output: JobOutput,
}

enum TaskVerdict {
    Completed(Box<TaskSuccess>),
    Failed { message: String },
    Cancelled,
}

/// Why a task stopped short of completion.
enum TaskStop {
    Cancelled,
    Stage(StageError),
}

impl From<StageError> for TaskStop {
    fn from(e: StageError) -> Self {
        TaskStop::Stage(e)
    }
}

impl From<mediabatch_storage::StorageError> for TaskStop {
    fn from(e: mediabatch_storage::StorageError) -> Self {
        TaskStop::Stage(StageError::Storage(e))
    }
}

enum SettledItem {
    Completed { title: String },
    Failed { message: String },
    Skipped { detail: String },
}

fn record_item(batch: &BatchProgress, item: SettledItem) {
    match item {
        SettledItem::Completed { title } => batch.item_completed(Some(&title)),
        SettledItem::Failed { message } => batch.item_failed(&message),
        SettledItem::Skipped { detail } => batch.item_skipped(&detail),
    }
}

pub struct BatchOrchestrator {
    inner: Arc<Inner>,
}

impl BatchOrchestrator {
    /// Wire the orchestrator from its collaborators.
    ///
    /// The watermark file, when configured, is read once here; an unreadable
    /// file disables branding instead of failing construction.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        config: Config,
        retriever: Arc<dyn MediaRetriever>,
        encoder: Arc<dyn MediaEncoder>,
        storage_chain: Vec<Arc<dyn Storage>>,
        staging: Arc<StagingStore>,
        tracker: Arc<ProgressTracker>,
        capacity_gate: Option<Arc<dyn CapacityGate>>,
        hook: Arc<dyn JobCompletionHook>,
    ) -> Self {
        let watermark_data = match config.watermark_path() {
            Some(path) => match tokio::fs::read(path).await {
                Ok(data) => Some(data),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Watermark file unreadable, thumbnails will not be branded"
                    );
                    None
                }
            },
            None => None,
        };

        let uploader = Arc::new(UploadCoordinator::new(
            storage_chain,
            config.max_retries(),
            config.upload_concurrency(),
        ));

        tracing::info!(
            retrieval_concurrency = config.retrieval_concurrency(),
            processing_concurrency = config.processing_concurrency(),
            backends = uploader.backend_count(),
            capacity_gate = capacity_gate.is_some(),
            "Batch orchestrator started"
        );

        Self {
            inner: Arc::new(Inner {
                retrieval_pool: Arc::new(Semaphore::new(config.retrieval_concurrency())),
                processing_pool: Arc::new(Semaphore::new(config.processing_concurrency())),
                config,
                retriever,
                encoder,
                uploader,
                staging,
                tracker,
                capacity_gate,
                hook,
                watermark_data,
                jobs: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Register a batch and start driving it.
    ///
    /// Returns as soon as the job and its tasks exist. Malformed URLs become
    /// immediately failed tasks; a URL repeated within the batch becomes a
    /// skipped task. Neither prevents the rest of the batch from running.
    #[tracing::instrument(skip(self, submission))]
    pub async fn submit(&self, submission: BatchSubmission) -> Result<Uuid> {
        submission.validate().map_err(|e| {
            tracing::warn!(error = %e, "Rejected batch submission");
            anyhow::anyhow!("Invalid batch submission: {}", e)
        })?;

        let BatchSubmission {
            urls,
            policy,
            archive_requested,
        } = submission;

        let mut job = BatchJob::new(policy, archive_requested);
        job.status = JobStatus::Running;

        let mut tasks = HashMap::new();
        let mut invalid: Vec<(Uuid, String, TaskErrorInfo)> = Vec::new();
        let mut duplicates: Vec<(Uuid, String)> = Vec::new();
        let mut seen = HashSet::new();

        for url in &urls {
            let mut task = MediaTask::new(job.id, url.clone(), policy.mode);
            task.max_retries = self.inner.config.max_retries();

            if let Err(reason) = validate_source_url(url) {
                let info = StageError::InvalidUrl(reason).to_error_info();
                task.status = TaskStatus::Failed;
                task.error_info = Some(info.clone());
                task.completed_at = Some(Utc::now());
                job.record_task_outcome(TaskStatus::Failed);
                invalid.push((task.id, url.clone(), info));
            } else if !seen.insert(url.clone()) {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(Utc::now());
                job.record_task_outcome(TaskStatus::Cancelled);
                duplicates.push((task.id, url.clone()));
            }

            job.task_ids.push(task.id);
            tasks.insert(task.id, task);
        }
        job.total_count = job.task_ids.len();

        let job_id = job.id;
        let batch = Arc::new(BatchProgress::new(
            self.inner.tracker.clone(),
            job_id,
            job.total_count,
        ));

        for (task_id, url, info) in &invalid {
            self.inner.tracker.start(
                *task_id,
                url.clone(),
                TASK_TOTAL_STEPS,
                json!({ "source_url": url, "job_id": job_id }),
            );
            let _ = self
                .inner
                .tracker
                .fail(*task_id, &info.message, info.detail.as_deref());
            batch.item_failed(&info.message);
        }
        for (task_id, url) in &duplicates {
            self.inner.tracker.start(
                *task_id,
                url.clone(),
                TASK_TOTAL_STEPS,
                json!({ "source_url": url, "job_id": job_id }),
            );
            let _ = self
                .inner
                .tracker
                .cancel(*task_id, Some("Duplicate URL in this batch"));
            batch.item_skipped(&format!("Duplicate URL: {}", url));
        }

        let (pause_tx, _) = watch::channel(false);
        let state = JobState {
            job,
            tasks,
            batch,
            pause_tx,
            cancel: CancellationToken::new(),
        };
        self.inner
            .jobs
            .write()
            .await
            .insert(job_id, Arc::new(Mutex::new(state)));

        let inner = self.inner.clone();
        tokio::spawn(async move {
            drive_job(inner, job_id).await;
        });

        tracing::info!(
            job_id = %job_id,
            url_count = urls.len(),
            invalid = invalid.len(),
            duplicates = duplicates.len(),
            archive_requested = archive_requested,
            "Batch submitted"
        );

        Ok(job_id)
    }

    pub async fn get_status(&self, job_id: Uuid) -> Option<BatchJob> {
        let state_arc = self.job_state(job_id).await?;
        let state = state_arc.lock().await;
        Some(state.job.clone())
    }

    /// Tasks of a job in submission order.
    pub async fn get_tasks(&self, job_id: Uuid) -> Option<Vec<MediaTask>> {
        let state_arc = self.job_state(job_id).await?;
        let state = state_arc.lock().await;
        Some(
            state
                .job
                .task_ids
                .iter()
                .filter_map(|id| state.tasks.get(id).cloned())
                .collect(),
        )
    }

    /// Aggregated job-level progress record.
    pub fn get_progress(&self, job_id: Uuid) -> Option<ProgressRecord> {
        self.inner.tracker.snapshot(job_id)
    }

    /// Suspend stage starts for every task of the job. In-flight stages run
    /// to completion. Returns false unless the job was Running.
    pub async fn pause(&self, job_id: Uuid) -> bool {
        let state_arc = match self.job_state(job_id).await {
            Some(state) => state,
            None => return false,
        };
        let mut state = state_arc.lock().await;
        if state.job.status != JobStatus::Running {
            return false;
        }
        state.job.status = JobStatus::Paused;
        let _ = state.pause_tx.send(true);
        let _ = self.inner.tracker.pause(job_id);
        tracing::info!(job_id = %job_id, "Batch paused");
        true
    }

    /// Resume a paused job. Returns false unless the job was Paused.
    pub async fn resume(&self, job_id: Uuid) -> bool {
        let state_arc = match self.job_state(job_id).await {
            Some(state) => state,
            None => return false,
        };
        let mut state = state_arc.lock().await;
        if state.job.status != JobStatus::Paused {
            return false;
        }
        state.job.status = JobStatus::Running;
        let _ = state.pause_tx.send(false);
        let _ = self.inner.tracker.resume(job_id);
        tracing::info!(job_id = %job_id, "Batch resumed");
        true
    }

    /// Request cancellation. Running stages finish; every task transitions
    /// to Cancelled at its next stage boundary. Returns whether the job was
    /// still cancellable.
    pub async fn cancel(&self, job_id: Uuid) -> bool {
        let state_arc = match self.job_state(job_id).await {
            Some(state) => state,
            None => return false,
        };
        let state = state_arc.lock().await;
        if state.job.status.is_terminal() {
            return false;
        }
        state.cancel.cancel();
        let _ = self.inner.tracker.cancel(job_id, Some("Cancelled by user"));
        tracing::info!(job_id = %job_id, "Batch cancelled");
        true
    }

    /// Evict a finished job and its progress records. Refuses jobs that are
    /// still running.
    pub async fn remove_job(&self, job_id: Uuid) -> bool {
        let state_arc = match self.job_state(job_id).await {
            Some(state) => state,
            None => return false,
        };
        {
            let state = state_arc.lock().await;
            if !state.job.status.is_terminal() {
                return false;
            }
            for task_id in &state.job.task_ids {
                self.inner.tracker.remove(*task_id);
            }
        }
        self.inner.tracker.remove(job_id);
        self.inner.jobs.write().await.remove(&job_id);
        true
    }

    async fn job_state(&self, job_id: Uuid) -> Option<Arc<Mutex<JobState>>> {
        self.inner.jobs.read().await.get(&job_id).cloned()
    }
}

/// Submission facade bundling the orchestrator with its progress tracker.
pub struct PipelineHandle {
    orchestrator: Arc<BatchOrchestrator>,
    tracker: Arc<ProgressTracker>,
}

impl PipelineHandle {
    pub fn new(orchestrator: Arc<BatchOrchestrator>, tracker: Arc<ProgressTracker>) -> Self {
        Self {
            orchestrator,
            tracker,
        }
    }

    pub async fn submit_batch(
        &self,
        urls: Vec<String>,
        policy: QualityPolicy,
        archive_requested: bool,
    ) -> Result<Uuid> {
        self.orchestrator
            .submit(BatchSubmission {
                urls,
                policy,
                archive_requested,
            })
            .await
    }

    pub async fn get_status(&self, job_id: Uuid) -> Option<BatchJob> {
        self.orchestrator.get_status(job_id).await
    }

    pub fn get_progress(&self, job_id: Uuid) -> Option<ProgressRecord> {
        self.orchestrator.get_progress(job_id)
    }

    pub async fn pause_batch(&self, job_id: Uuid) -> bool {
        self.orchestrator.pause(job_id).await
    }

    pub async fn resume_batch(&self, job_id: Uuid) -> bool {
        self.orchestrator.resume(job_id).await
    }

    pub async fn cancel_batch(&self, job_id: Uuid) -> bool {
        self.orchestrator.cancel(job_id).await
    }

    /// Subscribe to job progress, throttled to the configured debounce
    /// interval. Terminal notifications are never withheld.
    pub fn subscribe(&self, job_id: Uuid) -> Result<DebouncedProgress> {
        let interval =
            Duration::from_millis(self.orchestrator.config().progress_debounce_ms());
        self.tracker.subscribe_debounced(job_id, interval)
    }
}

async fn drive_job(inner: Arc<Inner>, job_id: Uuid) {
    let state_arc = match inner.jobs.read().await.get(&job_id).cloned() {
        Some(state) => state,
        None => return,
    };

    let (pending, policy, archive_requested, batch, pause_rx, cancel) = {
        let state = state_arc.lock().await;
        let pending: Vec<(usize, Uuid, String)> = state
            .job
            .task_ids
            .iter()
            .enumerate()
            .filter_map(|(index, id)| {
                state
                    .tasks
                    .get(id)
                    .filter(|t| t.status == TaskStatus::Pending)
                    .map(|t| (index, *id, t.source_url.clone()))
            })
            .collect();
        (
            pending,
            state.job.policy,
            state.job.archive_requested,
            state.batch.clone(),
            state.pause_tx.subscribe(),
            state.cancel.clone(),
        )
    };

    let mut join_set = JoinSet::new();
    for (index, task_id, url) in pending {
        let inner = inner.clone();
        let pause_rx = pause_rx.clone();
        let cancel = cancel.clone();
        join_set.spawn(async move {
            let verdict = run_task(
                inner,
                job_id,
                task_id,
                index,
                url,
                policy,
                archive_requested,
                pause_rx,
                cancel,
            )
            .await;
            (task_id, verdict)
        });
    }

    let mut successes: Vec<TaskSuccess> = Vec::new();
    // The newest settlement is buffered one slot: archive warnings must
    // attach before the batch record completes.
    let mut deferred: Option<SettledItem> = None;

    while let Some(joined) = join_set.join_next().await {
        let (task_id, verdict) = match joined {
            Ok(settled) => settled,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Task driver panicked");
                continue;
            }
        };

        let item = {
            let mut state = state_arc.lock().await;
            match verdict {
                TaskVerdict::Completed(success) => {
                    state.job.record_task_outcome(TaskStatus::Completed);
                    let item = SettledItem::Completed {
                        title: success.title.clone(),
                    };
                    successes.push(*success);
                    item
                }
                TaskVerdict::Failed { message } => {
                    state.job.record_task_outcome(TaskStatus::Failed);
                    SettledItem::Failed { message }
                }
                TaskVerdict::Cancelled => {
                    state.job.record_task_outcome(TaskStatus::Cancelled);
                    SettledItem::Skipped {
                        detail: "Cancelled before completion".to_string(),
                    }
                }
            }
        };
        tracing::debug!(job_id = %job_id, task_id = %task_id, "Task settled");

        if let Some(previous) = deferred.replace(item) {
            record_item(&batch, previous);
        }
    }

    successes.sort_by_key(|s| s.index);

    let archive_key = if archive_requested && !successes.is_empty() && !cancel.is_cancelled() {
        build_and_upload_archive(&inner, job_id, &successes).await
    } else {
        None
    };

    if let Some(last) = deferred.take() {
        record_item(&batch, last);
    }

    if archive_requested {
        for success in &successes {
            if let Err(e) = tokio::fs::remove_file(&success.staged_main).await {
                tracing::debug!(
                    path = %success.staged_main.display(),
                    error = %e,
                    "Staged file already removed"
                );
            }
            for (_, path) in &success.staged_thumbnails {
                let _ = tokio::fs::remove_file(path).await;
            }
        }
    }

    let outputs: Vec<JobOutput> = successes.iter().map(|s| s.output.clone()).collect();
    {
        let mut state = state_arc.lock().await;
        state.job.archive_key = archive_key.clone();
        state.job.status = state.job.derive_terminal_status(cancel.is_cancelled());
        tracing::info!(
            job_id = %job_id,
            status = %state.job.status,
            completed = state.job.completed_count,
            failed = state.job.failed_count,
            skipped = state.job.skipped_count,
            "Batch job finished"
        );
    }

    inner
        .hook
        .on_job_complete(job_id, &outputs, archive_key.as_deref())
        .await;
}

async fn build_and_upload_archive(
    inner: &Inner,
    job_id: Uuid,
    successes: &[TaskSuccess],
) -> Option<String> {
    let entries: Vec<ArchiveEntry> = successes
        .iter()
        .map(|s| ArchiveEntry {
            path: s.staged_main.clone(),
            archive_name: archive_file_name(
                s.index,
                Some(&s.title),
                &s.container,
                &format!("media_{}", s.index + 1),
            ),
            original_url: s.source_url.clone(),
            duration_seconds: s.duration_seconds,
            thumbnails: s.staged_thumbnails.clone(),
        })
        .collect();

    let builder = ArchiveBuilder::new(
        inner.config.max_archive_size_mb() * 1024 * 1024,
        inner.config.archive_compression_level() as i32,
    );
    let out_dir = inner.staging.category_dir(StagingCategory::Archives);
    let built = match builder.build(job_id, &entries, &out_dir).await {
        Ok(built) => built,
        Err(ArchiveError::SizeExceeded {
            total_bytes,
            max_bytes,
        }) => {
            tracing::warn!(
                job_id = %job_id,
                total_bytes = total_bytes,
                max_bytes = max_bytes,
                "Archive skipped, delivering files individually"
            );
            let _ = inner.tracker.add_warning(
                job_id,
                &format!(
                    "Archive skipped: {} bytes exceeds the {} byte limit, files were delivered individually",
                    total_bytes, max_bytes
                ),
            );
            return None;
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Archive assembly failed");
            let _ = inner
                .tracker
                .add_warning(job_id, &format!("Archive assembly failed: {}", e));
            return None;
        }
    };

    let key = archive_object_key(job_id, Utc::now());
    match inner.uploader.upload_archive(&built.path, &key).await {
        Ok((info, warnings)) => {
            for warning in &warnings {
                let _ = inner.tracker.add_warning(job_id, warning);
            }
            tracing::info!(
                job_id = %job_id,
                key = %info.key,
                size_bytes = info.size_bytes,
                files = built.files_count,
                "Batch archive uploaded"
            );
            if let Err(e) = tokio::fs::remove_file(&built.path).await {
                tracing::warn!(
                    path = %built.path.display(),
                    error = %e,
                    "Failed to remove staged archive"
                );
            }
            Some(info.key)
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Archive upload failed");
            let _ = inner
                .tracker
                .add_warning(job_id, &format!("Archive upload failed: {}", e));
            let _ = tokio::fs::remove_file(&built.path).await;
            None
        }
    }
}

#[allow(clippy::too_many_arguments)]
#[tracing::instrument(skip(inner, url, policy, retain_staged, pause_rx, cancel), fields(job_id = %job_id, task_id = %task_id))]
async fn run_task(
    inner: Arc<Inner>,
    job_id: Uuid,
    task_id: Uuid,
    index: usize,
    url: String,
    policy: QualityPolicy,
    retain_staged: bool,
    mut pause_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
) -> TaskVerdict {
    let outcome = execute_task(
        &inner,
        job_id,
        task_id,
        index,
        url,
        &policy,
        retain_staged,
        &mut pause_rx,
        &cancel,
    )
    .await;

    match outcome {
        Ok(success) => {
            set_task(&inner, job_id, task_id, |task| {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(Utc::now());
                task.set_progress(100.0);
            })
            .await;
            let _ = inner
                .tracker
                .complete(task_id, Some("Media processed and uploaded"));
            TaskVerdict::Completed(Box::new(success))
        }
        Err(TaskStop::Cancelled) => {
            set_task(&inner, job_id, task_id, |task| {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(Utc::now());
            })
            .await;
            let _ = inner.tracker.cancel(task_id, Some("Batch cancelled"));
            TaskVerdict::Cancelled
        }
        Err(TaskStop::Stage(e)) => {
            let info = e.to_error_info();
            tracing::error!(task_id = %task_id, error = %e, kind = %info.kind, "Task stage failed");
            set_task(&inner, job_id, task_id, |task| {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(Utc::now());
                task.error_info = Some(info.clone());
            })
            .await;
            let _ = inner
                .tracker
                .fail(task_id, &info.message, info.detail.as_deref());
            TaskVerdict::Failed {
                message: info.message,
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute_task(
    inner: &Inner,
    job_id: Uuid,
    task_id: Uuid,
    index: usize,
    url: String,
    policy: &QualityPolicy,
    retain_staged: bool,
    pause_rx: &mut watch::Receiver<bool>,
    cancel: &CancellationToken,
) -> Result<TaskSuccess, TaskStop> {
    inner.tracker.start(
        task_id,
        url.clone(),
        TASK_TOTAL_STEPS,
        json!({ "source_url": url, "job_id": job_id }),
    );
    set_task(inner, job_id, task_id, |task| {
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        task.platform = detect_platform(&task.source_url);
    })
    .await;

    // Retrieval stage.
    stage_gate(inner, task_id, pause_rx, cancel).await?;
    let retrieval_permit = acquire_stage_permit(&inner.retrieval_pool, cancel).await?;
    let _ = inner.tracker.update(
        task_id,
        ProgressUpdate::Step(1),
        Some("Retrieving source media"),
        None,
    );

    let quality_hint = match policy.mode {
        QualityMode::Explicit(level) => Some(level),
        _ => None,
    };
    let request = RetrievalRequest {
        url: url.clone(),
        quality_hint,
        dest_dir: inner
            .staging
            .category_dir(StagingCategory::Downloads)
            .join(task_id.to_string()),
    };
    let media = retrieve_with_retries(inner, job_id, task_id, &request, cancel).await?;
    set_task(inner, job_id, task_id, |task| {
        task.staged_file_path = Some(media.local_path.clone());
        task.size_bytes = Some(media.size_bytes);
    })
    .await;

    let selected = match select(&media.candidates, policy) {
        Selection::Selected(candidate) => candidate,
        Selection::NoCandidate => return Err(StageError::NoCandidate.into()),
    };
    set_task(inner, job_id, task_id, |task| {
        task.selected_rendition = Some(selected.clone());
    })
    .await;
    drop(retrieval_permit);

    // Processing stage: transcode plan plus thumbnails under one permit.
    stage_gate(inner, task_id, pause_rx, cancel).await?;
    wait_for_capacity(inner, task_id, cancel).await?;
    let processing_permit = acquire_stage_permit(&inner.processing_pool, cancel).await?;
    let _ = inner.tracker.update(
        task_id,
        ProgressUpdate::Step(2),
        Some("Planning processing"),
        None,
    );

    let source = SourceVideoMeta {
        duration_secs: media.duration_seconds.unwrap_or(0.0),
        width: selected.width.unwrap_or(0),
        height: selected.height.unwrap_or(0),
        video_codec: selected.video_codec.clone().unwrap_or_default(),
        bitrate_kbps: selected.bitrate_kbps.map(|b| b as u32),
        fps: selected.fps,
        size_bytes: media.size_bytes,
    };
    let profile = choose_profile(&source, policy);
    let ceiling = policy.tier.max_size_mb() * 1024 * 1024;
    let plan = optimize(&source, profile, Some(ceiling));

    let (final_path, container) = match plan {
        TranscodePlan::Passthrough => {
            tracing::debug!(task_id = %task_id, "Source fits profile, skipping encode");
            (media.local_path.clone(), selected.container.clone())
        }
        TranscodePlan::Encode(spec) => {
            let _ = inner.tracker.update(
                task_id,
                ProgressUpdate::Step(2),
                Some(&format!("Transcoding to {}", spec.profile_name)),
                None,
            );
            let output =
                encode_to_temp(inner, task_id, &spec, &media.local_path, media.size_bytes)
                    .await?;
            (output, "mp4".to_string())
        }
    };
    set_task(inner, job_id, task_id, |task| {
        task.staged_file_path = Some(final_path.clone());
    })
    .await;

    let _ = inner.tracker.update(
        task_id,
        ProgressUpdate::Step(3),
        Some("Generating thumbnails"),
        None,
    );
    let thumbnails =
        generate_thumbnails(inner, task_id, &final_path, media.duration_seconds).await;
    drop(processing_permit);

    // Upload stage.
    stage_gate(inner, task_id, pause_rx, cancel).await?;
    let _ = inner.tracker.update(
        task_id,
        ProgressUpdate::Step(4),
        Some("Uploading to storage"),
        None,
    );

    let upload_request = UploadRequest {
        task_id,
        tier: policy.tier,
        main_file: final_path.clone(),
        filename: format!("{}.{}", media.title, container),
        thumbnails: thumbnails.clone(),
        retain_staged,
    };
    let timeout_secs = inner.config.stage_timeout_secs();
    let outcome = match timeout(
        Duration::from_secs(timeout_secs),
        inner.uploader.upload_task_files(&upload_request),
    )
    .await
    {
        Err(_) => return Err(StageError::StageTimeout(timeout_secs).into()),
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(outcome)) => outcome,
    };
    for warning in &outcome.warnings {
        let _ = inner.tracker.add_warning(task_id, warning);
    }
    set_task(inner, job_id, task_id, |task| {
        task.remote_object_key = Some(outcome.object.key.clone());
        task.remote_url = outcome.remote_url.clone();
        task.thumbnail_key = outcome.thumbnail_keys.first().cloned();
        task.size_bytes = Some(outcome.object.size_bytes);
    })
    .await;

    Ok(TaskSuccess {
        index,
        title: media.title.clone(),
        source_url: url,
        duration_seconds: media.duration_seconds,
        container,
        staged_main: final_path,
        staged_thumbnails: thumbnails,
        output: JobOutput {
            task_id,
            object_key: outcome.object.key.clone(),
            size_bytes: outcome.object.size_bytes,
            public_url: outcome.remote_url.clone(),
            thumbnail_key: outcome.thumbnail_keys.first().cloned(),
        },
    })
}

/// Bounded-retry retrieval. Only retryable source errors are retried; each
/// attempt runs under the stage timeout.
async fn retrieve_with_retries(
    inner: &Inner,
    job_id: Uuid,
    task_id: Uuid,
    request: &RetrievalRequest,
    cancel: &CancellationToken,
) -> Result<RetrievedMedia, TaskStop> {
    let max_retries = inner.config.max_retries();
    let timeout_secs = inner.config.stage_timeout_secs();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match timeout(
            Duration::from_secs(timeout_secs),
            inner.retriever.retrieve(request),
        )
        .await
        {
            Err(_) => return Err(StageError::StageTimeout(timeout_secs).into()),
            Ok(Ok(media)) => return Ok(media),
            Ok(Err(e)) if e.is_retryable() && attempt <= max_retries => {
                let backoff = compute_retry_backoff_seconds(attempt);
                tracing::warn!(
                    task_id = %task_id,
                    attempt = attempt,
                    backoff_seconds = backoff,
                    error = %e,
                    "Retrieval failed, retrying"
                );
                let _ = inner.tracker.add_warning(
                    task_id,
                    &format!("Retrieval attempt {} failed: {}", attempt, e),
                );
                set_task(inner, job_id, task_id, |task| task.retry_count += 1).await;
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TaskStop::Cancelled),
                    _ = sleep(Duration::from_secs(backoff)) => {}
                }
            }
            Ok(Err(e)) => return Err(StageError::Retrieval(e).into()),
        }
    }
}

async fn encode_to_temp(
    inner: &Inner,
    task_id: Uuid,
    spec: &EncodeSpec,
    input: &Path,
    input_size: u64,
) -> Result<PathBuf, TaskStop> {
    // The reservation books the input size as an upper bound for the output.
    let reservation = inner
        .staging
        .reserve(StagingCategory::Temp, input_size)
        .await?;
    let output = inner
        .staging
        .category_dir(StagingCategory::Temp)
        .join(format!("{}.mp4", task_id));
    let timeout_secs = inner.config.stage_timeout_secs();

    match timeout(
        Duration::from_secs(timeout_secs),
        inner.encoder.encode(spec, input, &output),
    )
    .await
    {
        Err(_) => {
            let _ = tokio::fs::remove_file(&output).await;
            Err(StageError::StageTimeout(timeout_secs).into())
        }
        Ok(Err(e)) => {
            let _ = tokio::fs::remove_file(&output).await;
            Err(StageError::Processing(e.to_string()).into())
        }
        Ok(Ok(())) => {
            reservation.commit();
            if let Err(e) = tokio::fs::remove_file(input).await {
                tracing::warn!(
                    path = %input.display(),
                    error = %e,
                    "Failed to remove staged source after transcode"
                );
            }
            Ok(output)
        }
    }
}

/// Thumbnail extraction never fails the task; every problem becomes a task
/// warning.
async fn generate_thumbnails(
    inner: &Inner,
    task_id: Uuid,
    video: &Path,
    duration_seconds: Option<f64>,
) -> Vec<(String, PathBuf)> {
    let sizes = parse_sizes(inner.config.thumbnail_sizes());
    if sizes.is_empty() {
        return Vec::new();
    }

    let extractor = match ThumbnailExtractor::new(
        inner.config.ffmpeg_path().to_string(),
        inner.config.thumbnail_jpeg_quality(),
    ) {
        Ok(extractor) => extractor,
        Err(e) => {
            let _ = inner
                .tracker
                .add_warning(task_id, &format!("Thumbnail extraction unavailable: {}", e));
            return Vec::new();
        }
    };
    let extractor = match &inner.watermark_data {
        Some(data) => extractor.with_watermark(data.clone(), WatermarkConfig::default()),
        None => extractor,
    };

    let out_dir = inner
        .staging
        .category_dir(StagingCategory::Thumbnails)
        .join(task_id.to_string());
    match extractor
        .extract(video, duration_seconds, &sizes, &out_dir)
        .await
    {
        Ok(set) => {
            for failure in &set.failures {
                let _ = inner.tracker.add_warning(
                    task_id,
                    &format!("Thumbnail {} failed: {}", failure.size, failure.message),
                );
            }
            set.generated
                .into_iter()
                .map(|g| (g.size.to_string(), g.path))
                .collect()
        }
        Err(e) => {
            let _ = inner
                .tracker
                .add_warning(task_id, &format!("Thumbnail extraction failed: {}", e));
            Vec::new()
        }
    }
}

/// Park while the batch is paused. In-flight stages are unaffected; this
/// runs only between stages.
async fn stage_gate(
    inner: &Inner,
    task_id: Uuid,
    pause_rx: &mut watch::Receiver<bool>,
    cancel: &CancellationToken,
) -> Result<(), TaskStop> {
    if cancel.is_cancelled() {
        return Err(TaskStop::Cancelled);
    }
    if !*pause_rx.borrow() {
        return Ok(());
    }

    let _ = inner.tracker.pause(task_id);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(TaskStop::Cancelled),
            changed = pause_rx.changed() => {
                if changed.is_err() {
                    return Err(TaskStop::Cancelled);
                }
                if !*pause_rx.borrow() {
                    break;
                }
            }
        }
    }
    let _ = inner.tracker.resume(task_id);
    Ok(())
}

async fn wait_for_capacity(
    inner: &Inner,
    task_id: Uuid,
    cancel: &CancellationToken,
) -> Result<(), TaskStop> {
    if let Some(gate) = &inner.capacity_gate {
        while !gate.can_accept_task().await {
            tracing::debug!(task_id = %task_id, "Capacity gate closed, delaying processing stage");
            tokio::select! {
                _ = cancel.cancelled() => return Err(TaskStop::Cancelled),
                _ = sleep(CAPACITY_POLL_INTERVAL) => {}
            }
        }
    }
    Ok(())
}

async fn acquire_stage_permit(
    pool: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<OwnedSemaphorePermit, TaskStop> {
    tokio::select! {
        _ = cancel.cancelled() => Err(TaskStop::Cancelled),
        // Acquire fails only when the pool is closed at shutdown.
        permit = pool.clone().acquire_owned() => permit.map_err(|_| TaskStop::Cancelled),
    }
}

async fn set_task<F>(inner: &Inner, job_id: Uuid, task_id: Uuid, apply: F)
where
    F: FnOnce(&mut MediaTask),
{
    let state_arc = { inner.jobs.read().await.get(&job_id).cloned() };
    if let Some(state_arc) = state_arc {
        let mut state = state_arc.lock().await;
        if let Some(task) = state.tasks.get_mut(&task_id) {
            apply(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::{
        candidate, passthrough_candidates, test_config, MemoryStorage, MockEncoder,
        MockRetriever, RecordingHook, ScriptStep,
    };
    use async_trait::async_trait;
    use mediabatch_core::error::{ErrorKind, RetrievalKind};
    use mediabatch_core::models::{RenditionCandidate, UserTier};
    use mediabatch_core::StorageBackendKind;
    use mediabatch_storage::StagingConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct Harness {
        orchestrator: Arc<BatchOrchestrator>,
        tracker: Arc<ProgressTracker>,
        retriever: Arc<MockRetriever>,
        encoder: Arc<MockEncoder>,
        primary: Arc<MemoryStorage>,
        hook: Arc<RecordingHook>,
        _staging_dir: TempDir,
    }

    async fn harness() -> Harness {
        harness_with(passthrough_candidates(), |_| {}, None).await
    }

    async fn harness_with(
        candidates: Vec<RenditionCandidate>,
        tweak: impl FnOnce(&mut Config),
        capacity_gate: Option<Arc<dyn CapacityGate>>,
    ) -> Harness {
        let staging_dir = TempDir::new().unwrap();
        let mut config = test_config(staging_dir.path());
        tweak(&mut config);

        let staging = Arc::new(
            StagingStore::new(StagingConfig::from_config(&config))
                .await
                .unwrap(),
        );
        let tracker = Arc::new(ProgressTracker::new());
        let retriever = Arc::new(MockRetriever::new(candidates));
        let encoder = Arc::new(MockEncoder::new());
        let primary = Arc::new(MemoryStorage::new(StorageBackendKind::Wasabi));
        let hook = Arc::new(RecordingHook::new());

        let orchestrator = Arc::new(
            BatchOrchestrator::new(
                config,
                retriever.clone(),
                encoder.clone(),
                vec![primary.clone() as Arc<dyn Storage>],
                staging,
                tracker.clone(),
                capacity_gate,
                hook.clone(),
            )
            .await,
        );

        Harness {
            orchestrator,
            tracker,
            retriever,
            encoder,
            primary,
            hook,
            _staging_dir: staging_dir,
        }
    }

    fn submission(urls: &[&str], archive_requested: bool) -> BatchSubmission {
        submission_for(urls, UserTier::Premium, QualityMode::Auto, archive_requested)
    }

    fn submission_for(
        urls: &[&str],
        tier: UserTier,
        mode: QualityMode,
        archive_requested: bool,
    ) -> BatchSubmission {
        BatchSubmission {
            urls: urls.iter().map(|u| u.to_string()).collect(),
            policy: QualityPolicy::new(tier, mode),
            archive_requested,
        }
    }

    async fn wait_terminal(orchestrator: &BatchOrchestrator, job_id: Uuid) -> BatchJob {
        // Under start_paused clocks each 25ms tick is also the virtual-time
        // step, so the bound must cover the 3600s stage timeout scenarios.
        for _ in 0..200_000 {
            if let Some(job) = orchestrator.get_status(job_id).await {
                if job.status.is_terminal() {
                    return job;
                }
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!("job did not reach a terminal status");
    }

    #[tokio::test]
    async fn batch_of_valid_urls_completes() {
        let h = harness().await;
        let job_id = h
            .orchestrator
            .submit(submission(
                &[
                    "https://youtube.com/watch?v=a",
                    "https://youtube.com/watch?v=b",
                    "https://tiktok.com/@user/video/1",
                ],
                false,
            ))
            .await
            .unwrap();

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_count, 3);
        assert_eq!(job.failed_count, 0);
        assert!(job.archive_key.is_none());
        assert_eq!(h.primary.object_count(), 3);

        let record = h.orchestrator.get_progress(job_id).unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.progress, 100.0);

        let tasks = h.orchestrator.get_tasks(job_id).await.unwrap();
        assert_eq!(tasks[0].platform.as_deref(), Some("youtube"));
        assert_eq!(tasks[2].platform.as_deref(), Some("tiktok"));
        assert!(tasks.iter().all(|t| t.remote_object_key.is_some()));
        assert!(tasks.iter().all(|t| t.remote_url.is_some()));
    }

    #[tokio::test]
    async fn malformed_url_fails_only_its_task() {
        let h = harness().await;
        let job_id = h
            .orchestrator
            .submit(submission(
                &[
                    "https://youtube.com/watch?v=a",
                    "not a url",
                    "https://youtube.com/watch?v=b",
                ],
                false,
            ))
            .await
            .unwrap();

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::CompletedWithErrors);
        assert_eq!(job.completed_count, 2);
        assert_eq!(job.failed_count, 1);

        let tasks = h.orchestrator.get_tasks(job_id).await.unwrap();
        let failed = tasks
            .iter()
            .find(|t| t.status == TaskStatus::Failed)
            .unwrap();
        assert_eq!(failed.source_url, "not a url");
        let info = failed.error_info.as_ref().unwrap();
        assert_eq!(info.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn duplicate_url_is_skipped() {
        let h = harness().await;
        let url = "https://youtube.com/watch?v=a";
        let job_id = h
            .orchestrator
            .submit(submission(&[url, url], false))
            .await
            .unwrap();

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::CompletedWithErrors);
        assert_eq!(job.completed_count, 1);
        assert_eq!(job.skipped_count, 1);

        let record = h.orchestrator.get_progress(job_id).unwrap();
        assert!(record
            .warnings
            .iter()
            .any(|w| w.contains("Duplicate URL")));
    }

    #[tokio::test]
    async fn tier_cap_selects_lower_rendition() {
        let h = harness_with(
            vec![
                candidate("137", 1080, "h264", Some(4500.0)),
                candidate("135", 480, "h264", Some(1200.0)),
            ],
            |_| {},
            None,
        )
        .await;
        let job_id = h
            .orchestrator
            .submit(submission_for(
                &["https://youtube.com/watch?v=a"],
                UserTier::Free,
                QualityMode::Best,
                false,
            ))
            .await
            .unwrap();

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);

        let tasks = h.orchestrator.get_tasks(job_id).await.unwrap();
        let rendition = tasks[0].selected_rendition.as_ref().unwrap();
        assert_eq!(rendition.height, Some(480));
    }

    #[tokio::test]
    async fn empty_candidate_list_is_validation_failure() {
        let h = harness_with(Vec::new(), |_| {}, None).await;
        let job_id = h
            .orchestrator
            .submit(submission(&["https://youtube.com/watch?v=a"], false))
            .await
            .unwrap();

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Failed);

        let tasks = h.orchestrator.get_tasks(job_id).await.unwrap();
        let info = tasks[0].error_info.as_ref().unwrap();
        assert_eq!(info.kind, ErrorKind::Validation);
        assert!(info.message.contains("quality settings"));
    }

    #[tokio::test]
    async fn submission_must_contain_urls() {
        let h = harness().await;
        let err = h
            .orchestrator
            .submit(submission(&[], false))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid batch submission"));
    }

    #[tokio::test]
    async fn submission_caps_url_count() {
        let h = harness().await;
        let urls: Vec<String> = (0..21)
            .map(|i| format!("https://youtube.com/watch?v={}", i))
            .collect();
        let err = h
            .orchestrator
            .submit(BatchSubmission {
                urls,
                policy: QualityPolicy::new(UserTier::Premium, QualityMode::Auto),
                archive_requested: false,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid batch submission"));
    }

    #[tokio::test(start_paused = true)]
    async fn retrieval_retries_after_network_failure() {
        let h = harness().await;
        let url = "https://youtube.com/watch?v=a";
        h.retriever.script(url, vec![ScriptStep::FailNetwork]);
        let job_id = h.orchestrator.submit(submission(&[url], false)).await.unwrap();

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.retriever.calls(), 2);

        let tasks = h.orchestrator.get_tasks(job_id).await.unwrap();
        assert_eq!(tasks[0].retry_count, 1);
        let record = h.tracker.snapshot(tasks[0].id).unwrap();
        assert!(record
            .warnings
            .iter()
            .any(|w| w.contains("Retrieval attempt 1 failed")));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhaust_into_failure() {
        let h = harness().await;
        let url = "https://youtube.com/watch?v=a";
        h.retriever.script(
            url,
            vec![
                ScriptStep::FailNetwork,
                ScriptStep::FailRateLimited,
                ScriptStep::FailNetwork,
                ScriptStep::FailNetwork,
            ],
        );
        let job_id = h.orchestrator.submit(submission(&[url], false)).await.unwrap();

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(h.retriever.calls(), 4);

        let tasks = h.orchestrator.get_tasks(job_id).await.unwrap();
        assert_eq!(tasks[0].retry_count, 3);
        let info = tasks[0].error_info.as_ref().unwrap();
        assert_eq!(info.kind, ErrorKind::Retrieval(RetrievalKind::Network));
    }

    #[tokio::test]
    async fn unsupported_platform_fails_without_retry() {
        let h = harness().await;
        let url = "https://example.com/clip";
        h.retriever.script(url, vec![ScriptStep::FailUnsupported]);
        let job_id = h.orchestrator.submit(submission(&[url], false)).await.unwrap();

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(h.retriever.calls(), 1);

        let tasks = h.orchestrator.get_tasks(job_id).await.unwrap();
        let info = tasks[0].error_info.as_ref().unwrap();
        assert_eq!(
            info.kind,
            ErrorKind::Retrieval(RetrievalKind::UnsupportedPlatform)
        );
    }

    #[tokio::test]
    async fn missing_source_fails_without_retry() {
        let h = harness().await;
        let url = "https://youtube.com/watch?v=deleted";
        h.retriever.script(url, vec![ScriptStep::FailNotFound]);
        let job_id = h.orchestrator.submit(submission(&[url], false)).await.unwrap();

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(h.retriever.calls(), 1);

        let tasks = h.orchestrator.get_tasks(job_id).await.unwrap();
        let info = tasks[0].error_info.as_ref().unwrap();
        assert_eq!(info.kind, ErrorKind::Retrieval(RetrievalKind::NotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_retrieval_times_out() {
        let h = harness().await;
        h.retriever.set_delay(Duration::from_secs(7200));
        let job_id = h
            .orchestrator
            .submit(submission(&["https://youtube.com/watch?v=a"], false))
            .await
            .unwrap();

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Failed);

        let tasks = h.orchestrator.get_tasks(job_id).await.unwrap();
        let info = tasks[0].error_info.as_ref().unwrap();
        assert_eq!(info.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn non_h264_source_is_transcoded() {
        let h = harness_with(
            vec![candidate("303", 720, "vp9", Some(2500.0))],
            |_| {},
            None,
        )
        .await;
        let job_id = h
            .orchestrator
            .submit(submission(&["https://youtube.com/watch?v=a"], false))
            .await
            .unwrap();

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.encoder.calls(), 1);
    }

    #[tokio::test]
    async fn compliant_source_passes_through() {
        let h = harness().await;
        let job_id = h
            .orchestrator
            .submit(submission(&["https://youtube.com/watch?v=a"], false))
            .await
            .unwrap();

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.encoder.calls(), 0);
    }

    #[tokio::test]
    async fn encoder_failure_is_processing_error() {
        let h = harness_with(
            vec![candidate("303", 720, "vp9", Some(2500.0))],
            |_| {},
            None,
        )
        .await;
        h.encoder.set_fail(true);
        let job_id = h
            .orchestrator
            .submit(submission(&["https://youtube.com/watch?v=a"], false))
            .await
            .unwrap();

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Failed);

        let tasks = h.orchestrator.get_tasks(job_id).await.unwrap();
        let info = tasks[0].error_info.as_ref().unwrap();
        assert_eq!(info.kind, ErrorKind::Processing);
        assert!(info.detail.as_deref().unwrap().contains("simulated"));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_blocks_next_stage_and_resume_releases_it() {
        let h = harness().await;
        h.retriever.set_delay(Duration::from_secs(5));
        let job_id = h
            .orchestrator
            .submit(submission(&["https://youtube.com/watch?v=a"], false))
            .await
            .unwrap();

        sleep(Duration::from_millis(1)).await;
        assert!(h.orchestrator.pause(job_id).await);

        // In-flight retrieval finishes; the task must then park before the
        // processing stage.
        sleep(Duration::from_secs(10)).await;
        assert_eq!(h.retriever.calls(), 1);
        let job = h.orchestrator.get_status(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Paused);
        assert_eq!(h.encoder.calls(), 0);
        let record = h.orchestrator.get_progress(job_id).unwrap();
        assert_eq!(record.status, TaskStatus::Paused);

        assert!(!h.orchestrator.pause(job_id).await);
        assert!(h.orchestrator.resume(job_id).await);
        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_skips_work_after_current_stage() {
        let h = harness().await;
        h.retriever.set_delay(Duration::from_secs(5));
        let job_id = h
            .orchestrator
            .submit(submission(
                &[
                    "https://youtube.com/watch?v=a",
                    "https://youtube.com/watch?v=b",
                ],
                false,
            ))
            .await
            .unwrap();

        sleep(Duration::from_millis(1)).await;
        assert!(h.orchestrator.cancel(job_id).await);

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.completed_count, 0);
        assert_eq!(job.skipped_count, 2);
        assert!(!h.orchestrator.cancel(job_id).await);

        // In-flight retrievals were allowed to finish but nothing uploaded.
        assert_eq!(h.primary.object_count(), 0);
        let record = h.orchestrator.get_progress(job_id).unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
        assert_eq!(record.message, "Task cancelled: Cancelled by user");

        let calls = h.hook.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1.is_empty());
    }

    struct FlakyGate {
        refusals: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyGate {
        fn new(refusals: u32) -> Self {
            Self {
                refusals: AtomicU32::new(refusals),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl CapacityGate for FlakyGate {
        async fn can_accept_task(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_gate_delays_processing_stage() {
        let gate = Arc::new(FlakyGate::new(2));
        let h = harness_with(
            passthrough_candidates(),
            |_| {},
            Some(gate.clone() as Arc<dyn CapacityGate>),
        )
        .await;
        let job_id = h
            .orchestrator
            .submit(submission(&["https://youtube.com/watch?v=a"], false))
            .await
            .unwrap();

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(gate.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn batch_completes_behind_host_capacity_checker() {
        // Real sysinfo-backed gate with thresholds the test host cannot hit.
        let checker_dir = TempDir::new().unwrap();
        let checker = Arc::new(mediabatch_infra::CapacityChecker::new(test_config(
            checker_dir.path(),
        )));
        let h = harness_with(
            passthrough_candidates(),
            |_| {},
            Some(checker as Arc<dyn CapacityGate>),
        )
        .await;

        let job_id = h
            .orchestrator
            .submit(submission(&["https://youtube.com/watch?v=a"], false))
            .await
            .unwrap();

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.primary.object_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn upload_failover_completes_with_warning() {
        let staging_dir = TempDir::new().unwrap();
        let config = test_config(staging_dir.path());
        let staging = Arc::new(
            StagingStore::new(StagingConfig::from_config(&config))
                .await
                .unwrap(),
        );
        let tracker = Arc::new(ProgressTracker::new());
        let retriever = Arc::new(MockRetriever::new(passthrough_candidates()));
        let primary = Arc::new(MemoryStorage::new(StorageBackendKind::Wasabi));
        let secondary = Arc::new(MemoryStorage::new(StorageBackendKind::Backblaze));
        primary.fail_next_uploads(u32::MAX);

        let orchestrator = BatchOrchestrator::new(
            config,
            retriever.clone(),
            Arc::new(MockEncoder::new()),
            vec![
                primary.clone() as Arc<dyn Storage>,
                secondary.clone() as Arc<dyn Storage>,
            ],
            staging,
            tracker.clone(),
            None,
            Arc::new(RecordingHook::new()),
        )
        .await;

        let job_id = orchestrator
            .submit(submission(&["https://youtube.com/watch?v=a"], false))
            .await
            .unwrap();

        let job = wait_terminal(&orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);

        let tasks = orchestrator.get_tasks(job_id).await.unwrap();
        let key = tasks[0].remote_object_key.as_ref().unwrap();
        assert!(secondary.contains(key));
        assert!(!primary.contains(key));

        let record = tracker.snapshot(tasks[0].id).unwrap();
        assert!(record.warnings.iter().any(|w| w.contains("wasabi")));
    }

    #[tokio::test]
    async fn archive_request_bundles_outputs() {
        let h = harness().await;
        let job_id = h
            .orchestrator
            .submit(submission(
                &[
                    "https://youtube.com/watch?v=a",
                    "https://youtube.com/watch?v=b",
                ],
                true,
            ))
            .await
            .unwrap();

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);

        let archive_key = job.archive_key.as_ref().unwrap();
        assert!(archive_key.starts_with("archives/"));
        assert!(h.primary.contains(archive_key));
        // Two main files plus the archive.
        assert_eq!(h.primary.object_count(), 3);

        let calls = h.hook.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, job_id);
        assert_eq!(calls[0].1.len(), 2);
        assert_eq!(calls[0].2.as_deref(), Some(archive_key.as_str()));

        // Outputs arrive in submission order.
        let tasks = h.orchestrator.get_tasks(job_id).await.unwrap();
        assert_eq!(calls[0].1[0].task_id, tasks[0].id);
        assert_eq!(calls[0].1[1].task_id, tasks[1].id);

        // Retained staged copies are cleaned up after archiving.
        for task in &tasks {
            let staged = task.staged_file_path.as_ref().unwrap();
            assert!(!staged.exists());
        }
    }

    #[tokio::test]
    async fn oversized_archive_falls_back_to_files() {
        let h = harness_with(
            passthrough_candidates(),
            |config| config.0.max_archive_size_mb = 0,
            None,
        )
        .await;
        let job_id = h
            .orchestrator
            .submit(submission(
                &[
                    "https://youtube.com/watch?v=a",
                    "https://youtube.com/watch?v=b",
                ],
                true,
            ))
            .await
            .unwrap();

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.archive_key.is_none());
        // Per-file uploads only, no archive object.
        assert_eq!(h.primary.object_count(), 2);

        let record = h.orchestrator.get_progress(job_id).unwrap();
        assert!(record.warnings.iter().any(|w| w.contains("Archive skipped")));

        let calls = h.hook.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].2.is_none());
    }

    #[tokio::test]
    async fn all_invalid_urls_fail_the_job() {
        let h = harness().await;
        let job_id = h
            .orchestrator
            .submit(submission(&["nope", "also nope"], false))
            .await
            .unwrap();

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failed_count, 2);
        assert_eq!(h.retriever.calls(), 0);

        let calls = h.hook.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1.is_empty());
    }

    #[tokio::test]
    async fn remove_job_evicts_only_terminal_jobs() {
        let h = harness().await;
        let job_id = h
            .orchestrator
            .submit(submission(&["https://youtube.com/watch?v=a"], false))
            .await
            .unwrap();

        wait_terminal(&h.orchestrator, job_id).await;
        let tasks = h.orchestrator.get_tasks(job_id).await.unwrap();

        assert!(h.orchestrator.remove_job(job_id).await);
        assert!(h.orchestrator.get_status(job_id).await.is_none());
        assert!(h.orchestrator.get_progress(job_id).is_none());
        assert!(h.tracker.snapshot(tasks[0].id).is_none());
        assert!(!h.orchestrator.remove_job(job_id).await);
    }

    #[tokio::test]
    async fn handle_wraps_submission_surface() {
        let h = harness().await;
        let handle = PipelineHandle::new(h.orchestrator.clone(), h.tracker.clone());
        let job_id = handle
            .submit_batch(
                vec!["https://youtube.com/watch?v=a".to_string()],
                QualityPolicy::new(UserTier::Premium, QualityMode::Auto),
                false,
            )
            .await
            .unwrap();

        let mut subscription = handle.subscribe(job_id).unwrap();
        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);

        let record = handle.get_progress(job_id).unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(!handle.cancel_batch(job_id).await);

        // The terminal notification is always delivered.
        let mut saw_terminal = false;
        while let Some(update) = subscription.recv().await {
            if update.status.is_terminal() {
                saw_terminal = true;
                break;
            }
        }
        assert!(saw_terminal);
    }
}
