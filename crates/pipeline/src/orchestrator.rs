//! Transcode orchestrator module for hlsforge
//!
//! Drives one upload through probe, ladder planning, bounded parallel
//! rendition encodes, master playlist and thumbnail generation, and the
//! atomic publish. Encodes across all jobs share one semaphore.

use crate::config::Config;
use crate::encode::{EncodeError, EncodeSettings, EncodeWorker, RenditionOutput};
use crate::exec::CommandRunner;
use crate::ladder::{RenditionPlanner, RenditionSpec};
use crate::playlist::{MasterPlaylist, SegmentPolicy, VariantStream, MASTER_PLAYLIST, MEDIA_PLAYLIST};
use crate::probe::{ProbeError, ProbeService, SourceAsset};
use crate::progress::{JobProgress, SharedProgress};
use crate::publish::{
    allocate_short_id, claim_staging, discard_staging, publish, published_dir, PublishError,
};
use crate::thumbnail::{ThumbnailGenerator, THUMBNAIL_FILE};
use crate::ConcurrencyPlan;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Error type for transcode jobs
#[derive(Debug, Error)]
pub enum JobError {
    /// The source could not be probed
    #[error("probe failed: {0}")]
    Probe(#[from] ProbeError),

    /// A rendition failed; the whole job is abandoned
    #[error("rendition {label} failed: {source}")]
    Encode {
        label: String,
        #[source]
        source: EncodeError,
    },

    /// Writing the master playlist failed
    #[error("failed to write master playlist: {0}")]
    Finalize(std::io::Error),

    /// Staging or the final move failed
    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),

    /// An encode task panicked or was aborted
    #[error("encode task failed: {0}")]
    Task(String),
}

/// Job state representing the current stage in the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum JobState {
    /// Probing the source and planning the ladder
    Planning,
    /// Rendition encodes are running
    Encoding,
    /// Writing the master playlist and thumbnail, then publishing
    Finalizing,
    /// The asset is visible under its short id
    Published,
    /// Job failed
    Failed(String),
}

impl JobState {
    /// Convert state to string for progress reporting
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Planning => "planning",
            JobState::Encoding => "encoding",
            JobState::Finalizing => "finalizing",
            JobState::Published => "published",
            JobState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Published | JobState::Failed(_))
    }
}

/// One upload moving through the pipeline
#[derive(Debug, Clone, Serialize)]
pub struct TranscodeJob {
    /// Internal job identifier (UUID v4)
    pub id: String,
    /// Public asset identifier
    pub short_id: String,
    pub source_path: PathBuf,
    /// Set once probing succeeds
    pub asset: Option<SourceAsset>,
    pub specs: Vec<RenditionSpec>,
    /// Matched to `specs` by index
    pub outputs: Vec<RenditionOutput>,
    pub state: JobState,
    pub created_at: SystemTime,
    pub finished_at: Option<SystemTime>,
    pub error: Option<String>,
}

impl TranscodeJob {
    pub fn new(short_id: String, source_path: PathBuf) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            short_id,
            source_path,
            asset: None,
            specs: Vec::new(),
            outputs: Vec::new(),
            state: JobState::Planning,
            created_at: SystemTime::now(),
            finished_at: None,
            error: None,
        }
    }

    fn progress(&self) -> JobProgress {
        let total = self.specs.len();
        let done = self.outputs.iter().filter(|o| o.is_complete()).count();
        let mut progress = JobProgress::new(
            &self.id,
            &self.short_id,
            &self.source_path.to_string_lossy(),
        );
        progress.state = self.state.as_str().to_string();
        progress.renditions_total = total;
        progress.renditions_done = done;
        progress.percent = match self.state {
            JobState::Planning => 0.0,
            JobState::Encoding => JobProgress::encoding_percent(done, total),
            JobState::Finalizing => 95.0,
            JobState::Published => 100.0,
            JobState::Failed(_) => JobProgress::encoding_percent(done, total),
        };
        progress.error = self.error.clone();
        progress
    }
}

/// Result handed to the catalog after a successful publish
#[derive(Debug, Clone, Serialize)]
pub struct PublishedAsset {
    pub job_id: String,
    pub short_id: String,
    pub dir: PathBuf,
    pub master_playlist: PathBuf,
    pub thumbnail: Option<PathBuf>,
    /// Ascending by height, paths inside the published directory
    pub renditions: Vec<RenditionOutput>,
    pub duration_secs: Option<f64>,
}

/// Transcode orchestrator that runs jobs with a bounded encode pool
///
/// Uses a tokio Semaphore to limit the number of concurrent rendition
/// encodes according to the concurrency plan.
pub struct TranscodeOrchestrator {
    semaphore: Arc<Semaphore>,
    concurrency_plan: ConcurrencyPlan,
    probe: ProbeService,
    planner: RenditionPlanner,
    worker: EncodeWorker,
    thumbnails: ThumbnailGenerator,
    output_root: PathBuf,
    retain_original: bool,
    progress: SharedProgress,
}

impl TranscodeOrchestrator {
    pub fn new(cfg: &Config, runner: Arc<dyn CommandRunner>, progress: SharedProgress) -> Self {
        let plan = ConcurrencyPlan::derive(cfg);
        let permits = plan.encode_pool_size as usize;
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            probe: ProbeService::new(
                runner.clone(),
                cfg.tools.ffprobe.clone(),
                Duration::from_secs(cfg.tools.probe_timeout_secs),
            ),
            planner: RenditionPlanner::new(cfg.ladder.clone()),
            worker: EncodeWorker::new(runner.clone(), EncodeSettings::from_config(cfg, &plan)),
            thumbnails: ThumbnailGenerator::from_config(runner, cfg),
            output_root: cfg.storage.output_root.clone(),
            retain_original: cfg.storage.retain_original,
            concurrency_plan: plan,
            progress,
        }
    }

    /// Get the number of free encode slots
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn concurrency_plan(&self) -> &ConcurrencyPlan {
        &self.concurrency_plan
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn planner(&self) -> &RenditionPlanner {
        &self.planner
    }

    pub fn segment_policy(&self) -> SegmentPolicy {
        self.worker.settings().segment_policy()
    }

    /// New job for `source`. Nothing is written to disk yet.
    pub fn new_job(&self, source: &Path) -> TranscodeJob {
        TranscodeJob::new(allocate_short_id(&self.output_root), source.to_path_buf())
    }

    /// Run a new job for `source` to completion
    pub async fn transcode(
        &self,
        source: &Path,
        qualities: &[String],
    ) -> Result<PublishedAsset, JobError> {
        let mut job = self.new_job(source);
        self.execute(&mut job, qualities).await
    }

    /// Execute a job through the pipeline
    ///
    /// This method implements the full pipeline:
    /// 1. Probes the source and plans the ladder (nothing on disk on failure)
    /// 2. Claims a staging directory and encodes every rendition under the
    ///    shared semaphore, stopping unstarted encodes on the first failure
    /// 3. Writes the master playlist and a best-effort thumbnail
    /// 4. Publishes the staging directory with a single rename
    /// 5. Removes the source when originals are not retained
    pub async fn execute(
        &self,
        job: &mut TranscodeJob,
        qualities: &[String],
    ) -> Result<PublishedAsset, JobError> {
        self.update_progress(job).await;

        let result = self.run_stages(job, qualities).await;
        match &result {
            Ok(asset) => {
                job.state = JobState::Published;
                info!(
                    job_id = %job.id,
                    short_id = %asset.short_id,
                    renditions = asset.renditions.len(),
                    "asset published"
                );
                self.remove_source_if_needed(&job.source_path);
            }
            Err(err) => {
                let reason = err.to_string();
                error!(job_id = %job.id, short_id = %job.short_id, error = %reason, "transcode failed");
                job.error = Some(reason.clone());
                job.state = JobState::Failed(reason);
            }
        }
        job.finished_at = Some(SystemTime::now());
        self.update_progress(job).await;
        self.count_finished(result.is_ok()).await;
        result
    }

    async fn run_stages(
        &self,
        job: &mut TranscodeJob,
        qualities: &[String],
    ) -> Result<PublishedAsset, JobError> {
        // Planning
        let probe = self.probe.clone();
        let source_path = job.source_path.clone();
        let asset = tokio::task::spawn_blocking(move || probe.probe(&source_path))
            .await
            .map_err(|e| JobError::Task(e.to_string()))??;
        job.specs = self
            .planner
            .plan_selected(asset.height, asset.video_bitrate, qualities);
        job.asset = Some(asset.clone());
        info!(
            job_id = %job.id,
            source = %job.source_path.display(),
            height = asset.height,
            ladder = ?job.specs.iter().map(|s| s.label.as_str()).collect::<Vec<_>>(),
            "planned renditions"
        );

        // Encoding
        let (short_id, staging) = claim_staging(&self.output_root, &job.short_id)?;
        job.short_id = short_id;
        job.outputs = job
            .specs
            .iter()
            .map(|spec| RenditionOutput::pending(spec.clone(), staging.join(&spec.label)))
            .collect();
        job.state = JobState::Encoding;
        self.update_progress(job).await;

        if let Err(err) = self.encode_all(job, &asset).await {
            self.discard(&staging);
            return Err(err);
        }

        // Finalizing
        job.state = JobState::Finalizing;
        self.update_progress(job).await;

        let master = MasterPlaylist::new(
            job.outputs
                .iter()
                .map(|output| VariantStream {
                    bandwidth: output.spec.bandwidth(),
                    width: asset.width_for_height(output.spec.height),
                    height: output.spec.height,
                    uri: format!("{}/{}", output.spec.label, MEDIA_PLAYLIST),
                })
                .collect(),
        );
        if let Err(e) = master.write_to_dir(&staging) {
            self.discard(&staging);
            return Err(JobError::Finalize(e));
        }

        let thumbnail_ok = self.write_thumbnail(job, &asset, &staging).await;

        let target = published_dir(&self.output_root, &job.short_id);
        // Staging is kept on a failed publish for inspection
        publish(&staging, &target)?;

        let renditions = job
            .outputs
            .iter()
            .map(|output| {
                let dir = target.join(&output.spec.label);
                RenditionOutput {
                    playlist_path: dir.join(MEDIA_PLAYLIST),
                    dir,
                    ..output.clone()
                }
            })
            .collect();

        Ok(PublishedAsset {
            job_id: job.id.clone(),
            short_id: job.short_id.clone(),
            master_playlist: target.join(MASTER_PLAYLIST),
            thumbnail: thumbnail_ok.then(|| target.join(THUMBNAIL_FILE)),
            dir: target,
            renditions,
            duration_secs: asset.duration_secs,
        })
    }

    /// All-or-nothing parallel encode of `job.specs`.
    async fn encode_all(&self, job: &mut TranscodeJob, asset: &SourceAsset) -> Result<(), JobError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();

        for (index, output) in job.outputs.iter().enumerate() {
            let semaphore = self.semaphore.clone();
            let worker = self.worker.clone();
            let asset = asset.clone();
            let spec = output.spec.clone();
            let dir = output.dir.clone();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (index, None),
                };
                if cancel.load(Ordering::SeqCst) {
                    return (index, None);
                }
                let result =
                    tokio::task::spawn_blocking(move || worker.encode(&asset, &spec, &dir)).await;
                // Set before the permit is released so waiting encodes see it
                if !matches!(result, Ok(Ok(_))) {
                    cancel.store(true, Ordering::SeqCst);
                }
                (index, Some(result))
            });
        }

        let mut first_error: Option<JobError> = None;
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    first_error.get_or_insert(JobError::Task(e.to_string()));
                    continue;
                }
            };
            let label = job.outputs[index].spec.label.clone();

            match result {
                Some(Ok(Ok(output))) => {
                    info!(
                        short_id = %job.short_id,
                        rendition = %label,
                        segments = output.segment_count,
                        "rendition complete"
                    );
                    job.outputs[index] = output;
                    self.update_progress(job).await;
                }
                Some(Ok(Err(source))) => {
                    let reason = source.to_string();
                    job.outputs[index] = job.outputs[index].clone().failed(reason);
                    first_error.get_or_insert(JobError::Encode { label, source });
                }
                Some(Err(join_err)) => {
                    let reason = join_err.to_string();
                    job.outputs[index] = job.outputs[index].clone().failed(reason.clone());
                    first_error.get_or_insert(JobError::Task(reason));
                }
                None => {
                    job.outputs[index] = job.outputs[index].clone().failed("cancelled");
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None if job.outputs.iter().all(RenditionOutput::is_complete) => Ok(()),
            None => Err(JobError::Task("rendition left incomplete".to_string())),
        }
    }

    async fn write_thumbnail(&self, job: &TranscodeJob, asset: &SourceAsset, staging: &Path) -> bool {
        let thumbnails = self.thumbnails.clone();
        let source = asset.path.clone();
        let duration = asset.duration_secs;
        let dest = staging.to_path_buf();
        let result =
            tokio::task::spawn_blocking(move || thumbnails.write_thumbnail(&source, duration, &dest))
                .await;

        match result {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!(short_id = %job.short_id, error = %e, "thumbnail generation failed");
                false
            }
            Err(e) => {
                warn!(short_id = %job.short_id, error = %e, "thumbnail task failed");
                false
            }
        }
    }

    fn discard(&self, staging: &Path) {
        if let Err(e) = discard_staging(staging) {
            warn!(dir = %staging.display(), error = %e, "failed to remove staging directory");
        }
    }

    fn remove_source_if_needed(&self, source: &Path) {
        if self.retain_original {
            return;
        }
        match std::fs::remove_file(source) {
            Ok(()) => info!(source = %source.display(), "removed original upload"),
            Err(e) => warn!(source = %source.display(), error = %e, "failed to remove original upload"),
        }
    }

    /// Update job progress in shared state
    async fn update_progress(&self, job: &TranscodeJob) {
        self.progress.write().await.upsert(job.progress());
    }

    async fn count_finished(&self, published: bool) {
        let mut progress = self.progress.write().await;
        if published {
            progress.published_jobs += 1;
        } else {
            progress.failed_jobs += 1;
        }
    }
}
