//! Progress module for hlsforge
//!
//! Per-job progress records shared between the orchestrator, which writes
//! them at every state change, and whatever reports them (CLI, a future
//! event stream). Serializes to JSON.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Finished records kept after their job ends; older ones are dropped.
pub const MAX_FINISHED_RECORDS: usize = 64;

/// Progress of one transcode job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobProgress {
    pub job_id: String,
    pub short_id: String,
    pub source: String,
    pub state: String,
    pub renditions_total: usize,
    pub renditions_done: usize,
    /// 0-100
    pub percent: f32,
    pub error: Option<String>,
    pub updated_unix_ms: i64,
}

impl JobProgress {
    pub fn new(job_id: &str, short_id: &str, source: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            short_id: short_id.to_string(),
            source: source.to_string(),
            state: "planning".to_string(),
            renditions_total: 0,
            renditions_done: 0,
            percent: 0.0,
            error: None,
            updated_unix_ms: now_unix_ms(),
        }
    }

    /// Published or failed
    pub fn is_finished(&self) -> bool {
        self.state == "published" || self.state == "failed"
    }

    /// Encoding spans 5%..90%; the remainder covers planning and finalizing.
    pub fn encoding_percent(done: usize, total: usize) -> f32 {
        if total == 0 {
            return 5.0;
        }
        5.0 + 85.0 * (done.min(total) as f32 / total as f32)
    }
}

/// All tracked jobs plus aggregate counters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProgressSnapshot {
    pub jobs: Vec<JobProgress>,
    pub queue_len: usize,
    pub running_jobs: usize,
    pub published_jobs: u64,
    pub failed_jobs: u64,
}

impl ProgressSnapshot {
    pub fn get(&self, job_id: &str) -> Option<&JobProgress> {
        self.jobs.iter().find(|j| j.job_id == job_id)
    }

    /// Replaces the record for `progress.job_id`, or adds it.
    pub fn upsert(&mut self, mut progress: JobProgress) {
        progress.updated_unix_ms = now_unix_ms();
        if let Some(existing) = self.jobs.iter_mut().find(|j| j.job_id == progress.job_id) {
            *existing = progress;
        } else {
            self.jobs.push(progress);
        }

        self.prune_finished();
        self.running_jobs = self.jobs.iter().filter(|j| !j.is_finished()).count();
    }

    /// Drops the oldest finished records beyond [`MAX_FINISHED_RECORDS`].
    fn prune_finished(&mut self) {
        let finished = self.jobs.iter().filter(|j| j.is_finished()).count();
        let mut excess = finished.saturating_sub(MAX_FINISHED_RECORDS);
        if excess == 0 {
            return;
        }
        self.jobs.retain(|j| {
            if excess > 0 && j.is_finished() {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}

/// Shared progress state for concurrent access across pipeline components
pub type SharedProgress = Arc<RwLock<ProgressSnapshot>>;

/// Creates a new SharedProgress instance with no jobs
pub fn new_shared_progress() -> SharedProgress {
    Arc::new(RwLock::new(ProgressSnapshot::default()))
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_replaces_and_counts_running() {
        let mut snapshot = ProgressSnapshot::default();
        let mut job = JobProgress::new("j1", "abcd1234", "/in/a.mp4");
        snapshot.upsert(job.clone());
        snapshot.upsert(JobProgress::new("j2", "efgh5678", "/in/b.mp4"));
        assert_eq!(snapshot.running_jobs, 2);

        job.state = "published".to_string();
        job.percent = 100.0;
        snapshot.upsert(job);

        assert_eq!(snapshot.jobs.len(), 2);
        assert_eq!(snapshot.get("j1").unwrap().state, "published");
        assert_eq!(snapshot.running_jobs, 1);
    }

    #[test]
    fn test_finished_records_are_capped() {
        let mut snapshot = ProgressSnapshot::default();
        snapshot.upsert(JobProgress::new("running", "aaaa0000", "/in/r.mp4"));
        for i in 0..MAX_FINISHED_RECORDS + 10 {
            let mut job = JobProgress::new(&format!("done{i}"), "bbbb0000", "/in/d.mp4");
            job.state = if i % 2 == 0 { "published" } else { "failed" }.to_string();
            snapshot.upsert(job);
        }

        assert_eq!(snapshot.jobs.len(), MAX_FINISHED_RECORDS + 1);
        assert!(snapshot.get("running").is_some());
        assert!(snapshot.get("done0").is_none());
        assert!(snapshot.get("done9").is_none());
        assert!(snapshot.get("done10").is_some());
        assert_eq!(snapshot.running_jobs, 1);
    }

    #[test]
    fn test_encoding_percent_bounds() {
        assert_eq!(JobProgress::encoding_percent(0, 0), 5.0);
        assert_eq!(JobProgress::encoding_percent(0, 4), 5.0);
        assert_eq!(JobProgress::encoding_percent(4, 4), 90.0);
        assert_eq!(JobProgress::encoding_percent(9, 4), 90.0);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let mut snapshot = ProgressSnapshot::default();
        let mut job = JobProgress::new("j1", "abcd1234", "/in/a.mp4");
        job.error = Some("encoder failed".into());
        snapshot.upsert(job);

        let value: serde_json::Value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["jobs"][0]["short_id"], "abcd1234");
        assert_eq!(value["jobs"][0]["error"], "encoder failed");
        assert_eq!(value["running_jobs"], 1);
    }

    #[tokio::test]
    async fn test_shared_progress_is_writable() {
        let shared = new_shared_progress();
        shared
            .write()
            .await
            .upsert(JobProgress::new("j1", "abcd1234", "/in/a.mp4"));
        assert!(shared.read().await.get("j1").is_some());
    }
}
