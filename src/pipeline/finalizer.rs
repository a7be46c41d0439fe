use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::task::TargetOutcome;
use crate::storage::{JobCompletion, JobStats, JobStatus, JobStore};
use crate::utils::PoolMetrics;

/// Batch status reported to the submitter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallerStatus {
    Ok,
    Partial,
    Failed,
}

impl CallerStatus {
    pub fn from_counts(success: usize, failed: usize) -> Self {
        if failed == 0 {
            CallerStatus::Ok
        } else if success == 0 {
            CallerStatus::Failed
        } else {
            CallerStatus::Partial
        }
    }
}

/// What the finalizer decided for a job
#[derive(Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub completion: JobCompletion,
    pub caller_status: CallerStatus,
}

/// Derive stats and the persisted/caller statuses from settled outcomes.
///
/// The persisted status is COMPLETED only when every target succeeded; a
/// mixed batch is stored as FAILED.
pub fn summarize(
    outcomes: &[TargetOutcome],
    requested: usize,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> JobSummary {
    let success = outcomes.iter().filter(|o| o.ok).count();
    let failed = outcomes.len() - success;
    let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;

    let status = if failed == 0 {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    };

    JobSummary {
        completion: JobCompletion {
            status,
            stats: JobStats {
                total_urls_requested: requested,
                total_urls_unique: outcomes.len(),
                success,
                failed,
                duration_ms,
            },
            last_run_at: started_at,
            completed_at: finished_at,
        },
        caller_status: CallerStatus::from_counts(success, failed),
    }
}

/// Closes out a job once every target has settled
pub struct JobFinalizer<'a> {
    store: &'a dyn JobStore,
}

impl<'a> JobFinalizer<'a> {
    pub fn new(store: &'a dyn JobStore) -> Self {
        Self { store }
    }

    pub async fn finalize(
        &self,
        job_id: Uuid,
        outcomes: &[TargetOutcome],
        requested: usize,
        started_at: DateTime<Utc>,
        metrics: &PoolMetrics,
    ) -> Result<JobSummary> {
        let summary = summarize(outcomes, requested, started_at, Utc::now());

        self.store
            .update_job(job_id, &summary.completion)
            .await
            .context(format!("Failed to finalize job {}", job_id))?;

        let snapshot = metrics.snapshot();
        let stats = &summary.completion.stats;
        info!(
            job_id = %job_id,
            status = %summary.completion.status,
            success = stats.success,
            failed = stats.failed,
            duration_ms = stats.duration_ms,
            peak_in_flight = snapshot.peak_in_flight,
            bytes_downloaded = snapshot.bytes_downloaded,
            "Job finished"
        );

        Ok(summary)
    }
}
