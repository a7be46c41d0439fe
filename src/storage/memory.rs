use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::records::*;
use super::JobStore;

#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: Uuid,
    pub label: String,
    pub strategy: String,
    pub status: JobStatus,
    pub seeds: Vec<String>,
    pub config: JobConfig,
    pub stats: Option<JobStats>,
    pub last_run_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct TargetRow {
    pub id: Uuid,
    pub job_id: Uuid,
    pub url: String,
    pub normalized_url: String,
    pub depth: u32,
    pub metadata: TargetMetadata,
    pub last_status: Option<u16>,
    pub last_scraped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct AttemptRow {
    pub id: Uuid,
    pub job_id: Uuid,
    pub target_id: Uuid,
    pub attempt: NewAttempt,
}

#[derive(Debug, Clone)]
pub struct ResultRow {
    pub id: Uuid,
    pub job_id: Uuid,
    pub target_id: Uuid,
    pub result: NewResult,
}

#[derive(Debug, Clone)]
pub struct ErrorRow {
    pub id: Uuid,
    pub job_id: Uuid,
    pub target_id: Uuid,
    pub error: NewError,
}

#[derive(Debug, Default)]
struct Tables {
    jobs: Vec<JobRow>,
    targets: Vec<TargetRow>,
    attempts: Vec<AttemptRow>,
    results: Vec<ResultRow>,
    errors: Vec<ErrorRow>,
}

/// Process-local JobStore, used for dry runs and tests.
///
/// The lock is never held across an await point.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    tables: Mutex<Tables>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory store lock poisoned"))
    }

    pub fn jobs(&self) -> Vec<JobRow> {
        self.lock().map(|t| t.jobs.clone()).unwrap_or_default()
    }

    pub fn targets(&self, job_id: Uuid) -> Vec<TargetRow> {
        self.lock()
            .map(|t| t.targets.iter().filter(|r| r.job_id == job_id).cloned().collect())
            .unwrap_or_default()
    }

    pub fn attempts(&self, job_id: Uuid) -> Vec<AttemptRow> {
        self.lock()
            .map(|t| t.attempts.iter().filter(|r| r.job_id == job_id).cloned().collect())
            .unwrap_or_default()
    }

    pub fn results(&self, job_id: Uuid) -> Vec<ResultRow> {
        self.lock()
            .map(|t| t.results.iter().filter(|r| r.job_id == job_id).cloned().collect())
            .unwrap_or_default()
    }

    pub fn errors(&self, job_id: Uuid) -> Vec<ErrorRow> {
        self.lock()
            .map(|t| t.errors.iter().filter(|r| r.job_id == job_id).cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: &NewJob) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.lock()?.jobs.push(JobRow {
            id,
            label: job.label.clone(),
            strategy: job.strategy.clone(),
            status: JobStatus::Running,
            seeds: job.seeds.clone(),
            config: job.config.clone(),
            stats: None,
            last_run_at: job.started_at,
            completed_at: None,
        });
        debug!("Created job {} in memory", id);
        Ok(id)
    }

    async fn create_targets(&self, job_id: Uuid, urls: &[String]) -> Result<Vec<TargetRef>> {
        let mut tables = self.lock()?;
        if !tables.jobs.iter().any(|j| j.id == job_id) {
            anyhow::bail!("Job not found: {}", job_id);
        }

        // Build the whole batch before making any of it visible
        let rows: Vec<TargetRow> = urls
            .iter()
            .enumerate()
            .map(|(index, url)| TargetRow {
                id: Uuid::new_v4(),
                job_id,
                url: url.clone(),
                normalized_url: url.clone(),
                depth: 0,
                metadata: TargetMetadata { index },
                last_status: None,
                last_scraped_at: None,
            })
            .collect();

        let refs = rows
            .iter()
            .map(|r| TargetRef { id: r.id, url: r.url.clone() })
            .collect();
        tables.targets.extend(rows);

        Ok(refs)
    }

    async fn create_attempt(&self, job_id: Uuid, target_id: Uuid, attempt: &NewAttempt) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.lock()?.attempts.push(AttemptRow {
            id,
            job_id,
            target_id,
            attempt: attempt.clone(),
        });
        Ok(id)
    }

    async fn create_result(&self, job_id: Uuid, target_id: Uuid, result: &NewResult) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.lock()?.results.push(ResultRow {
            id,
            job_id,
            target_id,
            result: result.clone(),
        });
        Ok(id)
    }

    async fn create_error(&self, job_id: Uuid, target_id: Uuid, error: &NewError) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.lock()?.errors.push(ErrorRow {
            id,
            job_id,
            target_id,
            error: error.clone(),
        });
        Ok(id)
    }

    async fn update_target(&self, target_id: Uuid, update: &TargetUpdate) -> Result<()> {
        let mut tables = self.lock()?;
        let target = tables
            .targets
            .iter_mut()
            .find(|t| t.id == target_id)
            .context(format!("Target not found: {}", target_id))?;
        target.last_status = Some(update.last_status);
        target.last_scraped_at = Some(update.last_scraped_at);
        Ok(())
    }

    async fn update_job(&self, job_id: Uuid, completion: &JobCompletion) -> Result<()> {
        let mut tables = self.lock()?;
        let job = tables
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .context(format!("Job not found: {}", job_id))?;
        job.status = completion.status;
        job.stats = Some(completion.stats.clone());
        job.last_run_at = completion.last_run_at;
        job.completed_at = Some(completion.completed_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn new_job() -> NewJob {
        NewJob {
            label: "test".to_string(),
            strategy: "http-basic".to_string(),
            seeds: vec!["https://a.test/".to_string()],
            config: JobConfig::default(),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_targets_keep_input_order_and_index() {
        let store = MemoryJobStore::new();
        let job_id = assert_ok!(store.create_job(&new_job()).await);

        let urls = vec![
            "https://b.test/".to_string(),
            "https://a.test/".to_string(),
            "https://c.test/".to_string(),
        ];
        let refs = store.create_targets(job_id, &urls).await.unwrap();

        let returned: Vec<_> = refs.iter().map(|r| r.url.clone()).collect();
        assert_eq!(returned, urls);

        let rows = store.targets(job_id);
        assert_eq!(rows.len(), 3);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.metadata.index, i);
            assert_eq!(row.depth, 0);
            assert_eq!(row.normalized_url, row.url);
        }
    }

    #[tokio::test]
    async fn test_targets_for_unknown_job_are_not_created() {
        let store = MemoryJobStore::new();
        let result = store
            .create_targets(Uuid::new_v4(), &["https://a.test/".to_string()])
            .await;

        assert_err!(result);
        assert!(store.lock().unwrap().targets.is_empty());
    }

    #[tokio::test]
    async fn test_update_job_sets_terminal_state() {
        let store = MemoryJobStore::new();
        let job_id = store.create_job(&new_job()).await.unwrap();
        assert_eq!(store.jobs()[0].status, JobStatus::Running);

        let now = Utc::now();
        let completion = JobCompletion {
            status: JobStatus::Completed,
            stats: JobStats {
                total_urls_requested: 1,
                total_urls_unique: 1,
                success: 1,
                failed: 0,
                duration_ms: 12,
            },
            last_run_at: now,
            completed_at: now,
        };
        store.update_job(job_id, &completion).await.unwrap();

        let job = &store.jobs()[0];
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.stats.as_ref().unwrap().success, 1);
        assert_eq!(job.completed_at, Some(now));
    }
}
