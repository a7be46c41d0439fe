pub mod memory;
pub mod postgres;
pub mod records;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::cli::config::StorageSettings;

// Re-export common types
pub use memory::MemoryJobStore;
pub use postgres::PostgresJobStore;
pub use records::{
    AttemptTimings, ErrorDetails, ErrorKind, JobCompletion, JobConfig, JobStats, JobStatus,
    NewAttempt, NewError, NewJob, NewResult, ResultMetadata, TargetMetadata, TargetRef,
    TargetUpdate,
};

/// Write-side persistence for jobs and everything that hangs off them.
///
/// Implementations are shared between concurrently running target tasks, so
/// every method takes `&self`. Rows written by different tasks never overlap.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job row in RUNNING state and return its id
    async fn create_job(&self, job: &NewJob) -> Result<Uuid>;

    /// Create one target per URL, all or nothing, preserving input order
    async fn create_targets(&self, job_id: Uuid, urls: &[String]) -> Result<Vec<TargetRef>>;

    /// Record a fetch attempt and return its id
    async fn create_attempt(&self, job_id: Uuid, target_id: Uuid, attempt: &NewAttempt) -> Result<Uuid>;

    /// Record a successful extraction
    async fn create_result(&self, job_id: Uuid, target_id: Uuid, result: &NewResult) -> Result<Uuid>;

    /// Record a classified failure
    async fn create_error(&self, job_id: Uuid, target_id: Uuid, error: &NewError) -> Result<Uuid>;

    /// Update last status / last scraped time of a target
    async fn update_target(&self, target_id: Uuid, update: &TargetUpdate) -> Result<()>;

    /// Write the terminal status and stats of a job
    async fn update_job(&self, job_id: Uuid, completion: &JobCompletion) -> Result<()>;

    /// Release backend resources
    async fn close(&self) {}
}

/// Factory for creating a JobStore implementation
pub struct JobStoreFactory;

impl JobStoreFactory {
    /// Create a new JobStore instance based on the settings
    pub async fn create(settings: &StorageSettings) -> Result<Arc<dyn JobStore>> {
        match settings.storage_type.as_str() {
            "postgresql" => {
                let store = PostgresJobStore::new(settings).await?;
                Ok(Arc::new(store))
            }
            "memory" => Ok(Arc::new(MemoryJobStore::new())),
            _ => {
                anyhow::bail!("Unsupported storage type: {}", settings.storage_type);
            }
        }
    }
}
