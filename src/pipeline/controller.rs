use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::extractor::HtmlExtractor;
use super::fetcher::FetchClient;
use super::finalizer::JobFinalizer;
use super::pool::ConcurrencyController;
use super::response::{SubmissionResponse, SubmitError};
use super::task::TaskContext;
use super::validator::{validate, ScrapeRequest};
use crate::cli::config::ScraperConfig;
use crate::storage::{JobStore, NewJob};
use crate::utils::PoolMetrics;

/// Strategy tag stored on every job this controller creates
pub const STRATEGY: &str = "http-basic";

/// Entry point for batch submissions.
///
/// One submission runs validate, job creation, target creation, the pool and
/// the finalizer in that order, and answers once every target has settled.
pub struct ScrapeController {
    store: Arc<dyn JobStore>,
    fetcher: FetchClient,
    extractor: Arc<HtmlExtractor>,
    pool: ConcurrencyController,
}

impl ScrapeController {
    /// Create a controller that fetches over HTTP with the configured settings
    pub fn new(config: &ScraperConfig, store: Arc<dyn JobStore>) -> Result<Self> {
        let fetcher = FetchClient::http(&config.fetch)?;
        Self::with_fetcher(store, fetcher, config.pool.max_concurrency)
    }

    /// Create a controller over an existing fetch client
    pub fn with_fetcher(store: Arc<dyn JobStore>, fetcher: FetchClient, max_concurrency: usize) -> Result<Self> {
        let extractor = HtmlExtractor::new().context("Failed to build HTML extractor")?;

        Ok(Self {
            store,
            fetcher,
            extractor: Arc::new(extractor),
            pool: ConcurrencyController::new(max_concurrency),
        })
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Submit a batch and wait for it to finish
    pub async fn submit(&self, request: ScrapeRequest) -> Result<SubmissionResponse, SubmitError> {
        let validated = validate(&request)?;
        let started_at = Utc::now();

        let label = validated.label.clone().unwrap_or_else(|| {
            format!("API job @ {}", started_at.to_rfc3339_opts(SecondsFormat::Millis, true))
        });

        let job = NewJob {
            label,
            strategy: STRATEGY.to_string(),
            seeds: validated.urls.clone(),
            config: validated.config.clone(),
            started_at,
        };
        let job_id = self
            .store
            .create_job(&job)
            .await
            .context("Failed to create job")
            .map_err(SubmitError::Orchestration)?;

        info!(
            job_id = %job_id,
            label = %job.label,
            urls = validated.urls.len(),
            requested = validated.requested_count,
            "Job started"
        );

        let targets = self
            .store
            .create_targets(job_id, &validated.urls)
            .await
            .context(format!("Failed to create targets for job {}", job_id))
            .map_err(SubmitError::Orchestration)?;

        let ctx = Arc::new(TaskContext {
            job_id,
            store: self.store.clone(),
            fetcher: self.fetcher.clone(),
            extractor: self.extractor.clone(),
            timeout: validated.config.timeout_ms.map(Duration::from_millis),
            metrics: PoolMetrics::new(),
        });

        let results = self.pool.run(ctx.clone(), &validated.urls, targets).await;

        let summary = JobFinalizer::new(self.store.as_ref())
            .finalize(job_id, &results, validated.requested_count, started_at, &ctx.metrics)
            .await
            .map_err(SubmitError::Orchestration)?;

        Ok(SubmissionResponse {
            job_id,
            status: summary.caller_status,
            results,
        })
    }
}
