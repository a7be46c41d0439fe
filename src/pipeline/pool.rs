use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use super::task::{record_abort, run_target, TargetOutcome, TaskContext};
use crate::storage::TargetRef;

/// Hard ceiling on targets fetched at once
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

/// Runs one task per target with a fixed number of concurrent fetches
pub struct ConcurrencyController {
    max_concurrency: usize,
}

impl ConcurrencyController {
    /// `max_concurrency` is clamped to `1..=DEFAULT_MAX_CONCURRENCY`
    pub fn new(max_concurrency: usize) -> Self {
        if max_concurrency > DEFAULT_MAX_CONCURRENCY {
            warn!(
                "Requested concurrency {} lowered to {}",
                max_concurrency, DEFAULT_MAX_CONCURRENCY
            );
        }
        Self {
            max_concurrency: max_concurrency.clamp(1, DEFAULT_MAX_CONCURRENCY),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Run every URL to completion and return outcomes in input order.
    ///
    /// A task never fails the batch: a missing target mapping or a task that
    /// panics is reported as a failed outcome for that URL only. A panicked
    /// task still gets an attempt and a `TASK_ABORTED` error record.
    pub async fn run(
        &self,
        ctx: Arc<TaskContext>,
        urls: &[String],
        targets: Vec<TargetRef>,
    ) -> Vec<TargetOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let by_url: HashMap<String, TargetRef> = targets
            .into_iter()
            .map(|target| (target.url.clone(), target))
            .collect();

        debug!(
            job_id = %ctx.job_id,
            "Dispatching {} targets with concurrency {}",
            urls.len(),
            self.max_concurrency
        );

        let mut handles = Vec::with_capacity(urls.len());
        for url in urls {
            let url = url.clone();
            let target = by_url.get(&url).cloned();
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();

            handles.push(tokio::spawn(async move {
                let Some(target) = target else {
                    error!(job_id = %ctx.job_id, url = %url, "No target row for URL");
                    ctx.metrics.record_outcome(false, 0);
                    return TargetOutcome::failed(url, None, "TARGET_MISSING: no target row for URL");
                };

                // Wait for a free slot before touching the network
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return record_abort(&ctx, &target, &e.to_string()).await,
                };

                run_target(&ctx, &target).await
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (url, handle) in urls.iter().zip(handles) {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(job_id = %ctx.job_id, url = %url, "Target task aborted: {}", e);
                    let outcome = match by_url.get(url) {
                        Some(target) => record_abort(&ctx, target, &e.to_string()).await,
                        None => {
                            ctx.metrics.record_outcome(false, 0);
                            TargetOutcome::failed(url.clone(), None, format!("task aborted: {}", e))
                        }
                    };
                    outcomes.push(outcome);
                }
            }
        }

        outcomes
    }
}

impl Default for ConcurrencyController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}
