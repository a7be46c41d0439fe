use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::extractor::{ExtractedPage, HtmlExtractor};
use super::fetcher::{render_chain, FetchClient, FetchResponse, ResponseHead};
use super::fingerprint::fingerprint;
use crate::storage::{
    AttemptTimings, ErrorDetails, ErrorKind, JobStore, NewAttempt, NewError, NewResult,
    ResultMetadata, TargetRef, TargetUpdate,
};
use crate::utils::{PoolMetrics, RequestTimer};

/// Per-URL outcome reported back to the submitter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetOutcome {
    pub url: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TargetOutcome {
    pub fn succeeded(url: impl Into<String>, status_code: u16) -> Self {
        Self {
            url: url.into(),
            ok: true,
            status_code: Some(status_code),
            error: None,
        }
    }

    pub fn failed(url: impl Into<String>, status_code: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ok: false,
            status_code,
            error: Some(error.into()),
        }
    }
}

/// Everything a target task needs, shared by all tasks of one job
pub struct TaskContext {
    pub job_id: Uuid,
    pub store: Arc<dyn JobStore>,
    pub fetcher: FetchClient,
    pub extractor: Arc<HtmlExtractor>,
    /// Per-request deadline override for this job
    pub timeout: Option<Duration>,
    pub metrics: PoolMetrics,
}

/// Response facts gathered before a failure
#[derive(Debug, Default)]
struct Observed {
    status_code: Option<u16>,
    bytes: Option<usize>,
    headers: Option<BTreeMap<String, String>>,
}

impl Observed {
    fn response(response: &FetchResponse) -> Self {
        Self {
            status_code: Some(response.status),
            bytes: Some(response.bytes()),
            headers: Some(response.headers.clone()),
        }
    }

    fn head(head: Option<&ResponseHead>) -> Self {
        match head {
            Some(head) => Self {
                status_code: Some(head.status),
                bytes: None,
                headers: Some(head.headers.clone()),
            },
            None => Self::default(),
        }
    }
}

/// Why a target failed, with whatever the fetch got before failing
struct Failure {
    code: String,
    kind: ErrorKind,
    message: String,
    stack: Option<String>,
    observed: Observed,
    duration_ms: u64,
}

/// Fetch, extract and persist one target.
///
/// Never returns an error: every failure is written as an attempt plus an
/// error record and reported as a failed outcome.
pub async fn run_target(ctx: &TaskContext, target: &TargetRef) -> TargetOutcome {
    let timer = RequestTimer::start();

    let fetched = {
        let _in_flight = ctx.metrics.begin_fetch();
        ctx.fetcher.fetch(&target.url, ctx.timeout).await
    };
    let duration_ms = timer.elapsed_ms();

    let response = match fetched {
        Ok(response) => response,
        Err(err) => {
            let failure = Failure {
                code: err.code().to_string(),
                kind: err.kind(),
                message: err.to_string(),
                stack: Some(render_chain(&err)),
                observed: Observed::head(err.head()),
                duration_ms,
            };
            return record_failure(ctx, target, failure, None).await;
        }
    };

    let page = match ctx.extractor.extract(&response.body) {
        Ok(page) => page,
        Err(err) => {
            let failure = Failure {
                code: "EXTRACTION".to_string(),
                kind: ErrorKind::Extraction,
                message: err.to_string(),
                stack: Some(format!("{:?}", err)),
                observed: Observed::response(&response),
                duration_ms,
            };
            return record_failure(ctx, target, failure, None).await;
        }
    };

    persist_success(ctx, target, &response, page, duration_ms).await
}

async fn persist_success(
    ctx: &TaskContext,
    target: &TargetRef,
    response: &FetchResponse,
    page: ExtractedPage,
    duration_ms: u64,
) -> TargetOutcome {
    let attempt = NewAttempt {
        url: target.url.clone(),
        method: "GET".to_string(),
        status_code: Some(response.status),
        duration_ms,
        bytes: Some(response.bytes()),
        request_headers: BTreeMap::new(),
        response_headers: Some(response.headers.clone()),
        timings: AttemptTimings { duration_ms },
        error: None,
        error_kind: None,
    };

    let attempt_id = match ctx.store.create_attempt(ctx.job_id, target.id, &attempt).await {
        Ok(id) => id,
        Err(err) => {
            let failure = storage_failure(&err, response, duration_ms);
            return record_failure(ctx, target, failure, None).await;
        }
    };

    let result = NewResult {
        url: target.url.clone(),
        content_type: response.content_type.clone(),
        charset: response.charset(),
        fingerprint: fingerprint(response.status, response.bytes(), &page.raw_text),
        raw_html: page.raw_html,
        raw_text: page.raw_text,
        structured: page.structured,
        metadata: ResultMetadata {
            status: response.status,
            final_url: response.final_url.clone(),
            request_id: attempt_id,
        },
    };

    if let Err(err) = ctx.store.create_result(ctx.job_id, target.id, &result).await {
        let failure = storage_failure(&err, response, duration_ms);
        return record_failure(ctx, target, failure, Some(attempt_id)).await;
    }

    // The result row is the success record; a stale last-seen stamp does not undo it
    let update = TargetUpdate {
        last_status: response.status,
        last_scraped_at: Utc::now(),
    };
    if let Err(err) = ctx.store.update_target(target.id, &update).await {
        warn!(job_id = %ctx.job_id, target_id = %target.id, "Failed to update target: {:#}", err);
    }

    ctx.metrics.record_outcome(true, response.bytes());
    debug!(job_id = %ctx.job_id, target_id = %target.id, url = %target.url, status = response.status, "Target scraped");

    TargetOutcome::succeeded(&target.url, response.status)
}

fn storage_failure(err: &anyhow::Error, response: &FetchResponse, duration_ms: u64) -> Failure {
    Failure {
        code: "STORAGE".to_string(),
        kind: ErrorKind::Storage,
        message: format!("{:#}", err),
        stack: Some(format!("{:?}", err)),
        observed: Observed::response(response),
        duration_ms,
    }
}

/// Record a target whose task died before settling.
///
/// The pool calls this after a join error, so nothing the task wrote is
/// known here.
pub async fn record_abort(ctx: &TaskContext, target: &TargetRef, reason: &str) -> TargetOutcome {
    let failure = Failure {
        code: "TASK_ABORTED".to_string(),
        kind: ErrorKind::Aborted,
        message: format!("task aborted: {}", reason),
        stack: None,
        observed: Observed::default(),
        duration_ms: 0,
    };
    record_failure(ctx, target, failure, None).await
}

/// Write the attempt (unless one already exists) and the error record
async fn record_failure(
    ctx: &TaskContext,
    target: &TargetRef,
    failure: Failure,
    existing_attempt: Option<Uuid>,
) -> TargetOutcome {
    warn!(
        job_id = %ctx.job_id,
        target_id = %target.id,
        url = %target.url,
        code = %failure.code,
        "Target failed: {}",
        failure.message
    );

    let Observed {
        status_code,
        bytes,
        headers,
    } = failure.observed;
    ctx.metrics.record_outcome(false, bytes.unwrap_or(0));

    let attempt_id = match existing_attempt {
        Some(id) => Some(id),
        None => {
            let attempt = NewAttempt {
                url: target.url.clone(),
                method: "GET".to_string(),
                status_code,
                duration_ms: failure.duration_ms,
                bytes,
                request_headers: BTreeMap::new(),
                response_headers: headers,
                timings: AttemptTimings {
                    duration_ms: failure.duration_ms,
                },
                error: Some(failure.message.clone()),
                error_kind: Some(failure.kind),
            };
            match ctx.store.create_attempt(ctx.job_id, target.id, &attempt).await {
                Ok(id) => Some(id),
                Err(err) => {
                    error!(job_id = %ctx.job_id, target_id = %target.id, "Failed to record failed attempt: {:#}", err);
                    None
                }
            }
        }
    };

    if let Some(request_id) = attempt_id {
        let record = NewError {
            request_id,
            code: failure.code.clone(),
            message: failure.message.clone(),
            details: ErrorDetails {
                url: target.url.clone(),
                duration_ms: failure.duration_ms,
                stack: failure.stack,
            },
        };
        if let Err(err) = ctx.store.create_error(ctx.job_id, target.id, &record).await {
            error!(job_id = %ctx.job_id, target_id = %target.id, "Failed to record error: {:#}", err);
        }
    }

    TargetOutcome::failed(&target.url, status_code, failure.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fetcher::{FetchError, HeadSlot, Transport};
    use crate::storage::{JobConfig, MemoryJobStore, NewJob};
    use async_trait::async_trait;

    struct FixedTransport(Result<&'static str, &'static str>);

    #[async_trait]
    impl Transport for FixedTransport {
        async fn get(&self, url: &str, _head: &HeadSlot) -> Result<FetchResponse, FetchError> {
            match self.0 {
                Ok(body) => Ok(FetchResponse {
                    status: 200,
                    final_url: url.to_string(),
                    content_type: Some("text/html; charset=utf-8".to_string()),
                    headers: BTreeMap::from([("content-type".to_string(), "text/html".to_string())]),
                    body: body.to_string(),
                    elapsed: Duration::ZERO,
                }),
                Err(code) => Err(FetchError::network(code, "connection refused")),
            }
        }
    }

    /// Answers 200 with headers, then loses the connection mid-body
    struct CutBodyTransport;

    #[async_trait]
    impl Transport for CutBodyTransport {
        async fn get(&self, url: &str, head: &HeadSlot) -> Result<FetchResponse, FetchError> {
            let _ = head.set(ResponseHead {
                status: 200,
                final_url: url.to_string(),
                content_type: Some("text/html".to_string()),
                headers: BTreeMap::from([("content-length".to_string(), "4096".to_string())]),
            });
            Err(FetchError::network("EBODY", "error decoding response body"))
        }
    }

    async fn setup(transport: impl Transport + 'static) -> (Arc<MemoryJobStore>, TaskContext, TargetRef) {
        let store = Arc::new(MemoryJobStore::new());
        let job_id = store
            .create_job(&NewJob {
                label: "task".to_string(),
                strategy: "http-basic".to_string(),
                seeds: vec!["https://a.test/".to_string()],
                config: JobConfig::default(),
                started_at: Utc::now(),
            })
            .await
            .unwrap();
        let target = store
            .create_targets(job_id, &["https://a.test/".to_string()])
            .await
            .unwrap()
            .remove(0);

        let ctx = TaskContext {
            job_id,
            store: store.clone(),
            fetcher: FetchClient::new(Arc::new(transport), Duration::from_secs(1)),
            extractor: Arc::new(HtmlExtractor::new().unwrap()),
            timeout: None,
            metrics: PoolMetrics::new(),
        };
        (store, ctx, target)
    }

    #[tokio::test]
    async fn test_success_writes_attempt_result_and_target() {
        let (store, ctx, target) = setup(FixedTransport(Ok("<title>A</title><body>hi</body>"))).await;

        let outcome = run_target(&ctx, &target).await;
        assert_eq!(outcome, TargetOutcome::succeeded("https://a.test/", 200));

        let attempts = store.attempts(ctx.job_id);
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].attempt.status_code, Some(200));
        assert!(attempts[0].attempt.error.is_none());

        let results = store.results(ctx.job_id);
        assert_eq!(results.len(), 1);
        let result = &results[0].result;
        assert_eq!(result.structured.title.as_deref(), Some("A"));
        assert_eq!(result.charset.as_deref(), Some("utf-8"));
        assert_eq!(result.metadata.request_id, attempts[0].id);
        assert_eq!(result.fingerprint, fingerprint(200, result.raw_html.len(), "hi"));

        assert!(store.errors(ctx.job_id).is_empty());
        assert_eq!(store.targets(ctx.job_id)[0].last_status, Some(200));
        assert_eq!(ctx.metrics.snapshot().successes, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_writes_attempt_and_error() {
        let (store, ctx, target) = setup(FixedTransport(Err("ECONNREFUSED"))).await;

        let outcome = run_target(&ctx, &target).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.status_code, None);
        assert_eq!(outcome.error.as_deref(), Some("connection refused"));

        let attempts = store.attempts(ctx.job_id);
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].attempt.error_kind, Some(ErrorKind::Network));
        assert_eq!(attempts[0].attempt.status_code, None);

        let errors = store.errors(ctx.job_id);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error.code, "ECONNREFUSED");
        assert_eq!(errors[0].error.request_id, attempts[0].id);
        assert_eq!(errors[0].error.details.url, "https://a.test/");

        assert!(store.results(ctx.job_id).is_empty());
        assert_eq!(store.targets(ctx.job_id)[0].last_status, None);
    }

    #[tokio::test]
    async fn test_extraction_failure_keeps_response_facts() {
        let (store, ctx, target) = setup(FixedTransport(Ok("\0\0binary"))).await;

        let outcome = run_target(&ctx, &target).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.status_code, Some(200));

        let attempts = store.attempts(ctx.job_id);
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].attempt.status_code, Some(200));
        assert_eq!(attempts[0].attempt.bytes, Some(8));
        assert_eq!(attempts[0].attempt.error_kind, Some(ErrorKind::Extraction));

        let errors = store.errors(ctx.job_id);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error.code, "EXTRACTION");
        assert!(store.results(ctx.job_id).is_empty());
    }

    #[tokio::test]
    async fn test_body_failure_keeps_received_status() {
        let (store, ctx, target) = setup(CutBodyTransport).await;

        let outcome = run_target(&ctx, &target).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.status_code, Some(200));
        assert_eq!(outcome.error.as_deref(), Some("error decoding response body"));

        let attempts = store.attempts(ctx.job_id);
        assert_eq!(attempts.len(), 1);
        let attempt = &attempts[0].attempt;
        assert_eq!(attempt.status_code, Some(200));
        assert_eq!(attempt.bytes, None);
        assert_eq!(
            attempt.response_headers.as_ref().and_then(|h| h.get("content-length")).map(String::as_str),
            Some("4096")
        );
        assert_eq!(attempt.error_kind, Some(ErrorKind::Network));

        let errors = store.errors(ctx.job_id);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error.code, "EBODY");
        assert_eq!(store.targets(ctx.job_id)[0].last_status, None);
    }

    #[tokio::test]
    async fn test_abort_writes_attempt_and_error() {
        let (store, ctx, target) = setup(FixedTransport(Ok("<title>A</title>"))).await;

        let outcome = record_abort(&ctx, &target, "task panicked").await;
        assert!(!outcome.ok);
        assert_eq!(outcome.error.as_deref(), Some("task aborted: task panicked"));

        let attempts = store.attempts(ctx.job_id);
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].attempt.error_kind, Some(ErrorKind::Aborted));

        let errors = store.errors(ctx.job_id);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error.code, "TASK_ABORTED");
        assert_eq!(errors[0].error.request_id, attempts[0].id);
        assert_eq!(ctx.metrics.snapshot().failures, 1);
    }
}
