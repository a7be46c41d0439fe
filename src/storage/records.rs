use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::pipeline::extractor::StructuredContent;

/// Persisted lifecycle of a job. Mixed batches end as FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied job configuration.
///
/// Recognised keys:
/// - `timeout_ms`: per-request timeout for every target of the job.
///
/// Anything else is kept verbatim in `extra` and persisted with the job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Aggregate statistics written once by the finalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub total_urls_requested: usize,
    pub total_urls_unique: usize,
    pub success: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

/// Row data for a new job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub label: String,
    pub strategy: String,
    pub seeds: Vec<String>,
    pub config: JobConfig,
    pub started_at: DateTime<Utc>,
}

/// Terminal update of a job row
#[derive(Debug, Clone, PartialEq)]
pub struct JobCompletion {
    pub status: JobStatus,
    pub stats: JobStats,
    pub last_run_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetMetadata {
    pub index: usize,
}

/// Identity handed back by target creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRef {
    pub id: Uuid,
    pub url: String,
}

/// Last-seen state of a target after a successful fetch
#[derive(Debug, Clone)]
pub struct TargetUpdate {
    pub last_status: u16,
    pub last_scraped_at: DateTime<Utc>,
}

/// Failure class recorded on an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Network,
    Timeout,
    Extraction,
    Storage,
    /// The task died before it could classify its own failure
    Aborted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "NETWORK",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Extraction => "EXTRACTION",
            ErrorKind::Storage => "STORAGE",
            ErrorKind::Aborted => "ABORTED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptTimings {
    pub duration_ms: u64,
}

/// One fetch try against a target
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub url: String,
    pub method: String,
    pub status_code: Option<u16>,
    pub duration_ms: u64,
    pub bytes: Option<usize>,
    pub request_headers: BTreeMap<String, String>,
    pub response_headers: Option<BTreeMap<String, String>>,
    pub timings: AttemptTimings,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub status: u16,
    pub final_url: String,
    pub request_id: Uuid,
}

/// Successful outcome of a target
#[derive(Debug, Clone)]
pub struct NewResult {
    pub url: String,
    pub content_type: Option<String>,
    pub charset: Option<String>,
    pub raw_html: String,
    pub raw_text: String,
    pub structured: StructuredContent,
    pub metadata: ResultMetadata,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    pub url: String,
    pub duration_ms: u64,
    pub stack: Option<String>,
}

/// Classified failure of a target
#[derive(Debug, Clone)]
pub struct NewError {
    pub request_id: Uuid,
    pub code: String,
    pub message: String,
    pub details: ErrorDetails,
}
