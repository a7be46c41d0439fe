use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::finalizer::CallerStatus;
use super::task::TargetOutcome;
use super::validator::{ValidationError, ValidationIssue};

/// Body returned for an accepted batch, whatever its per-URL outcomes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResponse {
    pub job_id: Uuid,
    pub status: CallerStatus,
    pub results: Vec<TargetOutcome>,
}

/// Body returned when a request is rejected or orchestration breaks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issues: Option<Vec<ValidationIssue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Request-level failures of a submission
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Anything outside the per-target loop: job or target creation, finalization
    #[error("orchestration failed: {0:#}")]
    Orchestration(anyhow::Error),
}

impl SubmitError {
    pub fn http_status(&self) -> u16 {
        match self {
            SubmitError::Validation(_) => 400,
            SubmitError::Orchestration(_) => 500,
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        match self {
            SubmitError::Validation(err) => ErrorResponse {
                error: "Invalid body".to_string(),
                issues: Some(err.issues.clone()),
                message: None,
            },
            SubmitError::Orchestration(err) => ErrorResponse {
                error: "Internal server error".to_string(),
                issues: None,
                message: Some(format!("{:#}", err)),
            },
        }
    }
}
