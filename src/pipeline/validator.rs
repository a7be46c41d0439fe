use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use url::Url;

use crate::storage::JobConfig;

pub const MIN_URLS: usize = 1;
pub const MAX_URLS: usize = 50;
pub const MAX_LABEL_CHARS: usize = 255;
pub const MAX_TIMEOUT_MS: u64 = 60_000;

/// Incoming batch request, as submitted
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapeRequest {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub config: Option<Map<String, Value>>,
}

/// A request that passed validation. `urls` is deduplicated.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub urls: Vec<String>,
    pub requested_count: usize,
    pub label: Option<String>,
    pub config: JobConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Every problem found in a request, not just the first
#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid request: {}", join_issues(.issues))]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("; ")
}

/// Validate a request and dedupe its URLs, keeping first-occurrence order.
pub fn validate(request: &ScrapeRequest) -> Result<ValidatedRequest, ValidationError> {
    let mut issues = Vec::new();

    if request.urls.len() < MIN_URLS {
        issues.push(ValidationIssue::new(
            "urls",
            format!("must contain at least {} URL", MIN_URLS),
        ));
    }
    if request.urls.len() > MAX_URLS {
        issues.push(ValidationIssue::new(
            "urls",
            format!("must contain at most {} URLs, got {}", MAX_URLS, request.urls.len()),
        ));
    }

    for (i, raw) in request.urls.iter().enumerate() {
        if let Err(e) = Url::parse(raw) {
            issues.push(ValidationIssue::new(
                format!("urls.{}", i),
                format!("invalid URL '{}': {}", raw, e),
            ));
        }
    }

    if let Some(label) = &request.label {
        let len = label.chars().count();
        if len > MAX_LABEL_CHARS {
            issues.push(ValidationIssue::new(
                "label",
                format!("must be at most {} characters, got {}", MAX_LABEL_CHARS, len),
            ));
        }
    }

    let config = parse_config(request.config.as_ref(), &mut issues);

    if !issues.is_empty() {
        return Err(ValidationError { issues });
    }

    Ok(ValidatedRequest {
        urls: dedup_preserving_order(&request.urls),
        requested_count: request.urls.len(),
        label: request.label.clone(),
        config,
    })
}

/// Stable dedup: the first occurrence of each URL wins its position
pub fn dedup_preserving_order(urls: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(urls.len());
    urls.iter()
        .filter(|url| seen.insert(url.as_str()))
        .cloned()
        .collect()
}

fn parse_config(raw: Option<&Map<String, Value>>, issues: &mut Vec<ValidationIssue>) -> JobConfig {
    let mut extra = raw.cloned().unwrap_or_default();

    let timeout_ms = match extra.remove("timeout_ms") {
        None | Some(Value::Null) => None,
        Some(value) => match value.as_u64() {
            Some(ms) if (1..=MAX_TIMEOUT_MS).contains(&ms) => Some(ms),
            _ => {
                issues.push(ValidationIssue::new(
                    "config.timeout_ms",
                    format!("must be an integer between 1 and {}", MAX_TIMEOUT_MS),
                ));
                None
            }
        },
    };

    JobConfig { timeout_ms, extra }
}
