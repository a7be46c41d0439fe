use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use crate::cli::config::ScraperConfig;
use crate::pipeline::{ScrapeController, ScrapeRequest};
use crate::storage::JobStoreFactory;

/// Arguments of the `scrape` command
#[derive(Debug, Default)]
pub struct ScrapeArgs {
    pub urls: Vec<String>,
    pub file: Option<PathBuf>,
    pub label: Option<String>,
    pub job_config: Option<String>,
    pub storage: Option<String>,
}

/// Submit one batch and print the response body
pub async fn scrape(config_path: Option<&Path>, args: ScrapeArgs) -> Result<()> {
    let mut config = ScraperConfig::load(config_path)?;
    if let Some(storage) = &args.storage {
        config.storage.storage_type = storage.clone();
    }

    let request = build_request(args)?;
    debug!("Submitting {} URLs", request.urls.len());

    let store = JobStoreFactory::create(&config.storage).await?;
    let controller = ScrapeController::new(&config, store.clone())?;

    let outcome = controller.submit(request).await;
    store.close().await;

    match outcome {
        Ok(response) => {
            info!("Job {} finished with status {:?}", response.job_id, response.status);
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Err(e) => {
            error!("Submission rejected: {}", e);
            println!("{}", serde_json::to_string_pretty(&e.to_response())?);
            anyhow::bail!("Submission failed with status {}", e.http_status())
        }
    }
}

/// Assemble a request from positional URLs, an optional URL file and flags
fn build_request(args: ScrapeArgs) -> Result<ScrapeRequest> {
    let mut urls = args.urls;
    if let Some(path) = &args.file {
        urls.extend(read_url_file(path)?);
    }

    let config = match &args.job_config {
        Some(raw) => Some(
            serde_json::from_str::<Map<String, Value>>(raw)
                .context("--job-config must be a JSON object")?,
        ),
        None => None,
    };

    Ok(ScrapeRequest {
        urls,
        label: args.label,
        config,
    })
}

/// One URL per line; blank lines and `#` comments are skipped
fn read_url_file(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path)
        .context(format!("Failed to read URL file: {}", path.display()))?;

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Show the active configuration
pub fn show_config(config_path: Option<&Path>) -> Result<()> {
    let config = ScraperConfig::load(config_path)?;
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(ScraperConfig::default_path);

    println!("Configuration file: {}", path.display());
    println!("{}", serde_yaml::to_string(&config)?);

    Ok(())
}

/// Write the default configuration, overwriting any existing file
pub fn init_config(config_path: Option<&Path>) -> Result<()> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(ScraperConfig::default_path);

    ScraperConfig::default().save_to_file(&path)?;
    println!("Wrote default configuration to {}", path.display());

    Ok(())
}
