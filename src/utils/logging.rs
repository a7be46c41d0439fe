use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Directives applied on top of `RUST_LOG`
pub fn filter_directives(verbose: bool) -> [&'static str; 2] {
    let own = if verbose { "batch_scraper=debug" } else { "batch_scraper=info" };
    [own, "warn"]
}

fn build_filter(verbose: bool) -> Result<EnvFilter> {
    let mut filter = EnvFilter::from_default_env();
    for directive in filter_directives(verbose) {
        let directive: Directive = directive
            .parse()
            .context(format!("Invalid log directive: {}", directive))?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

/// Open `path` for appending, creating it and its parent directory if needed
fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .context(format!("Failed to create log directory: {}", parent.display()))?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context(format!("Failed to open log file: {}", path.display()))
}

/// Install the global subscriber.
///
/// Human-readable events go to stderr so stdout stays free for the submission
/// JSON. With `log_file`, the same events are also appended to that file
/// without ANSI colors.
pub fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let filter = build_filter(verbose)?;

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::CLOSE);

    let file_layer = match log_file {
        Some(path) => {
            let file = open_log_file(&path)?;
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Logging was already initialized")?;

    Ok(())
}
