pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to the per-user config)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape a batch of URLs and print the job summary as JSON
    Scrape {
        /// URLs to scrape
        urls: Vec<String>,

        /// Read additional URLs from a file, one per line
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Job label
        #[arg(short, long)]
        label: Option<String>,

        /// Job configuration as a JSON object, e.g. '{"timeout_ms": 5000}'
        #[arg(long)]
        job_config: Option<String>,

        /// Override the storage backend (postgresql, memory)
        #[arg(long)]
        storage: Option<String>,
    },

    /// Show the active configuration
    Config {
        /// Write the default configuration file
        #[arg(long)]
        init: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Scrape {
            urls,
            file,
            label,
            job_config,
            storage,
        } => {
            let args = commands::ScrapeArgs {
                urls,
                file,
                label,
                job_config,
                storage,
            };
            commands::scrape(cli.config.as_deref(), args).await
        }
        Commands::Config { init } => {
            if init {
                info!("Writing default configuration");
                commands::init_config(cli.config.as_deref())
            } else {
                commands::show_config(cli.config.as_deref())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_scrape_args() {
        let cli = Cli::try_parse_from([
            "batch-scraper",
            "scrape",
            "https://a.test/",
            "https://b.test/",
            "--label",
            "nightly",
            "--job-config",
            r#"{"timeout_ms": 500}"#,
            "-v",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Scrape { urls, label, job_config, file, storage } => {
                assert_eq!(urls, vec!["https://a.test/", "https://b.test/"]);
                assert_eq!(label.as_deref(), Some("nightly"));
                assert_eq!(job_config.as_deref(), Some(r#"{"timeout_ms": 500}"#));
                assert!(file.is_none());
                assert!(storage.is_none());
            }
            _ => panic!("expected scrape command"),
        }
    }
}
