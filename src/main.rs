//! openalex-harvest - OpenAlex works to batched CSV
//!
//! ## Usage
//!
//! ```bash
//! openalex-harvest -f search.txt -o results -p 25
//! openalex-harvest -f search.txt -m random -n 500
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use openalex_harvest::config::SamplePercent;
use openalex_harvest::openalex::{ClientConfig, OPENALEX_API_BASE};
use openalex_harvest::pipeline::{self, FetchMode, RunOptions};
use openalex_harvest::writer::DEFAULT_BATCH_SIZE;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

// ============================================================================
// CLI Definition
// ============================================================================

/// Fetch and save OpenAlex works matching a search file.
#[derive(Parser)]
#[command(name = "openalex-harvest")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the search conditions file
    #[arg(short, long)]
    file: PathBuf,

    /// Output folder (default: search file path without its extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Percentage of matching works to save (0.01 - 100)
    #[arg(short, long, default_value_t = 100.0)]
    percentage: f64,

    /// Fetch mode: every matching work, or random samples
    #[arg(short, long, default_value = "all", value_parser = ["all", "random"])]
    mode: String,

    /// Maximum number of works to fetch (required for random mode)
    #[arg(short = 'n', long, required_if_eq("mode", "random"))]
    max_papers: Option<u64>,

    /// Rows per output file
    #[arg(short, long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Email for the OpenAlex polite pool
    #[arg(long)]
    mailto: Option<String>,

    /// OpenAlex API base URL
    #[arg(long, default_value = OPENALEX_API_BASE)]
    base_url: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    // Everything below the network line is validated first
    let sample_percent = SamplePercent::new(cli.percentage).context("Invalid --percentage")?;
    let mode = FetchMode::parse(&cli.mode, cli.max_papers).context("Invalid --mode")?;

    let output_dir = cli.output.unwrap_or_else(|| default_output_dir(&cli.file));
    let options = RunOptions {
        output_dir,
        batch_size: cli.batch_size,
        mode,
    };

    let client_config = ClientConfig {
        base_url: cli.base_url,
        mailto: cli.mailto,
        ..Default::default()
    };

    let summary = pipeline::run_from_file(&cli.file, sample_percent, &options, client_config)
        .await
        .with_context(|| format!("Harvest of {} failed", cli.file.display()))?;

    if let Some(total) = summary.total_count {
        info!(total, target = ?summary.target, "Provider total");
    }
    println!(
        "Successfully saved {} results in {} file(s) to {} ({} skipped)",
        summary.written,
        summary.files.len(),
        options.output_dir.display(),
        summary.skipped
    );
    Ok(())
}

/// `searches/cats.txt` -> `searches/cats`
fn default_output_dir(file: &Path) -> PathBuf {
    match file.extension() {
        Some(_) => file.with_extension(""),
        None => PathBuf::from(format!("{}_results", file.display())),
    }
}
