//! Fetch → flatten → batch-write loop.

use crate::config::{SamplePercent, SearchConfig};
use crate::error::{HarvestError, Result};
use crate::flatten::flatten_value;
use crate::openalex::{ClientConfig, CursorPager, OpenAlexClient, RandomSampler};
use crate::writer::{BatchWriter, DEFAULT_BATCH_SIZE};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// How works are selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// Every matching work, cut to the sampling percentage
    #[default]
    All,
    /// Random samples until `max_papers` distinct works are collected
    Random { max_papers: u64 },
}

impl FetchMode {
    /// Parse `all` / `random`; random mode needs a paper limit.
    pub fn parse(mode: &str, max_papers: Option<u64>) -> Result<Self> {
        match mode.to_lowercase().as_str() {
            "all" => Ok(Self::All),
            "random" => match max_papers {
                Some(max_papers) if max_papers > 0 => Ok(Self::Random { max_papers }),
                Some(_) => Err(HarvestError::Validation("max_papers must be at least 1".to_string())),
                None => Err(HarvestError::Config(
                    "max_papers must be specified when using random mode".to_string(),
                )),
            },
            other => Err(HarvestError::Config(format!(
                "Invalid mode: {}. Must be either 'all' or 'random'",
                other
            ))),
        }
    }
}

/// Per-run output settings
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub output_dir: PathBuf,
    pub batch_size: usize,
    pub mode: FetchMode,
}

impl RunOptions {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            mode: FetchMode::All,
        }
    }
}

/// Counts reported at the end of a run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Provider's total matching count (cursor mode only)
    pub total_count: Option<u64>,
    /// Records the run aimed for
    pub target: Option<u64>,
    /// Raw records received
    pub fetched: u64,
    /// Rows written across all batch files
    pub written: u64,
    /// Records skipped for data-quality reasons
    pub skipped: u64,
    /// Batch files, in write order
    pub files: Vec<PathBuf>,
}

enum Source<'a> {
    Cursor(CursorPager<'a>),
    Random(RandomSampler<'a>),
}

impl Source<'_> {
    async fn next_page(&mut self) -> Result<Option<Vec<Value>>> {
        match self {
            Source::Cursor(pager) => pager.next_page().await,
            Source::Random(sampler) => sampler.next_page().await,
        }
    }
}

/// Load the search file, then build the client and run.
///
/// A bad search file fails here, before the client exists and before the
/// output directory is created.
pub async fn run_from_file(
    search_file: &Path,
    sample_percent: SamplePercent,
    options: &RunOptions,
    client_config: ClientConfig,
) -> Result<RunSummary> {
    let config = SearchConfig::from_file(search_file, sample_percent)?;
    let client = OpenAlexClient::new(client_config)?;
    run(&config, options, &client).await
}

/// Run one harvest: walk the provider, flatten every record and write batch files.
///
/// An API failure aborts the run; batches already flushed stay on disk.
pub async fn run(config: &SearchConfig, options: &RunOptions, client: &OpenAlexClient) -> Result<RunSummary> {
    let mut writer = BatchWriter::new(&options.output_dir, options.batch_size)?;

    let mut source = match options.mode {
        FetchMode::All => Source::Cursor(CursorPager::new(client, config)),
        FetchMode::Random { max_papers } => {
            Source::Random(RandomSampler::new(client, config, max_papers))
        }
    };

    info!(
        start_year = config.start_year,
        end_year = config.end_year,
        terms = ?config.search_terms,
        mode = ?options.mode,
        output = %options.output_dir.display(),
        "Starting harvest"
    );

    let mut summary = RunSummary::default();

    while let Some(records) = source.next_page().await? {
        for record in &records {
            summary.fetched += 1;
            match flatten_value(record) {
                Ok(row) => writer.push(row)?,
                Err(reason) => {
                    summary.skipped += 1;
                    let id = record.get("id").and_then(Value::as_str).unwrap_or("<none>");
                    warn!(id, reason = %reason, "Skipping record");
                }
            }
        }
        info!(
            fetched = summary.fetched,
            skipped = summary.skipped,
            buffered = writer.buffered(),
            "Total results fetched so far"
        );
    }

    match &source {
        Source::Cursor(pager) => {
            summary.total_count = pager.total_count();
            summary.target = pager.target();
        }
        Source::Random(_) => {
            if let FetchMode::Random { max_papers } = options.mode {
                summary.target = Some(max_papers);
            }
        }
    }

    let written = writer.finish()?;
    summary.written = written.rows;
    summary.files = written.files;

    info!(
        written = summary.written,
        skipped = summary.skipped,
        files = summary.files.len(),
        "Harvest complete"
    );

    Ok(summary)
}
