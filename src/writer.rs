//! Batched CSV output.
//!
//! Rows are buffered up to `batch_size` and each full buffer becomes its own file,
//! `papers_batch_1.csv`, `papers_batch_2.csv`, ... Every file carries the header row and
//! is written under a temporary name first, so a file that exists under its final name
//! is complete. Batch files left in the directory by an earlier run are removed when
//! the writer is created, so the directory only ever holds this run's batches.

use crate::error::{HarvestError, Result};
use crate::flatten::FlatRow;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default rows per output file
pub const DEFAULT_BATCH_SIZE: usize = 1000;

const BATCH_PREFIX: &str = "papers_batch_";

/// Path of the `index`-th (1-based) batch file in `dir`.
pub fn batch_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("{}{}.csv", BATCH_PREFIX, index))
}

/// `papers_batch_<k>.csv` or its `.partial` leftover.
fn is_batch_file(name: &str) -> bool {
    let Some(rest) = name.strip_prefix(BATCH_PREFIX) else {
        return false;
    };
    let index = rest
        .strip_suffix(".csv.partial")
        .or_else(|| rest.strip_suffix(".csv"));
    matches!(index, Some(k) if !k.is_empty() && k.bytes().all(|b| b.is_ascii_digit()))
}

/// Delete batch files from a previous run in `dir`.
fn remove_stale_batches(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_str().is_some_and(is_batch_file) && entry.file_type()?.is_file() {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// What a finished writer put on disk
#[derive(Debug, Clone, Default)]
pub struct WriteSummary {
    pub files: Vec<PathBuf>,
    pub rows: u64,
}

/// Buffers flat rows and writes them as numbered CSV batch files.
pub struct BatchWriter {
    dir: PathBuf,
    batch_size: usize,
    buffer: Vec<FlatRow>,
    files: Vec<PathBuf>,
    rows: u64,
}

impl BatchWriter {
    /// Create the output directory, clear old batch files and start an empty buffer.
    pub fn new(dir: impl Into<PathBuf>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(HarvestError::Validation("batch size must be at least 1".to_string()));
        }
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let removed = remove_stale_batches(&dir)?;
        if removed > 0 {
            warn!(removed, dir = %dir.display(), "Removed batch files from a previous run");
        }

        Ok(Self {
            dir,
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            files: Vec::new(),
            rows: 0,
        })
    }

    /// Rows waiting for the next flush
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Files written so far
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Append a row, flushing when the batch is full.
    pub fn push(&mut self, row: FlatRow) -> Result<()> {
        self.buffer.push(row);
        if self.buffer.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Write buffered rows to the next batch file. No-op on an empty buffer.
    pub fn flush(&mut self) -> Result<Option<PathBuf>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let path = batch_path(&self.dir, self.files.len() + 1);
        let partial = path.with_extension("csv.partial");

        {
            let mut wtr = csv::WriterBuilder::new()
                .has_headers(true)
                .from_path(&partial)?;
            for row in &self.buffer {
                wtr.serialize(row)?;
            }
            wtr.flush()?;
        }
        std::fs::rename(&partial, &path)?;

        let count = self.buffer.len();
        self.rows += count as u64;
        self.buffer.clear();
        self.files.push(path.clone());

        info!(batch = self.files.len(), rows = count, path = %path.display(), "Saved batch");
        Ok(Some(path))
    }

    /// Flush the remainder and report what was written.
    pub fn finish(mut self) -> Result<WriteSummary> {
        self.flush()?;
        debug!(files = self.files.len(), rows = self.rows, "Writer finished");
        Ok(WriteSummary {
            files: self.files,
            rows: self.rows,
        })
    }
}
