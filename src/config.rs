//! Search configuration loading and validation.
//!
//! The search file is a flat list of `key,value` lines:
//!
//! ```text
//! start_year,2020
//! end_year,2023
//! search_terms,"large language models"
//! search_terms,"foundation model"
//! ```
//!
//! Every check here runs before the first request is issued.

use crate::error::{HarvestError, OptionExt, Result};
use std::path::Path;
use tracing::debug;

/// Lowest accepted sampling percentage
pub const MIN_SAMPLE_PERCENT: f64 = 0.01;

/// Highest accepted sampling percentage
pub const MAX_SAMPLE_PERCENT: f64 = 100.0;

/// Sampling percentage resolution: hundredths of a percent
const BASIS_SCALE: u64 = 10_000;

/// Validated sampling percentage in `[0.01, 100]`.
///
/// Stored as basis points of a percent so the sampling target can be computed
/// in integer arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplePercent {
    basis: u64,
}

impl SamplePercent {
    /// Full result set.
    pub const ALL: SamplePercent = SamplePercent { basis: BASIS_SCALE };

    /// Validate a percentage given on the command line.
    pub fn new(percent: f64) -> Result<Self> {
        if !percent.is_finite() || !(MIN_SAMPLE_PERCENT..=MAX_SAMPLE_PERCENT).contains(&percent) {
            return Err(HarvestError::Validation(format!(
                "Percentage must be between {} and {}, got {}",
                MIN_SAMPLE_PERCENT, MAX_SAMPLE_PERCENT, percent
            )));
        }
        // Range check above keeps this within 1..=10000
        let basis = (percent * 100.0).round() as u64;
        Ok(Self {
            basis: basis.clamp(1, BASIS_SCALE),
        })
    }

    /// The percentage as a float, rounded to hundredths.
    pub fn percent(&self) -> f64 {
        self.basis as f64 / 100.0
    }

    /// Whether the full result set is requested.
    pub fn is_all(&self) -> bool {
        self.basis == BASIS_SCALE
    }

    /// Number of records to keep out of `total`: `ceil(percent / 100 * total)`.
    ///
    /// Never exceeds `total`.
    pub fn target_for(&self, total: u64) -> u64 {
        let scaled = total as u128 * self.basis as u128;
        let target = scaled.div_ceil(BASIS_SCALE as u128);
        target.min(total as u128) as u64
    }
}

impl Default for SamplePercent {
    fn default() -> Self {
        Self::ALL
    }
}

/// One run's search configuration. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    pub start_year: i32,
    pub end_year: i32,
    pub search_terms: Vec<String>,
    pub sample_percent: SamplePercent,
}

impl SearchConfig {
    /// Load and validate a search file.
    pub fn from_file(path: &Path, sample_percent: SamplePercent) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarvestError::Config(format!("Cannot read search file {}: {}", path.display(), e))
        })?;
        Self::parse(&text, sample_percent)
    }

    /// Parse the `key,value` search file format.
    pub fn parse(text: &str, sample_percent: SamplePercent) -> Result<Self> {
        let mut start_year: Option<i32> = None;
        let mut end_year: Option<i32> = None;
        let mut search_terms = Vec::new();

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line.split_once(',').ok_or_else(|| {
                HarvestError::Config(format!("Line {}: expected `key,value`, got {:?}", line_no, line))
            })?;
            let key = key.trim();
            let value = unquote(value.trim());

            match key {
                "start_year" => set_year(&mut start_year, key, value, line_no)?,
                "end_year" => set_year(&mut end_year, key, value, line_no)?,
                "search_terms" => {
                    let term = sanitize_term(value);
                    if term.is_empty() {
                        return Err(HarvestError::Config(format!(
                            "Line {}: search_terms value is empty",
                            line_no
                        )));
                    }
                    search_terms.push(term);
                }
                other => {
                    return Err(HarvestError::Config(format!(
                        "Line {}: unknown key {:?}",
                        line_no, other
                    )));
                }
            }
        }

        let start_year = start_year.ok_or_config("Missing start_year")?;
        let end_year = end_year.ok_or_config("Missing end_year")?;

        if search_terms.is_empty() {
            return Err(HarvestError::Config("Missing search_terms".to_string()));
        }

        if start_year > end_year {
            return Err(HarvestError::Config(format!(
                "Invalid date range: start_year {} is after end_year {}",
                start_year, end_year
            )));
        }

        debug!(start_year, end_year, terms = ?search_terms, "Loaded search configuration");

        Ok(Self {
            start_year,
            end_year,
            search_terms,
            sample_percent,
        })
    }
}

fn set_year(slot: &mut Option<i32>, key: &str, value: &str, line_no: usize) -> Result<()> {
    if slot.is_some() {
        return Err(HarvestError::Config(format!("Line {}: duplicate key {:?}", line_no, key)));
    }
    let year = value.parse::<i32>().map_err(|_| {
        HarvestError::Config(format!("Line {}: {} must be an integer year, got {:?}", line_no, key, value))
    })?;
    *slot = Some(year);
    Ok(())
}

/// Strip one pair of surrounding double quotes.
fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// `,` separates filters and `|` separates OR-ed values in the filter syntax.
fn sanitize_term(value: &str) -> String {
    value
        .replace([',', '|'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
