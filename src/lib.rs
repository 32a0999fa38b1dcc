//! # openalex-harvest
//!
//! Harvests OpenAlex works matching a year range and title/abstract search terms into
//! batched CSV files.
//!
//! ## Modules
//!
//! - [`config`] - Search file loading and sampling percentage
//! - [`openalex`] - OpenAlex `/works` client, cursor pager and random sampler
//! - [`flatten`] - Nested work JSON to flat CSV rows
//! - [`writer`] - Batched CSV output
//! - [`pipeline`] - The fetch/flatten/write loop
//! - [`error`] - Custom error types
//!
//! ## Usage
//!
//! ```rust,no_run
//! use openalex_harvest::config::{SamplePercent, SearchConfig};
//! use openalex_harvest::openalex::{ClientConfig, OpenAlexClient};
//! use openalex_harvest::pipeline::{self, RunOptions};
//! use std::path::Path;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SearchConfig::from_file(Path::new("search.txt"), SamplePercent::new(10.0)?)?;
//!     let client = OpenAlexClient::new(ClientConfig::default())?;
//!     let summary = pipeline::run(&config, &RunOptions::new("results"), &client).await?;
//!     println!("Wrote {} rows", summary.written);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod flatten;
pub mod openalex;
pub mod pipeline;
pub mod writer;

pub use error::{HarvestError, Result};
