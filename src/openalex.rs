//! OpenAlex API Client
//!
//! Walks the `/works` collection for one search configuration.
//!
//! API Best Practices (per OpenAlex docs):
//! - Use `mailto:email` parameter for polite pool (10 req/s vs 1 req/s)
//! - Use `per-page=200` for maximum results per page
//! - Use `cursor=*` paging; basic paging stops at 10,000 results
//! - Implement exponential backoff for retries

use crate::config::{SamplePercent, SearchConfig};
use crate::error::{HarvestError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// OpenAlex API base URL
pub const OPENALEX_API_BASE: &str = "https://api.openalex.org";

/// Maximum results per page (OpenAlex limit)
pub const MAX_PER_PAGE: usize = 200;

/// Cursor that starts a cursor-paged walk
pub const START_CURSOR: &str = "*";

/// Pause between consecutive requests
const REQUEST_DELAY: Duration = Duration::from_millis(50);

/// Seeds for random samples are drawn from `0..SEED_SPACE`
pub const SEED_SPACE: u64 = 100_000;

/// Random samples in a row that may add nothing new before sampling stops
const MAX_STALE_SAMPLES: u32 = 5;

/// Longest wait between two retries
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Longest error body kept in an `Api` error
const MAX_ERROR_BODY: usize = 200;

/// HTTP client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API root, `/works` is appended
    pub base_url: String,
    /// Email for the polite pool
    pub mailto: Option<String>,
    /// Results per request, at most [`MAX_PER_PAGE`]
    pub per_page: usize,
    /// Per-request timeout
    pub timeout: Duration,
    /// Retries for 429, 5xx and transport failures
    pub max_retries: u32,
    /// First retry delay, doubled on every retry
    pub retry_backoff: Duration,
    /// Pause between consecutive page requests
    pub request_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: OPENALEX_API_BASE.to_string(),
            mailto: None,
            per_page: MAX_PER_PAGE,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            request_delay: REQUEST_DELAY,
        }
    }
}

impl ClientConfig {
    /// Configuration pointed at a mock server, with no waiting between requests.
    pub fn for_testing(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(1),
            request_delay: Duration::ZERO,
            ..Default::default()
        }
    }
}

/// One page of the `/works` response.
#[derive(Debug, Deserialize)]
pub struct WorksPage {
    pub meta: PageMeta,
    #[serde(default)]
    pub results: Vec<Value>,
}

/// Pagination metadata of a `/works` response.
#[derive(Debug, Deserialize)]
pub struct PageMeta {
    /// Total matching works
    pub count: u64,
    /// Cursor for the next page; absent or null on the last page
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// OpenAlex `/works` client. One instance is built per run and passed explicitly.
pub struct OpenAlexClient {
    client: Client,
    works_url: Url,
    config: ClientConfig,
}

impl OpenAlexClient {
    /// Create a new client
    pub fn new(config: ClientConfig) -> Result<Self> {
        let works_url = Url::parse(&format!("{}/works", config.base_url.trim_end_matches('/')))
            .map_err(|e| HarvestError::Config(format!("Invalid base URL {:?}: {}", config.base_url, e)))?;

        if config.per_page == 0 || config.per_page > MAX_PER_PAGE {
            return Err(HarvestError::Validation(format!(
                "per_page must be between 1 and {}, got {}",
                MAX_PER_PAGE, config.per_page
            )));
        }

        let user_agent = match &config.mailto {
            Some(email) => format!("openalex-harvest/{} (mailto:{})", env!("CARGO_PKG_VERSION"), email),
            None => format!("openalex-harvest/{}", env!("CARGO_PKG_VERSION")),
        };

        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| HarvestError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            works_url,
            config,
        })
    }

    /// Fetch one cursor page.
    pub async fn fetch_page(&self, filter: &str, cursor: &str) -> Result<WorksPage> {
        let params = vec![
            ("filter", filter.to_string()),
            ("per-page", self.config.per_page.to_string()),
            ("cursor", cursor.to_string()),
        ];
        self.get_works(params, cursor).await
    }

    /// Fetch one random sample of `sample` works drawn with `seed`.
    pub async fn fetch_sample(&self, filter: &str, sample: usize, seed: u64) -> Result<WorksPage> {
        let params = vec![
            ("filter", filter.to_string()),
            ("per-page", sample.to_string()),
            ("sample", sample.to_string()),
            ("seed", seed.to_string()),
        ];
        self.get_works(params, &format!("seed:{}", seed)).await
    }

    /// GET `/works` with bounded exponential backoff on transient failures.
    async fn get_works(&self, mut params: Vec<(&str, String)>, position: &str) -> Result<WorksPage> {
        if let Some(email) = &self.config.mailto {
            params.push(("mailto", email.clone()));
        }

        let mut retries = 0;

        loop {
            debug!(url = %self.works_url, position, params = ?params, "Requesting OpenAlex works");

            let response = match self.client.get(self.works_url.clone()).query(&params).send().await {
                Ok(response) => response,
                Err(e) => {
                    if is_transient(&e) && retries < self.config.max_retries {
                        self.backoff(retries, position, &e.to_string()).await;
                        retries += 1;
                        continue;
                    }
                    return Err(HarvestError::Request {
                        cursor: position.to_string(),
                        source: e,
                    });
                }
            };

            let status = response.status();

            if status.is_success() {
                match response.text().await {
                    Ok(body) => return parse_page(&body, position),
                    Err(e) if retries < self.config.max_retries => {
                        self.backoff(retries, position, &e.to_string()).await;
                        retries += 1;
                        continue;
                    }
                    Err(e) => {
                        return Err(HarvestError::Request {
                            cursor: position.to_string(),
                            source: e,
                        });
                    }
                }
            }

            let transient = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if transient && retries < self.config.max_retries {
                self.backoff(retries, position, status.as_str()).await;
                retries += 1;
                continue;
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(HarvestError::RateLimited {
                    cursor: position.to_string(),
                    attempts: retries + 1,
                });
            }

            let body = response.text().await.unwrap_or_default();
            return Err(HarvestError::Api {
                code: status.as_u16(),
                message: format!(
                    "OpenAlex API error: {} {}",
                    status,
                    body.chars().take(MAX_ERROR_BODY).collect::<String>()
                )
                .trim()
                .to_string(),
                cursor: position.to_string(),
            });
        }
    }

    async fn backoff(&self, retries: u32, position: &str, reason: &str) {
        let wait = backoff_delay(self.config.retry_backoff, retries);
        warn!(
            retries,
            position,
            reason,
            backoff_ms = wait.as_millis() as u64,
            "Transient OpenAlex failure, backing off"
        );
        tokio::time::sleep(wait).await;
    }
}

/// Connect failures, timeouts and broken bodies are worth another attempt.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode()
}

/// `base * 2^retries`, capped at [`MAX_BACKOFF`].
fn backoff_delay(base: Duration, retries: u32) -> Duration {
    2u32.checked_pow(retries)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(MAX_BACKOFF, |wait| wait.min(MAX_BACKOFF))
}

/// Parse an OpenAlex `/works` response body
fn parse_page(body: &str, position: &str) -> Result<WorksPage> {
    serde_json::from_str(body).map_err(|e| {
        HarvestError::Parse(format!("Malformed OpenAlex response at cursor {:?}: {}", position, e))
    })
}

/// Build the `filter` expression for a search configuration.
///
/// Search terms are OR-ed within `title_and_abstract.search`; the year range is inclusive.
pub fn build_filter(config: &SearchConfig) -> String {
    format!(
        "title_and_abstract.search:{},publication_year:{}-{}",
        config.search_terms.join("|"),
        config.start_year,
        config.end_year
    )
}

/// Lazy, finite, non-restartable walk over every matching work.
///
/// The first response's `meta.count` fixes the sampling target; the walk stops on an
/// empty page, a missing cursor, or once the target has been yielded.
pub struct CursorPager<'a> {
    client: &'a OpenAlexClient,
    filter: String,
    sample: SamplePercent,
    cursor: Option<String>,
    total_count: Option<u64>,
    target: Option<u64>,
    yielded: u64,
    pages: u64,
}

impl<'a> CursorPager<'a> {
    pub fn new(client: &'a OpenAlexClient, config: &SearchConfig) -> Self {
        Self {
            client,
            filter: build_filter(config),
            sample: config.sample_percent,
            cursor: Some(START_CURSOR.to_string()),
            total_count: None,
            target: None,
            yielded: 0,
            pages: 0,
        }
    }

    /// Total matching works, known after the first page
    pub fn total_count(&self) -> Option<u64> {
        self.total_count
    }

    /// Number of works to yield, known after the first page
    pub fn target(&self) -> Option<u64> {
        self.target
    }

    /// Fetch the next page of raw works, or `None` once the walk is over.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Value>>> {
        let Some(cursor) = self.cursor.take() else {
            return Ok(None);
        };

        if self.pages > 0 && !self.client.config.request_delay.is_zero() {
            tokio::time::sleep(self.client.config.request_delay).await;
        }

        info!(cursor = %cursor, "Fetching results");
        let page = self.client.fetch_page(&self.filter, &cursor).await?;
        self.pages += 1;

        if self.total_count.is_none() {
            let total = page.meta.count;
            let target = self.sample.target_for(total);
            info!(
                total,
                target,
                percent = self.sample.percent(),
                "Total count according to API"
            );
            self.total_count = Some(total);
            self.target = Some(target);
        }
        let target = self.target.unwrap_or(u64::MAX);

        let mut results = page.results;
        let remaining = target.saturating_sub(self.yielded);
        if results.len() as u64 > remaining {
            results.truncate(remaining as usize);
        }

        if results.is_empty() {
            info!(yielded = self.yielded, "No more results to fetch");
            return Ok(None);
        }

        self.yielded += results.len() as u64;

        if self.yielded < target {
            self.cursor = page.meta.next_cursor.filter(|c| !c.is_empty());
        } else {
            info!(target, "Reached sampling target");
        }

        debug!(
            page = self.pages,
            results = results.len(),
            yielded = self.yielded,
            "Page fetched"
        );

        Ok(Some(results))
    }
}

/// Random-sample walk: distinct seeds until `max_papers` distinct works are collected.
pub struct RandomSampler<'a> {
    client: &'a OpenAlexClient,
    filter: String,
    max_papers: u64,
    collected: u64,
    rng: StdRng,
    used_seeds: HashSet<u64>,
    seen_ids: HashSet<String>,
    stale_samples: u32,
    done: bool,
}

impl<'a> RandomSampler<'a> {
    pub fn new(client: &'a OpenAlexClient, config: &SearchConfig, max_papers: u64) -> Self {
        Self::with_rng(client, config, max_papers, StdRng::from_entropy())
    }

    /// Sampler with a fixed RNG, for reproducible seed sequences.
    pub fn with_rng(client: &'a OpenAlexClient, config: &SearchConfig, max_papers: u64, rng: StdRng) -> Self {
        Self {
            client,
            filter: build_filter(config),
            max_papers,
            collected: 0,
            rng,
            used_seeds: HashSet::new(),
            seen_ids: HashSet::new(),
            stale_samples: 0,
            done: false,
        }
    }

    /// Fetch the next random sample, or `None` once enough works are collected.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Value>>> {
        if self.done || self.collected >= self.max_papers {
            return Ok(None);
        }

        let Some(seed) = self.next_seed() else {
            warn!("Seed space exhausted");
            self.done = true;
            return Ok(None);
        };

        if self.used_seeds.len() > 1 && !self.client.config.request_delay.is_zero() {
            tokio::time::sleep(self.client.config.request_delay).await;
        }

        let remaining = self.max_papers - self.collected;
        let sample = (remaining as usize).min(self.client.config.per_page);

        info!(seed, sample, "Fetching random samples");
        let page = self.client.fetch_sample(&self.filter, sample, seed).await?;

        if page.results.is_empty() {
            info!("No more results to fetch");
            self.done = true;
            return Ok(None);
        }

        let mut results: Vec<Value> = page
            .results
            .into_iter()
            .filter(|work| match work.get("id").and_then(Value::as_str) {
                Some(id) => self.seen_ids.insert(id.to_string()),
                None => true,
            })
            .collect();
        results.truncate(remaining as usize);

        if results.is_empty() {
            self.stale_samples += 1;
            if self.stale_samples >= MAX_STALE_SAMPLES {
                warn!(
                    collected = self.collected,
                    max_papers = self.max_papers,
                    "Samples keep repeating known works, stopping"
                );
                self.done = true;
                return Ok(None);
            }
        } else {
            self.stale_samples = 0;
        }

        self.collected += results.len() as u64;
        info!(collected = self.collected, "Total results fetched so far");

        Ok(Some(results))
    }

    fn next_seed(&mut self) -> Option<u64> {
        if self.used_seeds.len() as u64 >= SEED_SPACE {
            return None;
        }
        loop {
            let seed = self.rng.gen_range(0..SEED_SPACE);
            if self.used_seeds.insert(seed) {
                return Some(seed);
            }
        }
    }
}
