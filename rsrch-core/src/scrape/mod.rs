//! Three-tier content scraper with a run-scoped single-flight cache.
//!
//! Tier cascade per URL: local HTML fetch + Markdown conversion, then an
//! external markdown-extractor service (JS-capable), then an external
//! scrape API. A tier is abandoned on HTTP error, a body under 200 chars,
//! or timeout. Per-tier usage and estimated fallback cost are tracked for
//! observability only.

pub mod cache;
pub mod html;

pub use cache::{ScrapeCache, SharedScrapeCache};
pub use html::{Converted, HtmlToMarkdown};

use crate::config::{OutputFormat, PipelineConfig};
use crate::error::ScrapeError;
use crate::types::{ExtractorTier, ScrapedContent};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bodies below this size trigger the next tier.
const MIN_BODY_CHARS: usize = 200;

/// Per-tier fetch timeout.
const TIER_TIMEOUT: Duration = Duration::from_secs(15);

/// Approximate cost per paid fallback scrape, USD.
const FALLBACK_COST_PER_SCRAPE: f64 = 0.005;

/// Browser-ish user agent to avoid trivial bot blocks.
const USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36";

/// Raw page content produced by one fetcher tier.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub markdown: String,
    pub title: Option<String>,
    pub tables_found: usize,
    pub tables_converted: usize,
}

/// One scraper tier.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    fn tier(&self) -> ExtractorTier;

    /// Fetch and convert one URL. Errors (and undersized bodies, checked by
    /// the cascade) hand the URL to the next tier.
    async fn fetch(&self, url: &str) -> Result<FetchedPage, ScrapeError>;
}

/// Tier usage counters, observability only.
#[derive(Debug, Default)]
pub struct ScrapeStats {
    primary: AtomicUsize,
    fallback1: AtomicUsize,
    fallback2: AtomicUsize,
    failed: AtomicUsize,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrapeStatsSnapshot {
    pub primary_uses: usize,
    pub fallback1_uses: usize,
    pub fallback2_uses: usize,
    pub failed: usize,
}

impl ScrapeStatsSnapshot {
    pub fn fallback_uses(&self) -> usize {
        self.fallback1_uses + self.fallback2_uses
    }

    pub fn estimated_cost(&self) -> f64 {
        self.fallback_uses() as f64 * FALLBACK_COST_PER_SCRAPE
    }
}

impl ScrapeStats {
    fn record(&self, tier: ExtractorTier) {
        match tier {
            ExtractorTier::Primary => self.primary.fetch_add(1, Ordering::Relaxed),
            ExtractorTier::Fallback1 => self.fallback1.fetch_add(1, Ordering::Relaxed),
            ExtractorTier::Fallback2 => self.fallback2.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ScrapeStatsSnapshot {
        ScrapeStatsSnapshot {
            primary_uses: self.primary.load(Ordering::Relaxed),
            fallback1_uses: self.fallback1.load(Ordering::Relaxed),
            fallback2_uses: self.fallback2.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// The scraper: tier cascade + single-flight cache + bounded fan-out.
pub struct Scraper {
    fetchers: Vec<Arc<dyn ContentFetcher>>,
    cache: SharedScrapeCache,
    stats: Arc<ScrapeStats>,
    parallel: usize,
}

impl Scraper {
    /// Build the standard three-tier scraper from configuration.
    pub fn from_config(config: &PipelineConfig, cache: SharedScrapeCache) -> Self {
        let fetchers: Vec<Arc<dyn ContentFetcher>> = vec![
            Arc::new(LocalFetcher::new(config.preserve_tables, config.output_format)),
            Arc::new(ReaderApiFetcher::new(None)),
            Arc::new(ScrapeApiFetcher::new(config.serp_api_key.clone())),
        ];
        Self::with_fetchers(fetchers, cache, config.scrape_parallel)
    }

    /// Build a scraper with explicit tiers; used by tests and the verifier.
    pub fn with_fetchers(
        fetchers: Vec<Arc<dyn ContentFetcher>>,
        cache: SharedScrapeCache,
        parallel: usize,
    ) -> Self {
        Self {
            fetchers,
            cache,
            stats: Arc::new(ScrapeStats::default()),
            parallel: parallel.max(1),
        }
    }

    /// The cache shared with the verifier.
    pub fn cache(&self) -> &SharedScrapeCache {
        &self.cache
    }

    pub fn stats(&self) -> ScrapeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Scrape a single URL through the cache.
    ///
    /// Concurrent calls for the same canonical URL share one fetch.
    pub async fn scrape_url(&self, url: &str) -> Option<ScrapedContent> {
        self.cache
            .get_or_fetch(url, || self.cascade(url.to_string()))
            .await
    }

    /// Scrape many URLs with bounded parallelism.
    ///
    /// Returns successfully scraped content keyed by the URL as given. One
    /// failing URL never cancels the batch.
    pub async fn scrape_many(
        &self,
        urls: &[String],
        cancel: &CancellationToken,
    ) -> HashMap<String, ScrapedContent> {
        let semaphore = Arc::new(Semaphore::new(self.parallel));
        let tasks = urls.iter().map(|url| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                if cancel.is_cancelled() {
                    return None;
                }
                self.scrape_url(url).await.map(|c| (url.clone(), c))
            }
        });

        let results: HashMap<String, ScrapedContent> =
            futures::future::join_all(tasks).await.into_iter().flatten().collect();

        info!(
            scraped = results.len(),
            requested = urls.len(),
            "Scrape batch complete"
        );
        results
    }

    /// Run the tier cascade for one URL.
    async fn cascade(&self, url: String) -> Option<ScrapedContent> {
        for fetcher in &self.fetchers {
            let tier = fetcher.tier();
            match fetcher.fetch(&url).await {
                Ok(page) => {
                    let size = page.markdown.chars().count();
                    if size < MIN_BODY_CHARS {
                        warn!(
                            stage = "scrape",
                            url = url.as_str(),
                            tier = %tier,
                            size,
                            "Body below minimum size; trying next tier"
                        );
                        continue;
                    }
                    self.stats.record(tier);
                    debug!(url = url.as_str(), tier = %tier, size, "Scrape succeeded");
                    return Some(build_content(&url, page, tier));
                }
                Err(err) => {
                    warn!(
                        stage = "scrape",
                        url = url.as_str(),
                        tier = %tier,
                        error = %err,
                        "Tier failed; trying next"
                    );
                }
            }
        }

        self.stats.record_failure();
        warn!(stage = "scrape", url = url.as_str(), "All scraper tiers failed");
        None
    }
}

/// Assemble a `ScrapedContent` from a fetched page.
fn build_content(url: &str, page: FetchedPage, tier: ExtractorTier) -> ScrapedContent {
    let title = page
        .title
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| {
            page.markdown
                .lines()
                .find(|l| !l.trim().is_empty())
                .map(|l| {
                    let line = l.trim().trim_start_matches('#').trim();
                    line.chars().take(100).collect()
                })
                .unwrap_or_else(|| url.to_string())
        });

    ScrapedContent {
        url: url.to_string(),
        title,
        markdown_body: page.markdown,
        retrieved_at: Utc::now(),
        extractor_tier: tier,
        tables_found: page.tables_found,
        tables_converted: page.tables_converted,
    }
}

/// Tier 1: local HTML fetch + Markdown (or plain-text) conversion.
pub struct LocalFetcher {
    client: reqwest::Client,
    converter: HtmlToMarkdown,
    output_format: OutputFormat,
}

impl LocalFetcher {
    pub fn new(preserve_tables: bool, output_format: OutputFormat) -> Self {
        Self {
            client: reqwest::Client::new(),
            converter: HtmlToMarkdown::new(preserve_tables),
            output_format,
        }
    }
}

#[async_trait]
impl ContentFetcher for LocalFetcher {
    fn tier(&self) -> ExtractorTier {
        ExtractorTier::Primary
    }

    async fn fetch(&self, url: &str) -> Result<FetchedPage, ScrapeError> {
        let response = self
            .client
            .get(url)
            .header("User-Agent", USER_AGENT)
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .timeout(TIER_TIMEOUT)
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(|e| map_reqwest_error(url, e))?;
        let converted = match self.output_format {
            OutputFormat::Markdown => self.converter.convert(&body),
            OutputFormat::Text => html::extract_text(&body),
        };
        Ok(FetchedPage {
            markdown: converted.markdown,
            title: converted.title,
            tables_found: converted.tables_found,
            tables_converted: converted.tables_converted,
        })
    }
}

/// Tier 2: external markdown-extractor service (renders JS-heavy pages).
pub struct ReaderApiFetcher {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl ReaderApiFetcher {
    const BASE_URL: &'static str = "https://r.jina.ai";

    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }
}

#[async_trait]
impl ContentFetcher for ReaderApiFetcher {
    fn tier(&self) -> ExtractorTier {
        ExtractorTier::Fallback1
    }

    async fn fetch(&self, url: &str) -> Result<FetchedPage, ScrapeError> {
        let mut request = self
            .client
            .get(format!("{}/{url}", Self::BASE_URL))
            .timeout(TIER_TIMEOUT);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| map_reqwest_error(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let markdown = response.text().await.map_err(|e| map_reqwest_error(url, e))?;
        Ok(FetchedPage {
            markdown,
            title: None,
            tables_found: 0,
            tables_converted: 0,
        })
    }
}

/// Tier 3: external scrape API returning pre-extracted Markdown.
pub struct ScrapeApiFetcher {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl ScrapeApiFetcher {
    const ENDPOINT: &'static str = "https://scrape.serper.dev";

    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }
}

#[async_trait]
impl ContentFetcher for ScrapeApiFetcher {
    fn tier(&self) -> ExtractorTier {
        ExtractorTier::Fallback2
    }

    async fn fetch(&self, url: &str) -> Result<FetchedPage, ScrapeError> {
        let api_key = self.api_key.as_ref().ok_or_else(|| ScrapeError::Request {
            url: url.to_string(),
            message: "no scrape API key configured".into(),
        })?;

        let response = self
            .client
            .post(Self::ENDPOINT)
            .header("X-API-KEY", api_key)
            .json(&serde_json::json!({ "url": url, "includeMarkdown": true }))
            .timeout(TIER_TIMEOUT)
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let data: Value = response.json().await.map_err(|e| map_reqwest_error(url, e))?;
        let markdown = data["markdown"]
            .as_str()
            .or_else(|| data["text"].as_str())
            .or_else(|| data["content"].as_str())
            .unwrap_or("")
            .to_string();
        Ok(FetchedPage {
            markdown,
            title: data["title"].as_str().map(str::to_string),
            tables_found: 0,
            tables_converted: 0,
        })
    }
}

fn map_reqwest_error(url: &str, err: reqwest::Error) -> ScrapeError {
    if err.is_timeout() {
        ScrapeError::Timeout {
            url: url.to_string(),
            timeout_secs: TIER_TIMEOUT.as_secs(),
        }
    } else {
        ScrapeError::Request {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}
