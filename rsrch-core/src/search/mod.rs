//! Uniform search capability across multiple vendors.
//!
//! Concrete providers live in submodules; the orchestrator selects one per
//! run from configuration. A per-query failure never propagates upward:
//! `safe_search` logs a warning and yields an empty result list, leaving the
//! no-results decision to the orchestrator.

mod perplexity;
mod serp;
mod tavily;

pub use perplexity::PerplexityProvider;
pub use serp::SerpProvider;
pub use tavily::TavilyProvider;

use crate::config::{PipelineConfig, SearchProviderKind};
use crate::error::SearchError;
use crate::types::{url_host, IntentKind, SearchResult};
use async_trait::async_trait;
use tracing::{debug, warn};

/// The search vertical to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    Web,
    News,
    Scholar,
}

impl SearchKind {
    /// Kind selection rule: news intent searches news, research searches
    /// scholar, everything else the general web.
    pub fn for_intent(intent: IntentKind) -> Self {
        match intent {
            IntentKind::News => SearchKind::News,
            IntentKind::Research => SearchKind::Scholar,
            _ => SearchKind::Web,
        }
    }
}

/// A search vendor behind a uniform capability.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Short vendor tag recorded on each result.
    fn tag(&self) -> &'static str;

    /// Execute one search. Implementations map `kind` onto their native
    /// endpoint and append exclusion hints; errors are returned so the
    /// caller can decide isolation policy.
    async fn search(
        &self,
        query: &str,
        kind: SearchKind,
        n: usize,
        exclude_domains: &[String],
    ) -> Result<Vec<SearchResult>, SearchError>;
}

/// Build the provider selected by configuration.
pub fn provider_from_config(
    config: &PipelineConfig,
) -> Result<Box<dyn SearchProvider>, SearchError> {
    let api_key = config
        .search_api_key()
        .ok_or_else(|| SearchError::MissingApiKey {
            provider: config.search_provider.to_string(),
        })?
        .to_string();

    Ok(match config.search_provider {
        SearchProviderKind::Serp => Box::new(SerpProvider::new(api_key)),
        SearchProviderKind::Tavily => Box::new(TavilyProvider::new(api_key)),
        SearchProviderKind::Perplexity => Box::new(PerplexityProvider::new(api_key)),
    })
}

/// Execute one query with failure isolation and belt-and-braces domain
/// filtering.
///
/// A provider error becomes an empty result list with one warning record.
/// Results from excluded domains are dropped even when the provider ignored
/// the exclusion hint, and ranks are renumbered to stay 1-based contiguous.
pub async fn safe_search(
    provider: &dyn SearchProvider,
    query: &str,
    kind: SearchKind,
    n: usize,
    exclude_domains: &[String],
) -> Vec<SearchResult> {
    let results = match provider.search(query, kind, n, exclude_domains).await {
        Ok(results) => results,
        Err(err) => {
            warn!(
                stage = "search",
                query,
                provider = provider.tag(),
                error = %err,
                "Search query failed; continuing with empty results"
            );
            return Vec::new();
        }
    };

    let filtered = filter_excluded(results, exclude_domains);
    debug!(query, count = filtered.len(), "Search query complete");
    filtered
}

/// Drop results whose host is in (or under) an excluded domain, then
/// renumber ranks contiguously from 1.
fn filter_excluded(results: Vec<SearchResult>, exclude_domains: &[String]) -> Vec<SearchResult> {
    let mut kept: Vec<SearchResult> = results
        .into_iter()
        .filter(|r| {
            let Some(host) = url_host(&r.url) else {
                return false;
            };
            !exclude_domains
                .iter()
                .any(|d| host == *d || host.ends_with(&format!(".{d}")))
        })
        .collect();
    for (i, result) in kept.iter_mut().enumerate() {
        result.rank = (i + 1) as u32;
    }
    kept
}

/// Append `-site:` exclusion operators to a query string.
pub(crate) fn query_with_exclusions(query: &str, exclude_domains: &[String]) -> String {
    if exclude_domains.is_empty() {
        return query.to_string();
    }
    let suffix: String = exclude_domains
        .iter()
        .map(|d| format!(" -site:{d}"))
        .collect();
    format!("{query}{suffix}")
}
