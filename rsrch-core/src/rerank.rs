//! Optional external reranker.
//!
//! When disabled or unavailable the reranker degrades to identity order
//! truncated to `top_k`, so the URL-selection stage never depends on the
//! external service being up.

use crate::types::SearchResult;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

const TIMEOUT: Duration = Duration::from_secs(30);

/// A reranked item: index into the input documents plus a score.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedItem {
    pub index: usize,
    pub score: f64,
}

/// Client for Jina/Cohere-style rerank endpoints
/// (`{model, query, documents, top_n}` in, `results[].{index,
/// relevance_score}` out).
pub struct RerankerClient {
    client: reqwest::Client,
    api_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
}

impl RerankerClient {
    pub fn new(api_url: Option<String>, api_key: Option<String>, model: Option<String>) -> Self {
        let enabled = api_url.is_some() && model.is_some();
        if enabled {
            info!(url = api_url.as_deref().unwrap_or(""), "Reranker enabled");
        } else {
            info!("Reranker disabled (no URL/model configured)");
        }
        Self {
            client: reqwest::Client::new(),
            api_url,
            api_key,
            model,
        }
    }

    /// Reranker with no backing service; identity behavior only.
    pub fn disabled() -> Self {
        Self::new(None, None, None)
    }

    pub fn is_enabled(&self) -> bool {
        self.api_url.is_some() && self.model.is_some()
    }

    /// Rerank documents against a query, returning up to `top_k` items
    /// ordered by descending score.
    ///
    /// Tolerates empty input. On any failure, falls back to identity order
    /// with synthetic descending scores.
    pub async fn rerank(&self, query: &str, documents: &[String], top_k: usize) -> Vec<RankedItem> {
        if documents.is_empty() || top_k == 0 {
            return Vec::new();
        }

        if !self.is_enabled() {
            return identity_ranking(documents.len(), top_k);
        }

        match self.call_api(query, documents, top_k).await {
            Ok(ranked) if !ranked.is_empty() => {
                debug!(input = documents.len(), output = ranked.len(), "Rerank complete");
                ranked
            }
            Ok(_) => {
                warn!("Reranker returned no results; using original order");
                identity_ranking(documents.len(), top_k)
            }
            Err(err) => {
                warn!(error = err.as_str(), "Reranking failed; using original order");
                identity_ranking(documents.len(), top_k)
            }
        }
    }

    async fn call_api(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Result<Vec<RankedItem>, String> {
        let url = self.api_url.as_deref().expect("checked by is_enabled");
        let model = self.model.as_deref().expect("checked by is_enabled");

        let payload = serde_json::json!({
            "model": model,
            "query": query,
            "documents": documents,
            "top_n": top_k,
        });

        let mut request = self.client.post(url).json(&payload).timeout(TIMEOUT);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }
        let data: Value = response.json().await.map_err(|e| e.to_string())?;
        Ok(parse_rerank_response(&data, documents.len(), top_k))
    }
}

/// Parse a rerank response, dropping out-of-range indices.
fn parse_rerank_response(data: &Value, doc_count: usize, top_k: usize) -> Vec<RankedItem> {
    let mut ranked: Vec<RankedItem> = data["results"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let index = item["index"].as_u64()? as usize;
                    if index >= doc_count {
                        return None;
                    }
                    Some(RankedItem {
                        index,
                        score: item["relevance_score"].as_f64().unwrap_or(0.0),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(top_k);
    ranked
}

/// Identity order with synthetic descending scores.
fn identity_ranking(doc_count: usize, top_k: usize) -> Vec<RankedItem> {
    (0..doc_count.min(top_k))
        .map(|i| RankedItem {
            index: i,
            score: 1.0 - (i as f64 / doc_count as f64),
        })
        .collect()
}

/// Effective count for a ratio in (0.0, 1.0]: `max(1, ceil(ratio * n))`.
pub fn effective_top_k(ratio: f64, n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    ((ratio * n as f64).ceil() as usize).max(1)
}

/// Applies the URL-level rerank ratio to an iteration's search results.
pub struct SearchResultReranker {
    client: std::sync::Arc<RerankerClient>,
    top_k_ratio: f64,
}

impl SearchResultReranker {
    pub fn new(client: std::sync::Arc<RerankerClient>, top_k_ratio: f64) -> Self {
        Self { client, top_k_ratio }
    }

    /// Rerank search results by title+snippet relevance and keep the top
    /// ratio. Scores are attached to the returned results.
    pub async fn rerank_results(
        &self,
        query: &str,
        results: Vec<SearchResult>,
    ) -> Vec<SearchResult> {
        if results.is_empty() {
            return results;
        }

        let documents: Vec<String> = results
            .iter()
            .map(|r| format!("{}. {}", r.title, r.snippet))
            .collect();
        let top_k = effective_top_k(self.top_k_ratio, results.len());

        let ranked = self.client.rerank(query, &documents, top_k).await;

        let selected: Vec<SearchResult> = ranked
            .into_iter()
            .map(|item| {
                let mut result = results[item.index].clone();
                result.relevance_score = Some(item.score);
                result
            })
            .collect();

        info!(
            selected = selected.len(),
            total = results.len(),
            "URL rerank selected top results"
        );
        selected
    }
}
