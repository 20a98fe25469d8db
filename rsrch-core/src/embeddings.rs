//! Embedding client for semantic ranking.
//!
//! Trait-based so the context assembler can be exercised without a network.
//! The HTTP implementation targets OpenAI-compatible `/embeddings` endpoints
//! and always uses the provider's native batch API.

use crate::error::PipelineError;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Provider batch size limit per request.
const MAX_BATCH: usize = 2048;

/// Batched embedding generation.
///
/// Implementations must preserve input order and must never substitute
/// zero vectors on failure; callers treat failure as fatal for the stage.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed the given texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError>;
}

/// OpenAI-compatible embeddings client.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let url = format!("{}/embeddings", self.endpoint.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        debug!(count = texts.len(), model = self.model.as_str(), "Requesting embeddings");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::EmbeddingUnavailable {
                message: format!("request failed: {e}"),
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| PipelineError::EmbeddingUnavailable {
                message: format!("body read failed: {e}"),
            })?;
        if !status.is_success() {
            return Err(PipelineError::EmbeddingUnavailable {
                message: format!("HTTP {status}: {text}"),
            });
        }

        let json: Value =
            serde_json::from_str(&text).map_err(|e| PipelineError::EmbeddingUnavailable {
                message: format!("invalid response JSON: {e}"),
            })?;
        let data = json["data"]
            .as_array()
            .ok_or_else(|| PipelineError::EmbeddingUnavailable {
                message: "missing 'data' array in response".into(),
            })?;

        // The API may return entries out of order; `index` restores input order.
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        for item in data {
            let index = item["index"].as_u64().unwrap_or(0) as usize;
            let embedding = item["embedding"]
                .as_array()
                .ok_or_else(|| PipelineError::EmbeddingUnavailable {
                    message: "missing 'embedding' in response item".into(),
                })?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            if index < vectors.len() {
                vectors[index] = Some(embedding);
            }
        }

        vectors
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                v.ok_or_else(|| PipelineError::EmbeddingUnavailable {
                    message: format!("no embedding returned for input {i}"),
                })
            })
            .collect()
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(MAX_BATCH) {
            out.extend(self.embed_batch(batch).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic embedder used by store and assembler tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct FixedEmbedder {
        pub dim: usize,
        pub calls: AtomicUsize,
    }

    impl FixedEmbedder {
        pub fn new(dim: usize) -> Self {
            Self {
                dim,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; self.dim];
                    for (i, b) in t.bytes().enumerate() {
                        v[i % self.dim] += b as f32;
                    }
                    v
                })
                .collect())
        }
    }
}
