//! Context assembly: embedding-based ranking of accumulated summaries.
//!
//! This is the single writer of the vector store. The orchestrator runs it
//! exactly once per run, strictly single-threaded, after the research loop
//! ends; nothing else may write (the backing embedded engine corrupts or
//! deadlocks under concurrent writers).

use crate::embeddings::Embedder;
use crate::error::PipelineError;
use crate::rerank::{effective_top_k, RerankerClient};
use crate::types::{canonical_url, ContextPackage, Query, Summary};
use crate::vector_store::VectorStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ContextAssembler {
    embedder: Arc<dyn Embedder>,
    store: Arc<VectorStore>,
    reranker: Option<Arc<RerankerClient>>,
    top_k_ratio: f64,
}

impl ContextAssembler {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<VectorStore>,
        reranker: Option<Arc<RerankerClient>>,
        top_k_ratio: f64,
    ) -> Self {
        Self {
            embedder,
            store,
            reranker,
            top_k_ratio,
        }
    }

    /// Rank all accumulated summaries against the query and select the top
    /// ratio.
    ///
    /// Embedding failure is fatal for this stage; zero vectors are never
    /// substituted.
    pub async fn assemble(
        &self,
        summaries: &[Summary],
        query: &Query,
    ) -> Result<ContextPackage, PipelineError> {
        if summaries.is_empty() {
            warn!("No summaries available for context assembly");
            return Ok(ContextPackage::default());
        }

        // Deduplicate by canonical URL, keeping the first occurrence.
        let mut seen = std::collections::HashSet::new();
        let summaries: Vec<&Summary> = summaries
            .iter()
            .filter(|s| seen.insert(canonical_url(&s.source_url)))
            .collect();
        let total = summaries.len();

        // One batched call: query first, then every summary text.
        let mut texts = Vec::with_capacity(total + 1);
        texts.push(query.text.clone());
        texts.extend(summaries.iter().map(|s| s.text.clone()));
        let mut embeddings = self.embedder.embed(&texts).await?;
        if embeddings.len() != total + 1 {
            return Err(PipelineError::EmbeddingUnavailable {
                message: format!(
                    "expected {} embeddings, got {}",
                    total + 1,
                    embeddings.len()
                ),
            });
        }
        let query_embedding = embeddings.remove(0);

        // Persist this run's summaries. Single-writer by architecture.
        let records: Vec<(String, String, String, Vec<f32>)> = summaries
            .iter()
            .zip(embeddings.iter())
            .map(|(s, e)| {
                (
                    s.source_url.clone(),
                    s.title.clone(),
                    s.text.clone(),
                    e.clone(),
                )
            })
            .collect();
        let ids = self.store.upsert(&records)?;
        let id_to_index: HashMap<i64, usize> =
            ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let top_k = effective_top_k(self.top_k_ratio, total);
        let ranked = self.store.top_k_in(&ids, &query_embedding, top_k)?;
        debug!(selected = ranked.len(), total, "Vector ranking complete");

        // Cosine lands in [-1, 1]; scores are reported in [0, 1].
        let mut selected: Vec<(usize, f64)> = ranked
            .iter()
            .filter_map(|(chunk, score)| {
                id_to_index
                    .get(&chunk.id)
                    .map(|index| (*index, score.max(0.0)))
            })
            .collect();

        // Optional external rerank of the selected subset.
        if let Some(reranker) = &self.reranker {
            if reranker.is_enabled() && selected.len() > 1 {
                let documents: Vec<String> = selected
                    .iter()
                    .map(|(index, _)| summaries[*index].text.clone())
                    .collect();
                let reranked = reranker.rerank(&query.text, &documents, documents.len()).await;
                selected = reranked
                    .into_iter()
                    .map(|item| {
                        let (index, _) = selected[item.index];
                        (index, item.score.clamp(0.0, 1.0))
                    })
                    .collect();
            }
        }

        let mut scores = HashMap::new();
        let mut selected_summaries = Vec::with_capacity(selected.len());
        for (index, score) in &selected {
            let mut summary = summaries[*index].clone();
            summary.relevance_score = *score;
            scores.insert(summary.source_url.clone(), *score);
            selected_summaries.push(summary);
        }

        let excluded_count = total - selected_summaries.len();
        info!(
            selected = selected_summaries.len(),
            excluded = excluded_count,
            "Context assembled"
        );

        Ok(ContextPackage {
            selected_summaries,
            scores,
            excluded_count,
        })
    }
}
