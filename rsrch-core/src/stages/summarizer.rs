//! Map-reduce summarization with content-type model routing and
//! table-aware preprocessing.
//!
//! Short documents are summarized in one call; long documents are chunked
//! on paragraph boundaries with overlap, each chunk summarized (map), and
//! the chunk summaries combined (reduce). A failure on one document drops
//! that document only.

use crate::config::PipelineConfig;
use crate::content_type::ContentClassifier;
use crate::llm::LlmClient;
use crate::stages::source_grounding_block;
use crate::stages::tables::{preprocess_tables, PreprocessedTables, TableOptions};
use crate::types::{ResearchPlan, ScrapedContent, Summary};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Documents at or below this size are summarized in one call.
const DIRECT_SUMMARIZATION_CHARS: usize = 50_000;

/// Upper bound per map chunk, keeping prompt plus chunk inside the window.
const MAX_CHUNK_CHARS: usize = 120_000;

/// Trailing characters of a chunk repeated at the start of the next one.
const CHUNK_OVERLAP_CHARS: usize = 500;

pub struct Summarizer {
    llm: LlmClient,
    config: Arc<PipelineConfig>,
    classifier: ContentClassifier,
}

impl Summarizer {
    pub fn new(llm: LlmClient, config: Arc<PipelineConfig>, classifier: ContentClassifier) -> Self {
        Self {
            llm,
            config,
            classifier,
        }
    }

    /// Summarize a batch of scraped documents with bounded parallelism.
    ///
    /// Empty bodies are skipped; a per-document failure is logged and the
    /// batch continues.
    pub async fn summarize_all(
        &self,
        contents: &[ScrapedContent],
        plan: &ResearchPlan,
        cancel: &CancellationToken,
    ) -> Vec<Summary> {
        let semaphore = Arc::new(Semaphore::new(self.config.summary_parallel.max(1)));
        let tasks = contents.iter().map(|content| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                if cancel.is_cancelled() {
                    return None;
                }
                if content.is_empty() {
                    debug!(url = content.url.as_str(), "Skipping empty body");
                    return None;
                }
                self.summarize_content(content, plan).await
            }
        });

        let summaries: Vec<Summary> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .flatten()
            .collect();

        info!(
            summaries = summaries.len(),
            documents = contents.len(),
            "Summarization batch complete"
        );
        summaries
    }

    /// Summarize one document. Returns `None` on failure so the pipeline
    /// continues with the remaining documents.
    pub async fn summarize_content(
        &self,
        content: &ScrapedContent,
        plan: &ResearchPlan,
    ) -> Option<Summary> {
        let content_type = self.classifier.classify(&content.url);
        let model = self.config.summarizer_model(content_type).to_string();
        debug!(
            url = content.url.as_str(),
            content_type = %content_type,
            model = model.as_str(),
            "Routing summarization"
        );

        let preprocessed = if self.config.enable_table_aware {
            preprocess_tables(&content.markdown_body, &self.table_options())
        } else {
            PreprocessedTables {
                text: content.markdown_body.clone(),
                ..Default::default()
            }
        };

        let text = if preprocessed.text.chars().count() <= DIRECT_SUMMARIZATION_CHARS {
            self.summarize_direct(&preprocessed.text, content, plan, &model)
                .await
        } else {
            info!(
                url = content.url.as_str(),
                chars = preprocessed.text.chars().count(),
                "Using map-reduce summarization"
            );
            self.summarize_map_reduce(&preprocessed.text, content, plan, &model)
                .await
        };

        match text {
            Some(text) => Some(Summary {
                source_url: content.url.clone(),
                title: content.title.clone(),
                text,
                citations: BTreeSet::from([content.url.clone()]),
                content_type,
                preserved_tables: preprocessed.preserved,
                compacted_tables: preprocessed.compacted,
                relevance_score: 0.0,
            }),
            None => None,
        }
    }

    fn table_options(&self) -> TableOptions {
        TableOptions {
            topk_rows: self.config.table_topk_rows,
            max_rows_verbatim: self.config.table_max_rows_verbatim,
            max_cols_verbatim: self.config.table_max_cols_verbatim,
        }
    }

    async fn summarize_direct(
        &self,
        text: &str,
        content: &ScrapedContent,
        plan: &ResearchPlan,
        model: &str,
    ) -> Option<String> {
        let sections: String = plan
            .sections
            .iter()
            .map(|s| format!("- {s}"))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            r#"{grounding}
Summarize the following content in relation to the research query.

Research Query: "{query}"

Source: {title}
URL: {url}

Report Sections (for context):
{sections}

Content:
{text}

Provide a comprehensive summary that:
1. Extracts key information relevant to the research query
2. Identifies main findings, arguments, or insights
3. Preserves any Markdown tables verbatim, including their note lines
4. Maintains factual accuracy

Aim for 3-5 paragraphs. Focus on substance over style."#,
            grounding = source_grounding_block(Utc::now()),
            query = plan.query.text,
            title = content.title,
            url = content.url,
        );

        match self
            .llm
            .complete_text(&prompt, model, 0.3, Some(1000))
            .await
        {
            Ok(summary) => Some(summary),
            Err(err) => {
                warn!(
                    stage = "summarize",
                    url = content.url.as_str(),
                    error = %err,
                    "Direct summarization failed; dropping document"
                );
                None
            }
        }
    }

    async fn summarize_map_reduce(
        &self,
        text: &str,
        content: &ScrapedContent,
        plan: &ResearchPlan,
        model: &str,
    ) -> Option<String> {
        let chunks = chunk_text(text, MAX_CHUNK_CHARS, CHUNK_OVERLAP_CHARS);
        debug!(chunks = chunks.len(), url = content.url.as_str(), "Chunked document");

        // MAP: summarize each chunk; failed chunks are skipped.
        let mut chunk_summaries = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            match self.summarize_chunk(chunk, i, content, plan, model).await {
                Some(summary) => chunk_summaries.push(summary),
                None => warn!(
                    stage = "summarize",
                    url = content.url.as_str(),
                    chunk = i,
                    "Chunk summarization failed; skipping chunk"
                ),
            }
        }
        if chunk_summaries.is_empty() {
            warn!(
                stage = "summarize",
                url = content.url.as_str(),
                "No chunk summaries produced; dropping document"
            );
            return None;
        }

        // REDUCE: combine chunk summaries into one.
        let sections: String = plan
            .sections
            .iter()
            .map(|s| format!("- {s}"))
            .collect::<Vec<_>>()
            .join("\n");
        let combined = chunk_summaries.join("\n\n");
        let prompt = format!(
            r#"{grounding}
Synthesize the following summaries into a coherent final summary.

Research Query: "{query}"
Source: {title}
URL: {url}

Report Sections:
{sections}

Chunk Summaries:
{combined}

Create a comprehensive summary that:
1. Eliminates redundancy across chunks
2. Organizes information logically
3. Highlights key findings relevant to the research query
4. Preserves any [Source N] markers and Markdown tables verbatim

Aim for 3-5 paragraphs."#,
            grounding = source_grounding_block(Utc::now()),
            query = plan.query.text,
            title = content.title,
            url = content.url,
        );

        match self
            .llm
            .complete_text(&prompt, model, 0.3, Some(1000))
            .await
        {
            Ok(summary) => Some(summary),
            Err(err) => {
                warn!(
                    stage = "summarize",
                    url = content.url.as_str(),
                    error = %err,
                    "Reduce step failed; dropping document"
                );
                None
            }
        }
    }

    async fn summarize_chunk(
        &self,
        chunk: &str,
        index: usize,
        content: &ScrapedContent,
        plan: &ResearchPlan,
        model: &str,
    ) -> Option<String> {
        let prompt = format!(
            r#"{grounding}
Summarize the following content chunk in relation to the research query.

Research Query: "{query}"

Source: {title}
URL: {url}
Chunk {number}

Content:
{chunk}

Provide a concise summary focusing on information relevant to the research
query. Extract key facts, findings, and insights. Aim for 2-3 paragraphs."#,
            grounding = source_grounding_block(Utc::now()),
            query = plan.query.text,
            title = content.title,
            url = content.url,
            number = index + 1,
        );

        self.llm
            .complete_text(&prompt, model, 0.3, Some(500))
            .await
            .ok()
    }
}

/// Split text into chunks of at most `max_chars`, on paragraph boundaries
/// where possible, seeding each chunk after the first with the tail of the
/// previous one.
pub(crate) fn chunk_text(text: &str, max_chars: usize, overlap_chars: usize) -> Vec<String> {
    let paragraphs: Vec<&str> = text.split("\n\n").collect();
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    let mut push_chunk = |chunks: &mut Vec<String>, current: &mut String| {
        if !current.trim().is_empty() {
            chunks.push(std::mem::take(current));
        } else {
            current.clear();
        }
    };

    for para in paragraphs {
        // Oversized single paragraph: hard-split on sentence boundaries.
        if para.chars().count() > max_chars {
            push_chunk(&mut chunks, &mut current);
            for sentence_chunk in split_oversized(para, max_chars) {
                chunks.push(sentence_chunk);
            }
            continue;
        }

        let candidate_len = current.chars().count() + para.chars().count() + 2;
        if candidate_len > max_chars && !current.is_empty() {
            let tail = overlap_tail(&current, overlap_chars);
            push_chunk(&mut chunks, &mut current);
            current = tail;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(para);
    }
    push_chunk(&mut chunks, &mut current);

    chunks
}

/// Last `overlap_chars` characters of a chunk, cut at a paragraph start
/// when one falls inside the window.
fn overlap_tail(chunk: &str, overlap_chars: usize) -> String {
    if overlap_chars == 0 {
        return String::new();
    }
    let chars: Vec<char> = chunk.chars().collect();
    let start = chars.len().saturating_sub(overlap_chars);
    let tail: String = chars[start..].iter().collect();
    match tail.find("\n\n") {
        Some(pos) => tail[pos + 2..].to_string(),
        None => tail,
    }
}

/// Hard-split an oversized paragraph on sentence boundaries.
fn split_oversized(para: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for sentence in para.split_inclusive(". ") {
        if current.chars().count() + sentence.chars().count() > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        // A single sentence beyond the limit is truncated outright.
        if sentence.chars().count() > max_chars {
            chunks.push(sentence.chars().take(max_chars).collect());
            continue;
        }
        current.push_str(sentence);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
