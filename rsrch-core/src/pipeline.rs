//! Pipeline orchestrator.
//!
//! Drives the full state machine:
//!
//! ```text
//! START -> CLASSIFY -> PLAN -> RESEARCH_LOOP[iter=1..M] -> ASSEMBLE -> REPORT -> VERIFY? -> DONE
//!                                  |
//!                                  v
//!                          SEARCH -> URL_RERANK -> SCRAPE -> SUMMARIZE -> REFLECT
//! ```
//!
//! The orchestrator exclusively owns the mutable accumulators
//! (`all_summaries`, `all_search_results`, the seen-URL set); stages get
//! read-only views and return new artifacts. Reflection may extend the
//! accumulators by re-entering SEARCH, never edit them.
//!
//! Single-writer contract: the vector store is written only by the ASSEMBLE
//! stage, which runs exactly once and strictly single-threaded after the
//! research loop ends. Do not parallelize ASSEMBLE or add writers — the
//! embedded database underneath will deadlock or corrupt under concurrent
//! writes.

use crate::config::PipelineConfig;
use crate::content_type::ContentClassifier;
use crate::embeddings::{Embedder, HttpEmbedder};
use crate::error::{PipelineError, Result};
use crate::llm::{LlmClient, LlmOptions};
use crate::rerank::{RerankerClient, SearchResultReranker};
use crate::report::{render_report, write_report, ReportGenerator};
use crate::scrape::{ScrapeCache, Scraper};
use crate::search::{provider_from_config, safe_search, SearchKind, SearchProvider};
use crate::stages::context::ContextAssembler;
use crate::stages::intent::IntentClassifier;
use crate::stages::planner::Planner;
use crate::stages::reflector::Reflector;
use crate::stages::summarizer::Summarizer;
use crate::stages::verifier::{render_appendix, ClaimExtractor, ClaimVerifier};
use crate::types::{
    canonical_url, Query, ReflectionResult, Report, ResearchPlan, SearchQuery, SearchResult,
    Summary, VerificationSummary,
};
use crate::vector_store::VectorStore;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Classify,
    Plan,
    Search,
    UrlRerank,
    Scrape,
    Summarize,
    Reflect,
    Assemble,
    Report,
    Verify,
    Done,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineStage::Classify => "classify",
            PipelineStage::Plan => "plan",
            PipelineStage::Search => "search",
            PipelineStage::UrlRerank => "url_rerank",
            PipelineStage::Scrape => "scrape",
            PipelineStage::Summarize => "summarize",
            PipelineStage::Reflect => "reflect",
            PipelineStage::Assemble => "assemble",
            PipelineStage::Report => "report",
            PipelineStage::Verify => "verify",
            PipelineStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Progress hooks for callers that want to surface pipeline state.
pub trait PipelineObserver: Send + Sync {
    /// The research plan, before any searching starts.
    fn on_plan(&self, _plan: &ResearchPlan) {}

    /// A stage transition within an iteration (iteration is 0 outside the
    /// research loop).
    fn on_stage(&self, _stage: PipelineStage, _iteration: u32) {}
}

/// Everything a completed run produced.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub report: Report,
    pub rendered: String,
    pub report_path: PathBuf,
    pub verification: Option<VerificationSummary>,
    pub iterations: u32,
    /// Deduplicated search results gathered across all iterations.
    pub search_results: Vec<SearchResult>,
}

pub struct ResearchPipeline {
    config: Arc<PipelineConfig>,
    llm: LlmClient,
    intent_classifier: IntentClassifier,
    planner: Planner,
    provider: Box<dyn SearchProvider>,
    url_reranker: SearchResultReranker,
    scraper: Arc<Scraper>,
    summarizer: Summarizer,
    assembler: ContextAssembler,
    reflector: Reflector,
    report_generator: ReportGenerator,
    cancel: CancellationToken,
}

impl ResearchPipeline {
    /// Build the pipeline with real transports from validated configuration.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        config.ensure_directories()?;
        let config = Arc::new(config);

        let llm = LlmClient::over_http(
            &config.llm_endpoint,
            &config.llm_api_key,
            LlmOptions {
                max_retries: config.llm_max_retries,
                include_policy: config.prompt_policy_include,
            },
        );
        let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::new(
            config.llm_endpoint.clone(),
            config.llm_api_key.clone(),
            config.embedding_model.clone(),
        ));
        let store = Arc::new(VectorStore::open(&config.vector_db_path)?);
        let provider = provider_from_config(&config)?;
        let scraper = Arc::new(Scraper::from_config(&config, Arc::new(ScrapeCache::new())));

        let reranker = if config.use_reranker {
            Arc::new(RerankerClient::new(
                config.reranker_url.clone(),
                config.reranker_api_key.clone(),
                config.reranker_model.clone(),
            ))
        } else {
            Arc::new(RerankerClient::disabled())
        };

        Ok(Self::from_parts(
            config, llm, embedder, store, provider, scraper, reranker,
        ))
    }

    /// Assemble a pipeline from explicit components. Used by `new` and by
    /// tests that substitute stub transports.
    pub fn from_parts(
        config: Arc<PipelineConfig>,
        llm: LlmClient,
        embedder: Arc<dyn Embedder>,
        store: Arc<VectorStore>,
        provider: Box<dyn SearchProvider>,
        scraper: Arc<Scraper>,
        reranker: Arc<RerankerClient>,
    ) -> Self {
        let (research, code, news) = config.content_domain_extensions();
        let classifier = ContentClassifier::with_extra_domains(research, code, news);
        Self {
            intent_classifier: IntentClassifier::new(llm.clone(), config.intent_model()),
            planner: Planner::new(llm.clone(), config.planner_model()),
            url_reranker: SearchResultReranker::new(reranker.clone(), config.top_k_url),
            summarizer: Summarizer::new(llm.clone(), config.clone(), classifier),
            assembler: ContextAssembler::new(
                embedder,
                store,
                Some(reranker),
                config.top_k_sum,
            ),
            reflector: Reflector::new(llm.clone(), config.reflection_model()),
            report_generator: ReportGenerator::new(
                llm.clone(),
                config.report_model(),
                config.report_max_tokens,
            ),
            provider,
            scraper,
            llm,
            cancel: CancellationToken::new(),
            config,
        }
    }

    /// Token that cancels the run cooperatively: in-flight single-URL
    /// operations finish or abort at their next suspension point.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the full pipeline for a query.
    pub async fn run(
        &self,
        query_text: &str,
        observer: Option<&dyn PipelineObserver>,
    ) -> Result<PipelineOutcome> {
        let run_id = uuid::Uuid::new_v4();
        info!(%run_id, query = query_text, "Starting research run");

        let notify = |stage: PipelineStage, iteration: u32| {
            if let Some(observer) = observer {
                observer.on_stage(stage, iteration);
            }
            info!(%run_id, stage = %stage, iteration, "Stage transition");
        };

        // CLASSIFY
        self.check_cancelled()?;
        notify(PipelineStage::Classify, 0);
        let mut query = Query::new(query_text);
        query.intent = self.intent_classifier.classify(&query).await?;

        // PLAN
        self.check_cancelled()?;
        notify(PipelineStage::Plan, 0);
        let plan = self.planner.plan(&query).await?;
        if let Some(observer) = observer {
            observer.on_plan(&plan);
        }

        // RESEARCH_LOOP
        let mut all_summaries: Vec<Summary> = Vec::new();
        let mut all_search_results: Vec<SearchResult> = Vec::new();
        let mut seen_urls: HashSet<String> = HashSet::new();
        let mut queries: Vec<SearchQuery> = plan.search_queries.clone();
        let mut final_reflection: Option<ReflectionResult> = None;
        let max_iterations = self.config.max_iterations.max(1);
        let mut iteration = 1u32;

        loop {
            // SEARCH
            self.check_cancelled()?;
            notify(PipelineStage::Search, iteration);
            let new_results = self
                .search_iteration(&queries, query.intent, &mut seen_urls)
                .await;
            info!(
                iteration,
                new_results = new_results.len(),
                "Search iteration complete"
            );

            if iteration == 1 && new_results.is_empty() && all_summaries.is_empty() {
                return Err(PipelineError::NoResults);
            }
            all_search_results.extend(new_results.iter().cloned());

            // URL_RERANK: select the top ratio of this iteration's new
            // results for scraping.
            self.check_cancelled()?;
            notify(PipelineStage::UrlRerank, iteration);
            let selected = self
                .url_reranker
                .rerank_results(&query.text, new_results)
                .await;

            // SCRAPE
            self.check_cancelled()?;
            notify(PipelineStage::Scrape, iteration);
            let urls: Vec<String> = selected.iter().map(|r| r.url.clone()).collect();
            let scraped_map = self.scraper.scrape_many(&urls, &self.cancel).await;
            let scraped: Vec<_> = urls
                .iter()
                .filter_map(|url| scraped_map.get(url).cloned())
                .collect();
            let stats = self.scraper.stats();
            if stats.fallback_uses() > 0 {
                info!(
                    fallback_uses = stats.fallback_uses(),
                    estimated_cost = format!("${:.2}", stats.estimated_cost()),
                    "Fallback scraping used"
                );
            }

            // SUMMARIZE: only this iteration's new scrapes.
            self.check_cancelled()?;
            notify(PipelineStage::Summarize, iteration);
            let summaries = self
                .summarizer
                .summarize_all(&scraped, &plan, &self.cancel)
                .await;
            all_summaries.extend(summaries);
            info!(total = all_summaries.len(), "Summaries accumulated");

            // REFLECT: only when another iteration could follow, so a
            // max_iterations=1 run never invokes the reflector.
            if iteration >= max_iterations {
                info!(iteration, "Maximum iterations reached");
                break;
            }
            self.check_cancelled()?;
            notify(PipelineStage::Reflect, iteration);
            let reflection = self
                .reflector
                .reflect(&query, &plan.sections, &all_summaries)
                .await;
            let complete = reflection.complete;
            let additional = reflection.additional_queries.clone();
            final_reflection = Some(reflection);

            if complete {
                break;
            }
            queries = additional;
            iteration += 1;
            info!(iteration, "Re-entering search to address gaps");
        }

        // ASSEMBLE: runs once, over everything accumulated; the store's
        // only writer.
        self.check_cancelled()?;
        notify(PipelineStage::Assemble, 0);
        let context = self.assembler.assemble(&all_summaries, &query).await?;

        // REPORT
        self.check_cancelled()?;
        notify(PipelineStage::Report, 0);
        let report = self
            .report_generator
            .generate(&query, &plan, &context, final_reflection.as_ref())
            .await?;

        // VERIFY (optional)
        let verification = if self.config.verify_claims {
            self.check_cancelled()?;
            notify(PipelineStage::Verify, 0);
            self.verify_report(&report).await
        } else {
            None
        };

        let appendix = match (&verification, self.config.verify_claims) {
            (Some(summary), _) => Some(render_appendix(summary)),
            (None, true) => Some(
                "# Verification Report\n\n*Claim verification was unavailable for this run; \
                 the report above is unverified.*"
                    .to_string(),
            ),
            (None, false) => None,
        };

        let rendered = render_report(&report, appendix.as_deref());
        let report_path = write_report(&self.config.output_dir, &rendered, report.generated_at)?;

        notify(PipelineStage::Done, 0);
        info!(
            %run_id,
            iterations = iteration,
            search_results = all_search_results.len(),
            summaries = all_summaries.len(),
            "Research run complete"
        );
        Ok(PipelineOutcome {
            report,
            rendered,
            report_path,
            verification,
            iterations: iteration,
            search_results: all_search_results,
        })
    }

    /// Fan out one iteration's queries and dedupe by canonical URL across
    /// the whole run, keeping first-seen rank.
    async fn search_iteration(
        &self,
        queries: &[SearchQuery],
        intent: crate::types::IntentKind,
        seen_urls: &mut HashSet<String>,
    ) -> Vec<SearchResult> {
        let kind = SearchKind::for_intent(intent);
        let exclude = self.config.excluded_domains();
        let n = self.config.search_results_per_query;

        // Highest priority first.
        let mut ordered: Vec<&SearchQuery> = queries.iter().collect();
        ordered.sort_by_key(|q| q.priority);

        let semaphore = Arc::new(Semaphore::new(self.config.search_parallel.max(1)));
        let tasks = ordered.iter().map(|search_query| {
            let semaphore = semaphore.clone();
            let exclude = exclude.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                if self.cancel.is_cancelled() {
                    return Vec::new();
                }
                debug!(query = search_query.text.as_str(), "Executing search query");
                safe_search(self.provider.as_ref(), &search_query.text, kind, n, &exclude).await
            }
        });

        // Futures complete in any order; collection order follows query
        // priority so first-seen dedup is deterministic.
        let per_query: Vec<Vec<SearchResult>> = futures::future::join_all(tasks).await;

        let mut deduped = Vec::new();
        for result in per_query.into_iter().flatten() {
            if seen_urls.insert(canonical_url(&result.url)) {
                deduped.push(result);
            }
        }
        deduped
    }

    /// Extract and verify claims. Failures are non-fatal: the appendix is
    /// replaced by a note.
    async fn verify_report(&self, report: &Report) -> Option<VerificationSummary> {
        let body: String = report
            .sections
            .iter()
            .map(|(title, text)| format!("## {title}\n\n{text}"))
            .collect::<Vec<_>>()
            .join("\n\n");

        let extractor = ClaimExtractor::new(self.llm.clone(), self.config.verify_model());
        let claims = match extractor.extract(&body, &report.sources).await {
            Ok(claims) => claims,
            Err(err) => {
                warn!(
                    stage = "verify",
                    error = %err,
                    "Claim extraction failed; skipping verification"
                );
                return None;
            }
        };
        if claims.is_empty() {
            return Some(VerificationSummary::default());
        }

        let verifier = ClaimVerifier::new(
            self.llm.clone(),
            self.config.verify_model(),
            self.scraper.clone(),
            self.config.verify_threshold,
        );
        match verifier.verify_claims(claims).await {
            Ok(summary) => Some(summary),
            Err(err) => {
                warn!(stage = "verify", error = %err, "Verification failed");
                None
            }
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}
