//! End-to-end pipeline scenarios over stub transports.
//!
//! Every external collaborator (LLM, embeddings, search, scraping) is
//! replaced by an in-process stub; the orchestrator and stage contracts
//! under test are the real ones.

use async_trait::async_trait;
use rsrch_core::config::PipelineConfig;
use rsrch_core::embeddings::Embedder;
use rsrch_core::error::{PipelineError, ScrapeError, SearchError};
use rsrch_core::llm::{ChatRequest, LlmClient, LlmOptions, LlmTransport, TransportError};
use rsrch_core::pipeline::ResearchPipeline;
use rsrch_core::rerank::RerankerClient;
use rsrch_core::scrape::{ContentFetcher, FetchedPage, ScrapeCache, Scraper};
use rsrch_core::search::{SearchKind, SearchProvider};
use rsrch_core::types::{ExtractorTier, SearchResult};
use rsrch_core::vector_store::VectorStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Routes prompts to canned responses by stage-specific markers.
struct StubLlm {
    reflections: Mutex<Vec<String>>,
    reflect_calls: AtomicUsize,
    report_body: String,
}

impl StubLlm {
    fn new(report_body: &str, reflections: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            reflections: Mutex::new(reflections),
            reflect_calls: AtomicUsize::new(0),
            report_body: report_body.to_string(),
        })
    }
}

#[async_trait]
impl LlmTransport for StubLlm {
    async fn send(&self, request: &ChatRequest) -> Result<String, TransportError> {
        let prompt = &request.prompt;
        if prompt.contains("classify its intent") {
            return Ok(r#"{"intent": "informational", "confidence": 0.9, "reasoning": "factual question"}"#.into());
        }
        if prompt.contains("You are a research planner") {
            return Ok(r#"{
                "sections": ["Overview", "How It Works"],
                "search_queries": [
                    {"query": "what is http/3", "purpose": "basics", "priority": 1}
                ],
                "rationale": "start with fundamentals"
            }"#
            .into());
        }
        if prompt.contains("research quality analyst") {
            self.reflect_calls.fetch_add(1, Ordering::SeqCst);
            let mut reflections = self.reflections.lock().unwrap();
            if reflections.is_empty() {
                return Ok(r#"{"is_complete": true, "confidence": 0.9, "missing_information": [], "additional_queries": [], "rationale": "sufficient"}"#.into());
            }
            return Ok(reflections.remove(0));
        }
        if prompt.contains("Generate a comprehensive research report") {
            return Ok(self.report_body.clone());
        }
        if prompt.contains("Summarize the following content")
            || prompt.contains("Synthesize the following summaries")
        {
            return Ok("HTTP/3 is the third major HTTP version, running over QUIC.".into());
        }
        Err(TransportError::Transient(format!(
            "unexpected prompt: {}",
            prompt.chars().take(80).collect::<String>()
        )))
    }
}

/// Order-preserving embedder that counts batch calls and sizes.
struct CountingEmbedder {
    calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
}

impl CountingEmbedder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(texts.len());
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; 8];
                for (i, b) in t.bytes().enumerate() {
                    v[i % 8] += b as f32;
                }
                v
            })
            .collect())
    }
}

/// Returns a fixed result set per call and counts queries.
struct StubSearch {
    batches: Mutex<Vec<Vec<SearchResult>>>,
    calls: AtomicUsize,
}

impl StubSearch {
    fn new(batches: Vec<Vec<SearchResult>>) -> Box<Self> {
        Box::new(Self {
            batches: Mutex::new(batches),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SearchProvider for StubSearch {
    fn tag(&self) -> &'static str {
        "stub"
    }

    async fn search(
        &self,
        _query: &str,
        _kind: SearchKind,
        _n: usize,
        _exclude_domains: &[String],
    ) -> Result<Vec<SearchResult>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut batches = self.batches.lock().unwrap();
        if batches.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(batches.remove(0))
        }
    }
}

fn result(url: &str, rank: u32) -> SearchResult {
    SearchResult {
        url: url.to_string(),
        title: format!("Title {rank}"),
        snippet: format!("Snippet {rank}"),
        rank,
        provider_tag: "stub".into(),
        relevance_score: None,
    }
}

/// Serves canned bodies per URL; URLs not listed fail the tier.
struct MapFetcher {
    tier: ExtractorTier,
    bodies: HashMap<String, String>,
}

impl MapFetcher {
    fn new(tier: ExtractorTier, bodies: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            tier,
            bodies: bodies
                .iter()
                .map(|(url, body)| (url.to_string(), body.to_string()))
                .collect(),
        })
    }
}

#[async_trait]
impl ContentFetcher for MapFetcher {
    fn tier(&self) -> ExtractorTier {
        self.tier
    }

    async fn fetch(&self, url: &str) -> Result<FetchedPage, ScrapeError> {
        match self.bodies.get(url) {
            Some(body) => Ok(FetchedPage {
                markdown: body.clone(),
                title: Some(format!("Page {url}")),
                tables_found: 0,
                tables_converted: 0,
            }),
            None => Err(ScrapeError::Request {
                url: url.to_string(),
                message: "not stubbed".into(),
            }),
        }
    }
}

fn long_body(tag: &str) -> String {
    format!("{tag} {}", "body content ".repeat(40))
}

struct Scenario {
    config: PipelineConfig,
    _output_dir: tempfile::TempDir,
}

impl Scenario {
    fn new() -> Self {
        let output_dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            llm_api_key: "test-key".into(),
            serp_api_key: Some("serp-key".into()),
            max_iterations: 1,
            search_results_per_query: 4,
            top_k_url: 0.5,
            top_k_sum: 0.5,
            verify_claims: false,
            output_dir: output_dir.path().to_path_buf(),
            vector_db_path: output_dir.path().join("store.sqlite"),
            ..PipelineConfig::default()
        };
        Self {
            config,
            _output_dir: output_dir,
        }
    }

    fn build(
        &self,
        llm: Arc<dyn LlmTransport>,
        embedder: Arc<dyn Embedder>,
        provider: Box<dyn SearchProvider>,
        fetchers: Vec<Arc<dyn ContentFetcher>>,
    ) -> ResearchPipeline {
        let config = Arc::new(self.config.clone());
        let scraper = Arc::new(Scraper::with_fetchers(
            fetchers,
            Arc::new(ScrapeCache::new()),
            config.scrape_parallel,
        ));
        ResearchPipeline::from_parts(
            config,
            LlmClient::new(llm, LlmOptions::default()),
            embedder,
            Arc::new(VectorStore::open_in_memory().unwrap()),
            provider,
            scraper,
            Arc::new(RerankerClient::disabled()),
        )
    }
}

/// Scenario A: happy path, single iteration.
///
/// Four search results, the top two (by rank) scraped, two summaries, one
/// selected, a report citing `[Source 1]` with exactly one source entry,
/// and exactly one embedding batch of three texts (query + 2 summaries).
#[tokio::test]
async fn scenario_a_happy_path_single_iteration() {
    let scenario = Scenario::new();
    let llm = StubLlm::new(
        "HTTP/3 runs over QUIC [Source 1].\n\n## Overview\n\nIt replaces TCP [Source 1].",
        Vec::new(),
    );
    let embedder = CountingEmbedder::new();
    let provider = StubSearch::new(vec![vec![
        result("https://a.example/http3", 1),
        result("https://b.example/quic", 2),
        result("https://c.example/other", 3),
        result("https://d.example/more", 4),
    ]]);
    let primary = MapFetcher::new(
        ExtractorTier::Primary,
        &[
            ("https://a.example/http3", long_body("alpha").as_str()),
            ("https://b.example/quic", long_body("beta").as_str()),
        ],
    );

    let pipeline = scenario.build(llm.clone(), embedder.clone(), provider, vec![primary]);
    let outcome = pipeline.run("What is HTTP/3?", None).await.unwrap();

    assert_eq!(outcome.iterations, 1);
    // top_k_sum = 0.5 over 2 summaries selects exactly one source.
    assert_eq!(outcome.report.sources.len(), 1);
    assert!(outcome.rendered.contains("[Source 1]"));
    assert!(outcome.rendered.contains("## Sources"));
    assert!(!outcome.report.sections.is_empty());

    // Exactly one embedding batch call for query + 2 summaries = 3 texts.
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(*embedder.batch_sizes.lock().unwrap(), vec![3]);

    // Every citation in the rendered report resolves to a source entry.
    let citation = regex::Regex::new(r"\[Source (\d+)\]").unwrap();
    for caps in citation.captures_iter(&outcome.rendered) {
        let n: usize = caps[1].parse().unwrap();
        assert!(outcome.report.sources.iter().any(|s| s.number == n));
    }

    // max_iterations = 1: the reflector is never invoked.
    assert_eq!(llm.reflect_calls.load(Ordering::SeqCst), 0);

    // The report file exists.
    assert!(outcome.report_path.exists());
}

/// Scenario B: reflection re-entry.
///
/// Two iterations: the reflector reports a gap with one follow-up query,
/// SEARCH runs twice, summaries accumulate, ASSEMBLE runs once.
#[tokio::test]
async fn scenario_b_reflection_reentry() {
    let mut scenario = Scenario::new();
    scenario.config.max_iterations = 2;
    scenario.config.top_k_url = 1.0;

    let llm = StubLlm::new(
        "Everything about HTTP/3 [Source 1].",
        vec![r#"{
            "is_complete": false,
            "confidence": 0.4,
            "missing_information": ["deployment statistics"],
            "additional_queries": [{"query": "http/3 adoption", "purpose": "stats", "priority": 1}],
            "rationale": "missing adoption data"
        }"#
        .to_string()],
    );
    let embedder = CountingEmbedder::new();
    let provider = StubSearch::new(vec![
        vec![result("https://a.example/http3", 1)],
        vec![result("https://e.example/adoption", 1)],
    ]);
    let primary = MapFetcher::new(
        ExtractorTier::Primary,
        &[
            ("https://a.example/http3", long_body("alpha").as_str()),
            ("https://e.example/adoption", long_body("epsilon").as_str()),
        ],
    );

    let pipeline = scenario.build(llm.clone(), embedder.clone(), provider, vec![primary]);
    let outcome = pipeline.run("What is HTTP/3?", None).await.unwrap();

    assert_eq!(outcome.iterations, 2);
    assert_eq!(llm.reflect_calls.load(Ordering::SeqCst), 1);
    // Both iterations' summaries reached assembly: one batch call with
    // query + 2 summaries.
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(*embedder.batch_sizes.lock().unwrap(), vec![3]);
}

/// Scenario C: zero results on iteration one aborts with `NoResults`.
#[tokio::test]
async fn scenario_c_zero_results() {
    let scenario = Scenario::new();
    let llm = StubLlm::new("never generated", Vec::new());
    let embedder = CountingEmbedder::new();
    let provider = StubSearch::new(vec![Vec::new()]);
    let primary = MapFetcher::new(ExtractorTier::Primary, &[]);

    let output_dir = scenario.config.output_dir.clone();
    let pipeline = scenario.build(llm, embedder.clone(), provider, vec![primary]);
    let err = pipeline.run("What is HTTP/3?", None).await.unwrap_err();

    assert!(matches!(err, PipelineError::NoResults));
    assert_eq!(err.exit_code(), 3);
    // No report file was created.
    let entries: Vec<_> = std::fs::read_dir(&output_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("report_"))
        .collect();
    assert!(entries.is_empty());
    // Assembly never ran.
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
}

/// Scenario D: scraper tier fallback.
///
/// The primary tier yields an undersized body for one URL; fallback-1
/// provides valid Markdown, the content records `fallback1`, and the
/// aggregate counter shows one fallback-1 use.
#[tokio::test]
async fn scenario_d_scraper_fallback() {
    let primary = MapFetcher::new(
        ExtractorTier::Primary,
        &[
            ("https://a.example/1", long_body("one").as_str()),
            ("https://b.example/2", "too short"),
            ("https://c.example/3", long_body("three").as_str()),
        ],
    );
    let fallback1 = MapFetcher::new(
        ExtractorTier::Fallback1,
        &[("https://b.example/2", long_body("two rescued").as_str())],
    );

    let scraper = Scraper::with_fetchers(
        vec![primary, fallback1],
        Arc::new(ScrapeCache::new()),
        4,
    );

    let urls: Vec<String> = vec![
        "https://a.example/1".into(),
        "https://b.example/2".into(),
        "https://c.example/3".into(),
    ];
    let results = scraper
        .scrape_many(&urls, &tokio_util::sync::CancellationToken::new())
        .await;

    assert_eq!(results.len(), 3);
    assert_eq!(
        results["https://b.example/2"].extractor_tier,
        ExtractorTier::Fallback1
    );
    assert_eq!(
        results["https://a.example/1"].extractor_tier,
        ExtractorTier::Primary
    );

    let stats = scraper.stats();
    assert_eq!(stats.primary_uses, 2);
    assert_eq!(stats.fallback1_uses, 1);
    assert_eq!(stats.fallback_uses(), 1);
}

/// Boundary: `top_k_url = 0.0001` with several results scrapes exactly one
/// URL; `top_k_url = 1.0` scrapes all of them.
#[tokio::test]
async fn boundary_top_k_url_ratios() {
    for (ratio, expected_scrapes) in [(0.0001, 1usize), (1.0, 4usize)] {
        let mut scenario = Scenario::new();
        scenario.config.top_k_url = ratio;
        scenario.config.top_k_sum = 1.0;

        let llm = StubLlm::new("Report [Source 1].", Vec::new());
        let embedder = CountingEmbedder::new();
        let provider = StubSearch::new(vec![vec![
            result("https://a.example/1", 1),
            result("https://b.example/2", 2),
            result("https://c.example/3", 3),
            result("https://d.example/4", 4),
        ]]);
        let bodies = [
            ("https://a.example/1", long_body("a")),
            ("https://b.example/2", long_body("b")),
            ("https://c.example/3", long_body("c")),
            ("https://d.example/4", long_body("d")),
        ];
        let body_refs: Vec<(&str, &str)> =
            bodies.iter().map(|(u, b)| (*u, b.as_str())).collect();
        let primary = MapFetcher::new(ExtractorTier::Primary, &body_refs);

        let pipeline = scenario.build(llm, embedder.clone(), provider, vec![primary]);
        let outcome = pipeline.run("What is HTTP/3?", None).await.unwrap();

        // Summary count equals scraped count; with top_k_sum = 1.0 all of
        // them become sources.
        assert_eq!(
            outcome.report.sources.len(),
            expected_scrapes,
            "ratio {ratio}"
        );
    }
}

/// Domain exclusion holds even when the provider ignores the hint.
#[tokio::test]
async fn boundary_exclude_domains_post_filter() {
    let mut scenario = Scenario::new();
    scenario.config.exclude_domains = "example.com".into();
    scenario.config.top_k_url = 1.0;
    scenario.config.top_k_sum = 1.0;

    let llm = StubLlm::new("Report [Source 1].", Vec::new());
    let embedder = CountingEmbedder::new();
    // The provider ignores the exclusion hint and returns example.com URLs.
    let provider = StubSearch::new(vec![vec![
        result("https://example.com/spam", 1),
        result("https://keep.example.org/good", 2),
    ]]);
    let good_body = long_body("good");
    let primary = MapFetcher::new(
        ExtractorTier::Primary,
        &[("https://keep.example.org/good", good_body.as_str())],
    );

    let pipeline = scenario.build(llm, embedder, provider, vec![primary]);
    let outcome = pipeline.run("What is HTTP/3?", None).await.unwrap();

    assert_eq!(outcome.report.sources.len(), 1);
    assert_eq!(outcome.report.sources[0].url, "https://keep.example.org/good");
}
