//! Configuration for the research pipeline.
//!
//! Uses `figment` for layered configuration: built-in defaults -> optional
//! TOML file -> `RSRCH_`-prefixed environment variables. All options are
//! plain serde fields; `validate()` enforces the constraints that cannot be
//! expressed through types alone.

use crate::error::ConfigError;
use crate::types::ContentType;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Which search provider vendor to use for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchProviderKind {
    #[default]
    Serp,
    Tavily,
    Perplexity,
}

impl std::fmt::Display for SearchProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchProviderKind::Serp => write!(f, "serp"),
            SearchProviderKind::Tavily => write!(f, "tavily"),
            SearchProviderKind::Perplexity => write!(f, "perplexity"),
        }
    }
}

/// Output format for scraped content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Markdown,
    Text,
}

/// Complete pipeline configuration.
///
/// Field names match the recognized option names; environment variables use
/// the `RSRCH_` prefix (e.g. `RSRCH_LLM_API_KEY`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    // LLM provider.
    pub llm_api_key: String,
    pub llm_endpoint: String,
    pub default_model: String,
    pub llm_max_retries: u32,
    pub prompt_policy_include: bool,

    // Per-stage model overrides; `None` falls back to `default_model`.
    pub intent_model: Option<String>,
    pub planner_model: Option<String>,
    pub context_model: Option<String>,
    pub reflection_model: Option<String>,
    pub report_model: Option<String>,
    pub verify_model: Option<String>,

    // Summarizer model routing.
    pub mrs_default: Option<String>,
    pub mrs_code: Option<String>,
    pub mrs_research: Option<String>,
    pub mrs_news: Option<String>,
    pub mrs_documentation: Option<String>,
    pub mrs_general: Option<String>,

    // Search.
    pub search_provider: SearchProviderKind,
    pub serp_api_key: Option<String>,
    pub tavily_api_key: Option<String>,
    pub perplexity_api_key: Option<String>,
    /// Comma-separated domains excluded from all searches.
    pub exclude_domains: String,
    pub search_results_per_query: usize,

    // Ranking ratios, both in (0.0, 1.0].
    pub top_k_url: f64,
    pub top_k_sum: f64,

    // Vector store and embeddings.
    pub vector_db_path: PathBuf,
    pub embedding_model: String,

    // External reranker.
    pub use_reranker: bool,
    pub reranker_url: Option<String>,
    pub reranker_model: Option<String>,
    pub reranker_api_key: Option<String>,

    // Claim verification.
    pub verify_claims: bool,
    pub verify_threshold: f64,

    // Iteration and report bounds.
    pub max_iterations: u32,
    pub report_max_tokens: u32,

    // Stage concurrency.
    pub search_parallel: usize,
    pub scrape_parallel: usize,
    pub summary_parallel: usize,

    // Scraper behavior.
    pub output_format: OutputFormat,
    pub preserve_tables: bool,

    // Summarizer table handling.
    pub enable_table_aware: bool,
    pub table_topk_rows: usize,
    pub table_max_rows_verbatim: usize,
    pub table_max_cols_verbatim: usize,

    // Extra domains for the content classifier, comma-separated.
    pub content_domains_research: String,
    pub content_domains_code: String,
    pub content_domains_news: String,

    // Output.
    pub output_dir: PathBuf,
}

/// Split a comma-separated domain list into cleaned lowercase hosts.
fn split_domains(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|d| d.trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .collect()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            llm_api_key: String::new(),
            llm_endpoint: "https://api.openai.com/v1".to_string(),
            default_model: "gpt-4o-mini".to_string(),
            llm_max_retries: 3,
            prompt_policy_include: true,

            intent_model: None,
            planner_model: None,
            context_model: None,
            reflection_model: None,
            report_model: None,
            verify_model: None,

            mrs_default: None,
            mrs_code: None,
            mrs_research: None,
            mrs_news: None,
            mrs_documentation: None,
            mrs_general: None,

            search_provider: SearchProviderKind::Serp,
            serp_api_key: None,
            tavily_api_key: None,
            perplexity_api_key: None,
            exclude_domains: String::new(),
            search_results_per_query: 10,

            top_k_url: 0.3,
            top_k_sum: 0.5,

            vector_db_path: PathBuf::from("./research_db.sqlite"),
            embedding_model: "text-embedding-3-small".to_string(),

            use_reranker: false,
            reranker_url: None,
            reranker_model: None,
            reranker_api_key: None,

            verify_claims: false,
            verify_threshold: 0.7,

            max_iterations: 2,
            report_max_tokens: 4000,

            search_parallel: 1,
            scrape_parallel: 5,
            summary_parallel: 1,

            output_format: OutputFormat::Markdown,
            preserve_tables: true,

            enable_table_aware: true,
            table_topk_rows: 10,
            table_max_rows_verbatim: 15,
            table_max_cols_verbatim: 8,

            content_domains_research: String::new(),
            content_domains_code: String::new(),
            content_domains_news: String::new(),

            output_dir: PathBuf::from("./reports"),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from defaults, an optional TOML file, and the
    /// environment. The loaded config is validated before being returned.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(PipelineConfig::default()));
        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("RSRCH_"));

        let config: PipelineConfig = figment.extract().map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate option constraints. Returns the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.llm_api_key.is_empty() {
            return Err(ConfigError::MissingKey {
                key: "llm_api_key".into(),
            });
        }

        for (key, value) in [("top_k_url", self.top_k_url), ("top_k_sum", self.top_k_sum)] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    reason: format!("{value} is outside (0.0, 1.0]"),
                });
            }
        }

        if self.max_iterations < 1 {
            return Err(ConfigError::InvalidValue {
                key: "max_iterations".into(),
                reason: "must be at least 1".into(),
            });
        }

        for (key, value) in [
            ("search_parallel", self.search_parallel),
            ("scrape_parallel", self.scrape_parallel),
            ("summary_parallel", self.summary_parallel),
        ] {
            if value < 1 {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    reason: "must be at least 1".into(),
                });
            }
            if value > 32 {
                warn!(option = key, value, "parallelism above 32; proceeding anyway");
            }
        }
        if self.summary_parallel > 4 {
            warn!(
                summary_parallel = self.summary_parallel,
                "summary_parallel > 4 multiplies LLM spend linearly"
            );
        }

        if !(0.0..=1.0).contains(&self.verify_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "verify_threshold".into(),
                reason: format!("{} is outside [0.0, 1.0]", self.verify_threshold),
            });
        }

        if self.use_reranker && (self.reranker_url.is_none() || self.reranker_model.is_none()) {
            return Err(ConfigError::InvalidValue {
                key: "use_reranker".into(),
                reason: "reranker_url and reranker_model are required when enabled".into(),
            });
        }

        Ok(())
    }

    /// The API key for the configured search provider, if set.
    pub fn search_api_key(&self) -> Option<&str> {
        match self.search_provider {
            SearchProviderKind::Serp => self.serp_api_key.as_deref(),
            SearchProviderKind::Tavily => self.tavily_api_key.as_deref(),
            SearchProviderKind::Perplexity => self.perplexity_api_key.as_deref(),
        }
    }

    /// Excluded domains as a cleaned list of lowercase hosts.
    pub fn excluded_domains(&self) -> Vec<String> {
        split_domains(&self.exclude_domains)
    }

    /// Extra content-classifier domains: (research, code, news).
    pub fn content_domain_extensions(&self) -> (Vec<String>, Vec<String>, Vec<String>) {
        (
            split_domains(&self.content_domains_research),
            split_domains(&self.content_domains_code),
            split_domains(&self.content_domains_news),
        )
    }

    /// Model for the summarizer given a detected content type.
    ///
    /// Fall-through order: content-specific route -> `mrs_general` ->
    /// `mrs_default` -> `default_model`.
    pub fn summarizer_model(&self, content_type: ContentType) -> &str {
        let specific = match content_type {
            ContentType::Code => self.mrs_code.as_deref(),
            ContentType::Research => self.mrs_research.as_deref(),
            ContentType::News => self.mrs_news.as_deref(),
            ContentType::Documentation => self.mrs_documentation.as_deref(),
            ContentType::General => self.mrs_general.as_deref(),
        };
        specific
            .or(self.mrs_general.as_deref())
            .or(self.mrs_default.as_deref())
            .unwrap_or(&self.default_model)
    }

    pub fn intent_model(&self) -> &str {
        self.intent_model.as_deref().unwrap_or(&self.default_model)
    }

    pub fn planner_model(&self) -> &str {
        self.planner_model.as_deref().unwrap_or(&self.default_model)
    }

    pub fn context_model(&self) -> &str {
        self.context_model.as_deref().unwrap_or(&self.default_model)
    }

    pub fn reflection_model(&self) -> &str {
        self.reflection_model
            .as_deref()
            .unwrap_or(&self.default_model)
    }

    pub fn report_model(&self) -> &str {
        self.report_model.as_deref().unwrap_or(&self.default_model)
    }

    pub fn verify_model(&self) -> &str {
        self.verify_model.as_deref().unwrap_or(&self.default_model)
    }

    /// Create the output and database directories if missing.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        if let Some(parent) = self.vector_db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> PipelineConfig {
        PipelineConfig {
            llm_api_key: "sk-test".into(),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.search_results_per_query, 10);
        assert!((config.top_k_url - 0.3).abs() < f64::EPSILON);
        assert!((config.top_k_sum - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.max_iterations, 2);
        assert_eq!(config.llm_max_retries, 3);
        assert_eq!(config.scrape_parallel, 5);
        assert_eq!(config.summary_parallel, 1);
        assert_eq!(config.table_topk_rows, 10);
        assert_eq!(config.table_max_rows_verbatim, 15);
        assert_eq!(config.table_max_cols_verbatim, 8);
        assert!((config.verify_threshold - 0.7).abs() < f64::EPSILON);
        assert!(config.prompt_policy_include);
        assert!(config.preserve_tables);
    }

    #[test]
    fn test_validate_requires_api_key() {
        let config = PipelineConfig::default();
        match config.validate() {
            Err(ConfigError::MissingKey { key }) => assert_eq!(key, "llm_api_key"),
            other => panic!("Expected MissingKey, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_ratio_bounds() {
        let mut config = valid_config();
        config.top_k_url = 0.0;
        assert!(config.validate().is_err());

        config.top_k_url = 1.0;
        assert!(config.validate().is_ok());

        config.top_k_url = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_parallelism() {
        let mut config = valid_config();
        config.scrape_parallel = 0;
        assert!(config.validate().is_err());

        // Above 32 is accepted (with a warning).
        config.scrape_parallel = 64;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_max_iterations() {
        let mut config = valid_config();
        config.max_iterations = 0;
        assert!(config.validate().is_err());
        config.max_iterations = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_reranker_requires_url_and_model() {
        let mut config = valid_config();
        config.use_reranker = true;
        assert!(config.validate().is_err());

        config.reranker_url = Some("http://localhost:9000/rerank".into());
        config.reranker_model = Some("rerank-1".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_excluded_domains_parsing() {
        let mut config = valid_config();
        config.exclude_domains = "Example.com, pinterest.com ,, ".into();
        assert_eq!(
            config.excluded_domains(),
            vec!["example.com".to_string(), "pinterest.com".to_string()]
        );
    }

    #[test]
    fn test_summarizer_model_routing_specific() {
        let mut config = valid_config();
        config.mrs_code = Some("code-model".into());
        config.mrs_general = Some("general-model".into());
        config.mrs_default = Some("routed-default".into());

        assert_eq!(config.summarizer_model(ContentType::Code), "code-model");
        // No news route configured: falls through to mrs_general.
        assert_eq!(config.summarizer_model(ContentType::News), "general-model");
    }

    #[test]
    fn test_summarizer_model_routing_fallthrough() {
        let mut config = valid_config();
        config.mrs_default = Some("routed-default".into());
        // No specific or general routes: mrs_default wins.
        assert_eq!(
            config.summarizer_model(ContentType::Research),
            "routed-default"
        );

        config.mrs_default = None;
        // Nothing configured: the pipeline default model.
        assert_eq!(
            config.summarizer_model(ContentType::Documentation),
            "gpt-4o-mini"
        );
    }

    #[test]
    fn test_stage_model_overrides() {
        let mut config = valid_config();
        assert_eq!(config.planner_model(), "gpt-4o-mini");
        config.planner_model = Some("gpt-4o".into());
        assert_eq!(config.planner_model(), "gpt-4o");
    }

    #[test]
    fn test_search_api_key_selection() {
        let mut config = valid_config();
        config.serp_api_key = Some("serp-key".into());
        config.tavily_api_key = Some("tavily-key".into());

        assert_eq!(config.search_api_key(), Some("serp-key"));
        config.search_provider = SearchProviderKind::Tavily;
        assert_eq!(config.search_api_key(), Some("tavily-key"));
        config.search_provider = SearchProviderKind::Perplexity;
        assert_eq!(config.search_api_key(), None);
    }
}
