//! Error types for the research pipeline core.
//!
//! Uses `thiserror` for public API error types, one enum per domain with a
//! top-level `PipelineError` that maps onto the process exit codes used by
//! the CLI.

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Embedding generation failed: {message}")]
    EmbeddingUnavailable { message: String },

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("No search results found on the first iteration")]
    NoResults,

    #[error("Scrape error: {0}")]
    Scrape(#[from] ScrapeError),

    #[error("Research planning failed: {reason}")]
    PlanningFailed { reason: String },

    #[error("Vector store error: {0}")]
    Store(#[from] StoreError),

    #[error("Claim verification unavailable: {message}")]
    VerifyUnavailable { message: String },

    #[error("Pipeline cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Map the error onto the documented process exit code.
    ///
    /// 2 = configuration error, 3 = no search results on iteration one,
    /// 4 = LLM unavailable after retries, 5 = any other failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) => 2,
            PipelineError::NoResults => 3,
            PipelineError::Llm(LlmError::Unavailable { .. }) => 4,
            PipelineError::Llm(LlmError::AuthFailed { .. }) => 4,
            _ => 5,
        }
    }
}

/// Errors from configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required option: {key}")]
    MissingKey { key: String },

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Configuration parse error: {message}")]
    Parse { message: String },
}

/// Errors from the LLM gateway.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// All retries exhausted. Carries the last raw response, truncated to
    /// 500 characters, for diagnosis.
    #[error("LLM unavailable after {attempts} attempt(s): {last_response}")]
    Unavailable {
        attempts: u32,
        last_response: String,
    },

    #[error("Authentication failed for LLM provider: {message}")]
    AuthFailed { message: String },

    #[error("LLM returned invalid JSON: {message}")]
    InvalidJson { message: String },
}

/// Errors from search providers.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Search provider '{provider}' request failed: {message}")]
    RequestFailed { provider: String, message: String },

    #[error("Search provider '{provider}' returned an unexpected response: {message}")]
    BadResponse { provider: String, message: String },

    #[error("Missing API key for search provider '{provider}'")]
    MissingApiKey { provider: String },
}

/// Errors from the scraper tiers.
#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("HTTP {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Request failed for {url}: {message}")]
    Request { url: String, message: String },

    #[error("Body below minimum size for {url}: {size} bytes")]
    BodyTooSmall { url: String, size: usize },

    #[error("Timed out after {timeout_secs}s fetching {url}")]
    Timeout { url: String, timeout_secs: u64 },

    #[error("All scraper tiers failed for {url}")]
    AllTiersFailed { url: String },
}

/// Errors from the vector store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database {
            message: err.to_string(),
        }
    }
}

/// A type alias for results using the top-level `PipelineError`.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Truncate a raw model response for inclusion in error messages.
pub(crate) fn truncate_response(raw: &str, max_chars: usize) -> String {
    if raw.chars().count() <= max_chars {
        raw.to_string()
    } else {
        let truncated: String = raw.chars().take(max_chars).collect();
        format!("{truncated}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_config() {
        let err = PipelineError::Config(ConfigError::MissingKey {
            key: "llm_api_key".into(),
        });
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_no_results() {
        assert_eq!(PipelineError::NoResults.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_llm_unavailable() {
        let err = PipelineError::Llm(LlmError::Unavailable {
            attempts: 3,
            last_response: "".into(),
        });
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_exit_code_other() {
        let err = PipelineError::PlanningFailed {
            reason: "empty sections".into(),
        };
        assert_eq!(err.exit_code(), 5);
        assert_eq!(PipelineError::Cancelled.exit_code(), 5);
    }

    #[test]
    fn test_error_display() {
        let err = PipelineError::Search(SearchError::MissingApiKey {
            provider: "serp".into(),
        });
        assert_eq!(
            err.to_string(),
            "Search error: Missing API key for search provider 'serp'"
        );

        let err = ScrapeError::BodyTooSmall {
            url: "https://example.com".into(),
            size: 42,
        };
        assert_eq!(
            err.to_string(),
            "Body below minimum size for https://example.com: 42 bytes"
        );
    }

    #[test]
    fn test_truncate_response() {
        assert_eq!(truncate_response("short", 500), "short");
        let long = "x".repeat(600);
        let truncated = truncate_response(&long, 500);
        assert_eq!(truncated.chars().count(), 501);
        assert!(truncated.ends_with('…'));
    }
}
