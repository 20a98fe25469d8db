//! rsrch-core — cited research report pipeline.
//!
//! Orchestrates external search providers, web scraping, and LLM calls
//! through a fixed multi-stage pipeline with an optional iterative
//! refinement loop:
//!
//! query -> intent -> plan -> search -> rerank -> scrape -> summarize ->
//! reflect(-> loop) -> assemble -> report(-> verify)
//!
//! The entry point is [`pipeline::ResearchPipeline`]; everything else is a
//! stage behind a narrow interface so it can be exercised (and replaced)
//! independently.

pub mod config;
pub mod content_type;
pub mod embeddings;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod rerank;
pub mod report;
pub mod scrape;
pub mod search;
pub mod stages;
pub mod types;
pub mod vector_store;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipeline::{PipelineObserver, PipelineOutcome, PipelineStage, ResearchPipeline};
pub use types::{Query, Report, ResearchPlan};
