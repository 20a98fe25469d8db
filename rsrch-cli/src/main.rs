//! rsrch CLI — generate a cited research report for a query.

use clap::Parser;
use rsrch_core::pipeline::{PipelineObserver, ResearchPipeline};
use rsrch_core::types::ResearchPlan;
use rsrch_core::PipelineConfig;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Research pipeline: generate comprehensive cited reports from queries.
#[derive(Parser, Debug)]
#[command(name = "rsrch", version, about, long_about = None)]
struct Cli {
    /// Research query to investigate
    query: String,

    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output directory for reports (overrides config)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Logging level
    #[arg(long, default_value = "INFO", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR"])]
    log_level: String,

    /// Display the research plan before proceeding
    #[arg(long)]
    show_plan: bool,
}

struct PlanPrinter {
    show_plan: bool,
}

impl PipelineObserver for PlanPrinter {
    fn on_plan(&self, plan: &ResearchPlan) {
        if !self.show_plan {
            return;
        }
        println!("\nResearch plan ({} sections):", plan.sections.len());
        for section in &plan.sections {
            println!("  - {section}");
        }
        println!("Search queries:");
        for query in &plan.search_queries {
            println!("  [p{}] {} ({})", query.priority, query.text, query.purpose);
        }
        if !plan.rationale.is_empty() {
            println!("Rationale: {}\n", plan.rationale);
        }
    }
}

fn setup_logging(level: &str) -> tracing_appender::non_blocking::WorkerGuard {
    let filter = match level {
        "DEBUG" => "debug",
        "WARNING" => "warn",
        "ERROR" => "error",
        _ => "info",
    };

    // Human-readable layer on stderr plus a JSON file log.
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let file_appender = tracing_appender::rolling::never(".", "rsrch.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() {
    // Load .env if present before reading configuration.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _guard = setup_logging(&cli.log_level);

    let exit_code = run(cli).await;
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> i32 {
    let mut config = match PipelineConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "Configuration error");
            eprintln!("Error: {err}");
            return 2;
        }
    };
    if let Some(output) = cli.output {
        config.output_dir = output;
    }

    let pipeline = match ResearchPipeline::new(config) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            tracing::error!(error = %err, "Failed to initialize pipeline");
            eprintln!("Error: {err}");
            return err.exit_code();
        }
    };

    let observer = PlanPrinter {
        show_plan: cli.show_plan,
    };

    // Ctrl-C cancels the run cooperatively at the next suspension point.
    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted; finishing in-flight work…");
            cancel.cancel();
        }
    });

    println!("Researching: {}\n", cli.query);
    match pipeline.run(&cli.query, Some(&observer)).await {
        Ok(outcome) => {
            println!("\nReport saved to: {}", outcome.report_path.display());
            if let Some(verification) = &outcome.verification {
                println!(
                    "Verification: {}/{} claims supported, {} flagged",
                    verification.supported,
                    verification.total_claims,
                    verification.flagged.len()
                );
            }

            // First 500 characters as a preview.
            let preview: String = outcome.rendered.chars().take(500).collect();
            let ellipsis = if outcome.rendered.chars().count() > 500 {
                "…"
            } else {
                ""
            };
            println!("\nPreview:\n{}\n{preview}{ellipsis}", "-".repeat(60));
            0
        }
        Err(err) => {
            tracing::error!(error = %err, "Pipeline failed");
            eprintln!("\nError: {err}");
            err.exit_code()
        }
    }
}
