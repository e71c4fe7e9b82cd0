use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use roadreel_core::CorrectionOutcome;
use roadreel_correct::{
    report_recent_runs, resolve_story, run_batch, validate_database, CorrectionConfig,
    LocatorResolution, StorySelection,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "roadreel")]
#[command(about = "Validate and repair story locators in the story database")]
struct Cli {
    /// Answer searches from captured listings under this directory instead of the live API.
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,
    /// Story database path (overrides STORY_DB_PATH).
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check every story's locators without touching the network.
    Validate {
        /// Print every story, not only the ones with problems.
        #[arg(long)]
        all: bool,
    },
    /// Resolve a single story, correcting its locator when it is unusable.
    Correct { id: u64 },
    /// Correct stories in bulk and write a run report.
    Batch {
        /// Also re-run stories whose locator is already valid.
        #[arg(long)]
        all: bool,
        /// Restrict the run to these story ids.
        #[arg(long = "id")]
        ids: Vec<u64>,
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Summarize the most recent batch runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn describe(outcome: &CorrectionOutcome) -> String {
    match (outcome.corrected_url(), outcome.failure_category()) {
        (Some(url), _) => format!(
            "story {}: corrected via {} (confidence {:.3}) -> {}{}",
            outcome.story_id,
            outcome.method_used().map(|m| m.as_str()).unwrap_or("?"),
            outcome.confidence().unwrap_or_default(),
            url,
            outcome
                .video_url()
                .map(|v| format!(" [media {v}]"))
                .unwrap_or_default()
        ),
        (None, category) => format!(
            "story {}: correction failed ({}): {}",
            outcome.story_id,
            category.map(|c| c.as_str()).unwrap_or("unknown_error"),
            outcome.failure_reasons.join("; ")
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = CorrectionConfig::from_env();
    if let Some(dir) = cli.fixtures {
        config.fixtures_dir = Some(dir);
    }
    if let Some(db) = cli.db {
        config.story_db_path = db;
    }

    match cli.command.unwrap_or(Commands::Validate { all: false }) {
        Commands::Validate { all } => {
            let reports = validate_database(&config).await?;
            let invalid = reports.iter().filter(|r| !r.all_valid).count();
            for report in reports.iter().filter(|r| all || !r.all_valid) {
                for field in &report.fields {
                    println!(
                        "story {} {}: {}",
                        report.story_id,
                        field.field,
                        field.check.reason().unwrap_or_else(|| "ok".to_string())
                    );
                }
            }
            println!("validated {} stories, {} with locator problems", reports.len(), invalid);
        }
        Commands::Correct { id } => {
            let corrector = config.build_corrector()?;
            match resolve_story(&config, &corrector, id).await? {
                LocatorResolution::AlreadyValid { url } => {
                    println!("story {id}: locator already valid: {url}")
                }
                LocatorResolution::Attempted(outcome) => println!("{}", describe(&outcome)),
            }
        }
        Commands::Batch { all, ids, concurrency } => {
            if let Some(concurrency) = concurrency {
                config.batch_concurrency = concurrency;
            }
            let selection = if !ids.is_empty() {
                StorySelection::Ids(ids)
            } else if all {
                StorySelection::All
            } else {
                StorySelection::NeedsCorrection
            };
            let corrector = config.build_corrector()?;
            let run = run_batch(&config, &corrector, &selection).await?;
            if run.summary.total_attempted == 0 {
                warn!("no stories selected for correction");
            }
            for outcome in &run.summary.outcomes {
                println!("{}", describe(outcome));
            }
            println!(
                "batch complete: run_id={} attempted={} corrected={} (tier1={} tier2={}) \
                 failed={} categories={} report={}",
                run.summary.run_id,
                run.summary.total_attempted,
                run.summary.successful_corrections,
                run.summary.tier1_success,
                run.summary.tier2_success,
                run.summary.failures,
                serde_json::to_string(&run.summary.failure_categories)?,
                run.report_dir.display()
            );
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_runs(&config.reports_dir(), runs)?);
        }
    }

    Ok(())
}
