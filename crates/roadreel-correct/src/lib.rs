//! Story locator correction: validation, term extraction, scoring, the two-tier
//! corrector and batch runs over the persisted story database.

pub mod batch;
pub mod classify;
pub mod corrector;
pub mod locator;
pub mod scoring;
pub mod terms;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use roadreel_adapters::{FixtureSearchProvider, RedditClient, DEFAULT_BASE_URL};
use roadreel_core::StoryRecord;
use roadreel_storage::{HttpClientConfig, HttpFetcher, SavedDatabase, StoryStore};
use tracing::info;

pub use batch::{report_recent_runs, summarize, write_batch_report, BatchSummary};
pub use classify::{categorize_failure, FailureClassifier};
pub use corrector::{extract_category, Corrector, LocatorResolution};
pub use locator::{
    validate, validate_story_locators, LocatorCheck, LocatorIssue, LocatorKind, StoryLocatorReport,
};
pub use scoring::{
    best_match, engagement_similarity, score_candidate, title_similarity, MatchProfile,
};
pub use terms::{extract_broadened_terms, extract_precise_terms};

pub const CRATE_NAME: &str = "roadreel-correct";

#[derive(Debug, Clone)]
pub struct CorrectionConfig {
    pub story_db_path: PathBuf,
    pub backups_dir: PathBuf,
    pub reddit_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub batch_concurrency: usize,
    pub requests_per_minute: Option<u32>,
    pub workspace_root: PathBuf,
    /// Answer searches from captured listings instead of the live API.
    pub fixtures_dir: Option<PathBuf>,
}

impl CorrectionConfig {
    pub fn from_env() -> Self {
        Self {
            story_db_path: std::env::var("STORY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./story_database.json")),
            backups_dir: std::env::var("ROADREEL_BACKUPS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./backups")),
            reddit_base_url: std::env::var("REDDIT_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            user_agent: std::env::var("ROADREEL_USER_AGENT")
                .unwrap_or_else(|_| "VideoGeneration/1.0".to_string()),
            http_timeout_secs: std::env::var("ROADREEL_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            batch_concurrency: std::env::var("ROADREEL_BATCH_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            requests_per_minute: std::env::var("ROADREEL_REQUESTS_PER_MINUTE")
                .ok()
                .and_then(|v| v.parse().ok()),
            workspace_root: std::env::var("ROADREEL_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            fixtures_dir: std::env::var("ROADREEL_FIXTURES_DIR").ok().map(PathBuf::from),
        }
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }

    pub fn story_store(&self) -> StoryStore {
        StoryStore::new(self.story_db_path.clone(), self.backups_dir.clone())
    }

    /// Live Reddit corrector, or a fixture-backed one when `fixtures_dir` is set.
    pub fn build_corrector(&self) -> Result<Corrector> {
        let classifier = FailureClassifier::from_workspace_root(&self.workspace_root)?;
        let corrector = match &self.fixtures_dir {
            Some(dir) => {
                info!(dir = %dir.display(), "answering searches from fixtures");
                let provider = FixtureSearchProvider::new(dir.clone());
                Corrector::new(Box::new(provider.clone()), Box::new(provider))
            }
            None => {
                let http = HttpFetcher::new(HttpClientConfig {
                    timeout: Duration::from_secs(self.http_timeout_secs),
                    user_agent: Some(self.user_agent.clone()),
                    max_in_flight: self.batch_concurrency.max(1),
                    requests_per_minute: self.requests_per_minute,
                })
                .context("building http client")?;
                let client = RedditClient::new(Arc::new(http), self.reddit_base_url.clone());
                Corrector::new(Box::new(client.clone()), Box::new(client))
            }
        };
        Ok(corrector.with_classifier(classifier))
    }
}

/// A story needs correction when neither its primary locator nor an earlier
/// correction is a valid post locator.
pub fn needs_correction(story: &StoryRecord) -> bool {
    let valid = |url: &Option<String>| url.as_deref().map(|u| validate(u).valid).unwrap_or(false);
    !valid(&story.url) && !valid(&story.corrected_url)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorySelection {
    NeedsCorrection,
    All,
    Ids(Vec<u64>),
}

impl StorySelection {
    fn select(&self, stories: &[StoryRecord]) -> Vec<StoryRecord> {
        stories
            .iter()
            .filter(|s| match self {
                Self::NeedsCorrection => needs_correction(s),
                Self::All => true,
                Self::Ids(ids) => ids.contains(&s.id),
            })
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct BatchRun {
    pub summary: BatchSummary,
    pub saved: SavedDatabase,
    pub report_dir: PathBuf,
}

/// Load the story database, correct the selected stories, write every outcome
/// back, save, and emit the run report.
pub async fn run_batch(
    config: &CorrectionConfig,
    corrector: &Corrector,
    selection: &StorySelection,
) -> Result<BatchRun> {
    let store = config.story_store();
    let mut db = store.load().await?;
    let stories = selection.select(&db.stories);
    if let StorySelection::Ids(ids) = selection {
        for id in ids {
            if db.story(*id).is_none() {
                anyhow::bail!("story {id} not found in {}", store.path().display());
            }
        }
    }

    let summary = corrector.correct_batch(&stories, config.batch_concurrency).await;
    for outcome in &summary.outcomes {
        db.apply_outcome(outcome)
            .with_context(|| format!("applying outcome for story {}", outcome.story_id))?;
    }
    let saved = store.save(&db, summary.finished_at).await?;
    let report_dir = write_batch_report(&config.reports_dir(), &summary).await?;
    Ok(BatchRun {
        summary,
        saved,
        report_dir,
    })
}

/// Resolve one story by id, persisting the outcome when a correction ran.
pub async fn resolve_story(
    config: &CorrectionConfig,
    corrector: &Corrector,
    story_id: u64,
) -> Result<LocatorResolution> {
    let store = config.story_store();
    let mut db = store.load().await?;
    let story = db
        .story(story_id)
        .cloned()
        .with_context(|| format!("story {story_id} not found in {}", store.path().display()))?;

    let resolution = corrector.resolve(&story).await;
    if let LocatorResolution::Attempted(outcome) = &resolution {
        db.apply_outcome(outcome)?;
        store.save(&db, outcome.attempted_at).await?;
    }
    Ok(resolution)
}

/// Locator checks for every story in the database.
pub async fn validate_database(config: &CorrectionConfig) -> Result<Vec<StoryLocatorReport>> {
    let db = config.story_store().load().await?;
    Ok(db.stories.iter().map(validate_story_locators).collect())
}

pub async fn run_batch_from_env(selection: &StorySelection) -> Result<BatchRun> {
    let config = CorrectionConfig::from_env();
    let corrector = config.build_corrector()?;
    run_batch(&config, &corrector, selection).await
}
