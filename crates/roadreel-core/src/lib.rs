//! Core domain model for roadreel: story records, search candidates and correction outcomes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "roadreel-core";

pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_CORRECTION_FAILED: &str = "correction_failed";
pub const STATUS_PENDING: &str = "pending";

/// A driving-safety anecdote as persisted in the story database.
///
/// The correction fields at the bottom are written by [`StoryDatabase::apply_outcome`]
/// and never read while a correction runs. Keys this model does not know about are
/// carried in `extra` so a load/save cycle leaves them untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryRecord {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upvotes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_upvotes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reddit_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_generated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_correction: Option<CorrectionMetadata>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StoryRecord {
    pub fn new(id: u64, title: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            source: source.into(),
            url: None,
            upvotes: None,
            expected_upvotes: None,
            source_url: None,
            reddit_url: None,
            original_url: None,
            status: None,
            script_generated: None,
            corrected_url: None,
            video_url: None,
            url_correction: None,
            extra: Map::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_upvotes(mut self, upvotes: u64) -> Self {
        self.upvotes = Some(upvotes);
        self
    }

    /// Engagement the matched post is expected to have. Zero counts as "no expectation".
    pub fn engagement_expectation(&self) -> Option<u64> {
        self.upvotes
            .filter(|v| *v > 0)
            .or(self.expected_upvotes.filter(|v| *v > 0))
    }
}

/// One post returned by a search provider. Lives for a single search-and-score cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePost {
    pub title: String,
    pub url: String,
    pub score: i64,
    pub num_comments: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub post: CandidatePost,
    pub confidence: f64,
    pub title_similarity: f64,
    pub engagement_similarity: f64,
}

/// The two search tiers, in the order they are attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CorrectionMethod {
    #[serde(rename = "tier1", alias = "reddit_api_search")]
    PreciseSearch,
    #[serde(rename = "tier2", alias = "content_scraping")]
    BroadenedSearch,
}

impl CorrectionMethod {
    pub const ALL: [CorrectionMethod; 2] = [Self::PreciseSearch, Self::BroadenedSearch];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreciseSearch => "tier1",
            Self::BroadenedSearch => "tier2",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::PreciseSearch => "precise",
            Self::BroadenedSearch => "broadened",
        }
    }
}

impl fmt::Display for CorrectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    NoSearchResults,
    NetworkError,
    #[serde(alias = "subreddit_not_found")]
    CategoryNotFound,
    TitleMismatch,
    #[serde(alias = "upvote_mismatch")]
    EngagementMismatch,
    ParsingError,
    UnknownError,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoSearchResults => "no_search_results",
            Self::NetworkError => "network_error",
            Self::CategoryNotFound => "category_not_found",
            Self::TitleMismatch => "title_mismatch",
            Self::EngagementMismatch => "engagement_mismatch",
            Self::ParsingError => "parsing_error",
            Self::UnknownError => "unknown_error",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::NoSearchResults => "No matching posts found in search",
            Self::NetworkError => "Search API unavailable or network issues",
            Self::CategoryNotFound => "Invalid or non-existent community",
            Self::TitleMismatch => "Found posts but no good title matches",
            Self::EngagementMismatch => "Found posts but engagement doesn't match",
            Self::ParsingError => "Error parsing search API response",
            Self::UnknownError => "Unexpected error during correction attempt",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one tier did: the terms it searched with, how many posts came back,
/// the chosen match (if any) and why it failed otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierReport {
    pub method: CorrectionMethod,
    pub search_terms: Vec<String>,
    pub posts_found: usize,
    pub matched: Option<MatchResult>,
    pub video_url: Option<String>,
    pub errors: Vec<String>,
}

impl TierReport {
    pub fn new(method: CorrectionMethod) -> Self {
        Self {
            method,
            search_terms: Vec::new(),
            posts_found: 0,
            matched: None,
            video_url: None,
            errors: Vec::new(),
        }
    }

    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.errors.push(reason.into());
        self
    }

    pub fn succeeded(&self) -> bool {
        self.matched.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    Corrected {
        corrected_url: String,
        video_url: Option<String>,
        method_used: CorrectionMethod,
        confidence: f64,
    },
    Failed {
        failure_category: FailureCategory,
    },
}

/// The orchestrator's only output. A failure category exists exactly when the
/// resolution is [`Resolution::Failed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionOutcome {
    pub story_id: u64,
    pub original_url: Option<String>,
    pub attempted_at: DateTime<Utc>,
    pub methods_attempted: Vec<CorrectionMethod>,
    pub failure_reasons: Vec<String>,
    pub tiers: Vec<TierReport>,
    pub resolution: Resolution,
}

impl CorrectionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.resolution, Resolution::Corrected { .. })
    }

    pub fn corrected_url(&self) -> Option<&str> {
        match &self.resolution {
            Resolution::Corrected { corrected_url, .. } => Some(corrected_url),
            Resolution::Failed { .. } => None,
        }
    }

    pub fn video_url(&self) -> Option<&str> {
        match &self.resolution {
            Resolution::Corrected { video_url, .. } => video_url.as_deref(),
            Resolution::Failed { .. } => None,
        }
    }

    pub fn method_used(&self) -> Option<CorrectionMethod> {
        match self.resolution {
            Resolution::Corrected { method_used, .. } => Some(method_used),
            Resolution::Failed { .. } => None,
        }
    }

    pub fn confidence(&self) -> Option<f64> {
        match self.resolution {
            Resolution::Corrected { confidence, .. } => Some(confidence),
            Resolution::Failed { .. } => None,
        }
    }

    pub fn failure_category(&self) -> Option<FailureCategory> {
        match self.resolution {
            Resolution::Corrected { .. } => None,
            Resolution::Failed { failure_category } => Some(failure_category),
        }
    }
}

/// The `url_correction` block stored on a story after an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionMetadata {
    pub attempted: bool,
    pub success: bool,
    #[serde(with = "flexible_timestamp")]
    pub attempt_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_used: Option<CorrectionMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods_attempted: Vec<CorrectionMethod>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_category: Option<FailureCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
}

impl CorrectionMetadata {
    pub fn from_outcome(outcome: &CorrectionOutcome) -> Self {
        match &outcome.resolution {
            Resolution::Corrected {
                method_used,
                confidence,
                ..
            } => Self {
                attempted: true,
                success: true,
                attempt_date: outcome.attempted_at,
                method_used: Some(*method_used),
                match_confidence: Some(*confidence),
                methods_attempted: Vec::new(),
                failure_reasons: Vec::new(),
                failure_category: None,
                original_url: outcome.original_url.clone(),
            },
            Resolution::Failed { failure_category } => Self {
                attempted: true,
                success: false,
                attempt_date: outcome.attempted_at,
                method_used: None,
                match_confidence: None,
                methods_attempted: outcome.methods_attempted.clone(),
                failure_reasons: outcome.failure_reasons.clone(),
                failure_category: Some(*failure_category),
                original_url: outcome.original_url.clone(),
            },
        }
    }
}

/// Older databases carry naive local timestamps (`2025-03-01T10:15:00.123456`);
/// those are read as UTC. Everything is written back as RFC 3339.
mod flexible_timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|e| de::Error::custom(format!("invalid attempt_date {raw:?}: {e}")))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlCorrectionStats {
    pub correction_attempted: usize,
    pub correction_succeeded: usize,
    pub correction_failed: usize,
    pub tier1_success: usize,
    pub tier2_success: usize,
    pub success_rate: String,
}

/// Aggregate counters kept under `metadata.tracking`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingStats {
    pub total_stories: usize,
    pub scripts_generated: usize,
    pub failed: usize,
    pub correction_failed: usize,
    pub pending: usize,
    pub url_correction_stats: UrlCorrectionStats,
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking: Option<TrackingStats>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("story {0} not found in database")]
    StoryNotFound(u64),
}

/// The persisted story collection. Mutation happens one record at a time,
/// by id, through [`StoryDatabase::apply_outcome`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoryDatabase {
    #[serde(default)]
    pub metadata: DatabaseMetadata,
    #[serde(default)]
    pub stories: Vec<StoryRecord>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StoryDatabase {
    pub fn story(&self, id: u64) -> Option<&StoryRecord> {
        self.stories.iter().find(|s| s.id == id)
    }

    fn story_mut(&mut self, id: u64) -> Result<&mut StoryRecord, RecordError> {
        self.stories
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(RecordError::StoryNotFound(id))
    }

    /// Write a correction outcome onto its story and refresh the tracking block.
    pub fn apply_outcome(&mut self, outcome: &CorrectionOutcome) -> Result<(), RecordError> {
        let story = self.story_mut(outcome.story_id)?;
        match &outcome.resolution {
            Resolution::Corrected {
                corrected_url,
                video_url,
                ..
            } => {
                story.corrected_url = Some(corrected_url.clone());
                if let Some(video_url) = video_url {
                    story.video_url = Some(video_url.clone());
                }
                // A later success puts a previously failed story back in the queue.
                if story.status.as_deref() == Some(STATUS_CORRECTION_FAILED) {
                    story.status = Some(STATUS_PENDING.to_string());
                }
            }
            Resolution::Failed { .. } => {
                story.status = Some(STATUS_CORRECTION_FAILED.to_string());
                story.script_generated = Some(false);
            }
        }
        story.url_correction = Some(CorrectionMetadata::from_outcome(outcome));
        self.refresh_tracking(outcome.attempted_at);
        Ok(())
    }

    pub fn refresh_tracking(&mut self, now: DateTime<Utc>) {
        let count_status = |status: &str| {
            self.stories
                .iter()
                .filter(|s| s.status.as_deref() == Some(status))
                .count()
        };
        let completed = count_status(STATUS_COMPLETED);
        let failed = count_status(STATUS_FAILED);
        let correction_failed = count_status(STATUS_CORRECTION_FAILED);

        let corrections = self
            .stories
            .iter()
            .filter_map(|s| s.url_correction.as_ref())
            .collect::<Vec<_>>();
        let attempted = corrections.iter().filter(|c| c.attempted).count();
        let succeeded = corrections.iter().filter(|c| c.success).count();
        let by_method = |method: CorrectionMethod| {
            corrections
                .iter()
                .filter(|c| c.method_used == Some(method))
                .count()
        };

        let total = self.stories.len();
        let success_rate = if attempted > 0 {
            format!("{:.1}%", succeeded as f64 / attempted as f64 * 100.0)
        } else {
            "0%".to_string()
        };

        self.metadata.tracking = Some(TrackingStats {
            total_stories: total,
            scripts_generated: completed,
            failed,
            correction_failed,
            pending: total.saturating_sub(completed + failed + correction_failed),
            url_correction_stats: UrlCorrectionStats {
                correction_attempted: attempted,
                correction_succeeded: succeeded,
                correction_failed: attempted.saturating_sub(succeeded),
                tier1_success: by_method(CorrectionMethod::PreciseSearch),
                tier2_success: by_method(CorrectionMethod::BroadenedSearch),
                success_rate,
            },
            last_updated: Some(now.to_rfc3339()),
        });
    }
}
