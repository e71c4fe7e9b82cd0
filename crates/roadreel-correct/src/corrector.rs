//! Two-tier locator correction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use roadreel_adapters::{MediaLocator, SearchError, SearchProvider};
use roadreel_core::{CorrectionMethod, CorrectionOutcome, Resolution, StoryRecord, TierReport};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::classify::FailureClassifier;
use crate::locator::{validate, LocatorKind};
use crate::scoring::{best_match, MatchProfile};
use crate::terms::{extract_broadened_terms, extract_precise_terms};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Community name from a story's `source` field: `r/Roadcam`, `/r/Roadcam` and
/// `Roadcam` all give `Roadcam`.
pub fn extract_category(source: &str) -> Option<String> {
    let trimmed = source.trim();
    let name = trimmed
        .strip_prefix("/r/")
        .or_else(|| trimmed.strip_prefix("r/"))
        .unwrap_or(trimmed)
        .trim_end_matches('/')
        .trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn tier_terms(method: CorrectionMethod, title: &str) -> Vec<String> {
    match method {
        CorrectionMethod::PreciseSearch => extract_precise_terms(title),
        CorrectionMethod::BroadenedSearch => extract_broadened_terms(title),
    }
}

pub fn tier_profile(method: CorrectionMethod) -> MatchProfile {
    match method {
        CorrectionMethod::PreciseSearch => MatchProfile::STRICT,
        CorrectionMethod::BroadenedSearch => MatchProfile::LENIENT,
    }
}

/// Either the story's locator was already usable, or a correction was attempted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum LocatorResolution {
    AlreadyValid { url: String },
    Attempted(CorrectionOutcome),
}

pub struct Corrector {
    search: Box<dyn SearchProvider>,
    media: Box<dyn MediaLocator>,
    classifier: FailureClassifier,
    clock: Clock,
}

impl Corrector {
    pub fn new(search: Box<dyn SearchProvider>, media: Box<dyn MediaLocator>) -> Self {
        Self {
            search,
            media,
            classifier: FailureClassifier::default(),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Validate first; only run the correction tiers when the locator is unusable.
    pub async fn resolve(&self, story: &StoryRecord) -> LocatorResolution {
        let raw = story.url.as_deref().unwrap_or_default();
        let check = validate(raw);
        if check.valid {
            return LocatorResolution::AlreadyValid {
                url: check.normalized.unwrap_or_else(|| raw.to_string()),
            };
        }
        info!(
            story_id = story.id,
            issue = %check.reason().unwrap_or_default(),
            "locator unusable; attempting correction"
        );
        LocatorResolution::Attempted(self.correct(story).await)
    }

    /// Run the tiers in order until one produces a match.
    pub async fn correct(&self, story: &StoryRecord) -> CorrectionOutcome {
        let span = info_span!("correct_story", story_id = story.id);
        async move {
            let attempted_at = self.now();
            info!("starting locator correction");

            let mut methods_attempted = Vec::new();
            let mut failure_reasons = Vec::new();
            let mut tiers = Vec::new();

            for method in CorrectionMethod::ALL {
                let report = self.run_tier(method, story).await;
                methods_attempted.push(method);
                if let Some(matched) = &report.matched {
                    info!(
                        %method,
                        confidence = matched.confidence,
                        url = %matched.post.url,
                        "tier succeeded"
                    );
                    let resolution = Resolution::Corrected {
                        corrected_url: matched.post.url.clone(),
                        video_url: report.video_url.clone(),
                        method_used: method,
                        confidence: matched.confidence,
                    };
                    tiers.push(report);
                    return CorrectionOutcome {
                        story_id: story.id,
                        original_url: story.url.clone(),
                        attempted_at,
                        methods_attempted,
                        failure_reasons,
                        tiers,
                        resolution,
                    };
                }
                warn!(%method, errors = ?report.errors, "tier failed");
                failure_reasons.extend(report.errors.iter().cloned());
                tiers.push(report);
            }

            let failure_category = self.classifier.classify(&failure_reasons);
            error!(category = %failure_category, "locator correction failed");
            CorrectionOutcome {
                story_id: story.id,
                original_url: story.url.clone(),
                attempted_at,
                methods_attempted,
                failure_reasons,
                tiers,
                resolution: Resolution::Failed { failure_category },
            }
        }
        .instrument(span)
        .await
    }

    /// One search-and-score pass. Never errors: failures land in `errors`.
    pub async fn run_tier(&self, method: CorrectionMethod, story: &StoryRecord) -> TierReport {
        let report = TierReport::new(method);
        let label = method.label();

        let Some(category) = extract_category(&story.source) else {
            return report.failed(format!(
                "Cannot extract subreddit from source field for {label} search"
            ));
        };

        let terms = tier_terms(method, &story.title);
        if terms.is_empty() {
            let reason = match method {
                CorrectionMethod::PreciseSearch => "Cannot extract search terms from title",
                CorrectionMethod::BroadenedSearch => "Cannot generate broadened search terms",
            };
            return report.failed(reason.to_string());
        }
        let mut report = TierReport {
            search_terms: terms,
            ..report
        };

        let mut posts = match self.search.search(&category, &report.search_terms).await {
            Ok(posts) => posts,
            Err(SearchError::Internal(message)) => {
                return report.failed(format!("{method} exception: {message}"));
            }
            Err(err) => return report.failed(err.to_string()),
        };
        report.posts_found = posts.len();
        if posts.is_empty() {
            return report.failed(format!("No posts found in {label} search"));
        }

        // Only candidates that point at a specific post can become the corrected locator.
        posts.retain(|post| {
            let usable = validate(&post.url).kind == Some(LocatorKind::Post);
            if !usable {
                debug!(%method, url = %post.url, "dropping candidate without a post locator");
            }
            usable
        });

        let profile = tier_profile(method);
        let expectation = story.engagement_expectation();
        let Some(matched) = best_match(&posts, &story.title, expectation, &profile) else {
            return report.failed(format!("No suitable matches found in {label} search results"));
        };

        report.video_url = self.lookup_media(&matched.post.url).await;
        report.matched = Some(matched);
        report
    }

    async fn lookup_media(&self, locator: &str) -> Option<String> {
        match self.media.locate_media(locator).await {
            Ok(links) => links.into_iter().next().map(|link| link.url),
            Err(err) => {
                warn!(
                    locator,
                    error = %err,
                    "media lookup failed; keeping corrected locator without media"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use roadreel_adapters::{MediaError, MediaKind, MediaLink};
    use roadreel_core::{CandidatePost, FailureCategory};
    use roadreel_storage::FetchError;

    use super::*;

    const ROADCAM_TITLE: &str = "Corolla Rear-Ended with SpaceX Launch in Background";
    const ROADCAM_FOUND: &str = "Corolla rear-ended while SpaceX launches in background";

    type SearchResult = Result<Vec<CandidatePost>, SearchError>;
    type Responder = Box<dyn Fn(usize, &[String]) -> SearchResult + Send + Sync>;

    struct StubSearch {
        respond: Responder,
        calls: Arc<Mutex<Vec<(String, Vec<String>)>>>,
    }

    impl StubSearch {
        fn new(
            respond: impl Fn(usize, &[String]) -> SearchResult + Send + Sync + 'static,
        ) -> (Self, Arc<Mutex<Vec<(String, Vec<String>)>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    respond: Box::new(respond),
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl SearchProvider for StubSearch {
        async fn search(&self, category: &str, terms: &[String]) -> SearchResult {
            let call_no = {
                let mut calls = self.calls.lock().expect("calls lock");
                calls.push((category.to_string(), terms.to_vec()));
                calls.len()
            };
            (self.respond)(call_no, terms)
        }
    }

    struct StubMedia(Option<&'static str>);

    #[async_trait]
    impl MediaLocator for StubMedia {
        async fn locate_media(&self, _locator: &str) -> Result<Vec<MediaLink>, MediaError> {
            match self.0 {
                Some(url) => Ok(vec![MediaLink {
                    url: url.to_string(),
                    platform: "v.redd.it".to_string(),
                    kind: MediaKind::RedditVideo,
                }]),
                None => Err(MediaError::Parse("no media block".to_string())),
            }
        }
    }

    fn post(title: &str, score: i64) -> CandidatePost {
        CandidatePost {
            title: title.to_string(),
            url: format!("https://reddit.com/r/Roadcam/comments/{score}/clip/"),
            score,
            num_comments: 12,
        }
    }

    fn roadcam_story() -> StoryRecord {
        StoryRecord::new(1, ROADCAM_TITLE, "r/Roadcam")
            .with_url("reddit.com/r/Roadcam")
            .with_upvotes(8881)
    }

    fn fixed_clock() -> Clock {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).single().expect("valid timestamp");
        Arc::new(move || at)
    }

    fn corrector(search: StubSearch, media: StubMedia) -> Corrector {
        Corrector::new(Box::new(search), Box::new(media)).with_clock(fixed_clock())
    }

    #[test]
    fn category_is_extracted_from_common_source_forms() {
        assert_eq!(extract_category("r/Roadcam").as_deref(), Some("Roadcam"));
        assert_eq!(extract_category(" /r/IdiotsInCars/ ").as_deref(), Some("IdiotsInCars"));
        assert_eq!(extract_category("Dashcam").as_deref(), Some("Dashcam"));
        assert_eq!(extract_category(""), None);
        assert_eq!(extract_category("r/"), None);
    }

    #[tokio::test]
    async fn roadcam_story_is_corrected_by_the_precise_tier() {
        let story = roadcam_story();
        assert_eq!(
            validate(story.url.as_deref().unwrap_or_default()).kind,
            Some(LocatorKind::Category)
        );

        let (search, calls) = StubSearch::new(|_, _| Ok(vec![post(ROADCAM_FOUND, 8700)]));
        let corrector = corrector(search, StubMedia(Some("https://v.redd.it/q8x7w6v5")));

        let outcome = corrector.correct(&story).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.method_used(), Some(CorrectionMethod::PreciseSearch));
        assert_eq!(outcome.methods_attempted, vec![CorrectionMethod::PreciseSearch]);
        assert_eq!(
            outcome.corrected_url(),
            Some("https://reddit.com/r/Roadcam/comments/8700/clip/")
        );
        assert_eq!(outcome.video_url(), Some("https://v.redd.it/q8x7w6v5"));
        assert!(outcome.failure_category().is_none());
        let confidence = outcome.confidence().expect("confidence");
        assert!((confidence - (0.7 * 0.75 + 0.3 * (1.0 - 181.0 / 8881.0))).abs() < 1e-9);

        let calls = calls.lock().expect("calls lock");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "Roadcam");
        assert_eq!(calls[0].1, ["Corolla", "Rear", "Ended", "SpaceX", "Launch", "Background"]);
    }

    #[tokio::test]
    async fn empty_results_in_both_tiers_are_no_search_results() {
        let (search, calls) = StubSearch::new(|_, _| Ok(Vec::new()));
        let outcome = corrector(search, StubMedia(None)).correct(&roadcam_story()).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.methods_attempted, CorrectionMethod::ALL.to_vec());
        assert_eq!(outcome.failure_category(), Some(FailureCategory::NoSearchResults));
        assert_eq!(
            outcome.failure_reasons,
            ["No posts found in precise search", "No posts found in broadened search"]
        );
        let calls = calls.lock().expect("calls lock");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].1, ["Corolla", "Rear", "SpaceX", "Launch"]);
    }

    #[tokio::test]
    async fn lenient_tier_recovers_what_the_strict_tier_rejects() {
        // Title overlap is low and the score is 1681 off: outside the strict
        // tolerance, inside the lenient one.
        let (search, calls) = StubSearch::new(|_, _| {
            Ok(vec![post("Dashcam catches Corolla collision during rocket launch", 7200)])
        });
        let outcome = corrector(search, StubMedia(None)).correct(&roadcam_story()).await;

        assert_eq!(outcome.method_used(), Some(CorrectionMethod::BroadenedSearch));
        assert_eq!(outcome.methods_attempted, CorrectionMethod::ALL.to_vec());
        assert_eq!(
            outcome.failure_reasons,
            ["No suitable matches found in precise search results"]
        );
        assert_eq!(outcome.tiers.len(), 2);
        assert!(!outcome.tiers[0].succeeded());
        assert!(outcome.tiers[1].succeeded());
        // Media lookup failure does not undo the match.
        assert!(outcome.video_url().is_none());
        assert_eq!(calls.lock().expect("calls lock").len(), 2);
    }

    #[tokio::test]
    async fn network_failure_then_broadened_success_keeps_first_reason() {
        let (search, _) = StubSearch::new(|call_no, _| {
            if call_no == 1 {
                Err(SearchError::Fetch(FetchError::Timeout {
                    url: "https://www.reddit.com/r/Roadcam/search.json".into(),
                    timeout_secs: 10,
                }))
            } else {
                Ok(vec![post(ROADCAM_TITLE, 8881)])
            }
        });
        let outcome = corrector(search, StubMedia(None)).correct(&roadcam_story()).await;

        assert_eq!(outcome.method_used(), Some(CorrectionMethod::BroadenedSearch));
        assert_eq!(outcome.failure_reasons.len(), 1);
        assert!(outcome.failure_reasons[0].contains("timeout"));
    }

    #[tokio::test]
    async fn unexpected_provider_errors_are_tagged_with_the_tier() {
        let (search, _) = StubSearch::new(|_, _| {
            Err(SearchError::Internal("listing cursor overflow".into()))
        });
        let outcome = corrector(search, StubMedia(None)).correct(&roadcam_story()).await;

        assert_eq!(
            outcome.failure_reasons,
            ["tier1 exception: listing cursor overflow", "tier2 exception: listing cursor overflow"]
        );
        assert_eq!(outcome.failure_category(), Some(FailureCategory::UnknownError));
    }

    #[tokio::test]
    async fn candidates_without_a_post_locator_are_never_chosen() {
        let (search, _) = StubSearch::new(|_, _| {
            let mut exact = post(ROADCAM_TITLE, 8881);
            exact.url = "https://reddit.com".to_string();
            let mut category = post(ROADCAM_TITLE, 8881);
            category.url = "https://reddit.com/r/Roadcam/".to_string();
            Ok(vec![exact, category])
        });
        let outcome = corrector(search, StubMedia(None)).correct(&roadcam_story()).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.tiers[0].posts_found, 2);
        assert_eq!(
            outcome.failure_reasons,
            [
                "No suitable matches found in precise search results",
                "No suitable matches found in broadened search results"
            ]
        );
        assert_eq!(outcome.failure_category(), Some(FailureCategory::TitleMismatch));

        let (search, _) = StubSearch::new(|_, _| {
            let mut exact = post(ROADCAM_TITLE, 8881);
            exact.url = "https://reddit.com".to_string();
            Ok(vec![exact, post(ROADCAM_FOUND, 8700)])
        });
        let outcome = corrector(search, StubMedia(None)).correct(&roadcam_story()).await;
        assert_eq!(
            outcome.corrected_url(),
            Some("https://reddit.com/r/Roadcam/comments/8700/clip/")
        );
    }

    #[tokio::test]
    async fn missing_category_fails_without_searching() {
        let (search, calls) = StubSearch::new(|_, _| Ok(vec![post(ROADCAM_TITLE, 8881)]));
        let story = StoryRecord::new(9, ROADCAM_TITLE, "  ");
        let outcome = corrector(search, StubMedia(None)).correct(&story).await;

        assert_eq!(outcome.methods_attempted, CorrectionMethod::ALL.to_vec());
        assert_eq!(outcome.failure_category(), Some(FailureCategory::CategoryNotFound));
        assert!(calls.lock().expect("calls lock").is_empty());
    }

    #[tokio::test]
    async fn title_without_terms_fails_both_tiers_without_searching() {
        let (search, calls) = StubSearch::new(|_, _| Ok(vec![post("anything", 1)]));
        let story = StoryRecord::new(10, "It is in the", "r/Roadcam");
        let outcome = corrector(search, StubMedia(None)).correct(&story).await;

        assert_eq!(
            outcome.failure_reasons,
            ["Cannot extract search terms from title", "Cannot generate broadened search terms"]
        );
        assert_eq!(outcome.failure_category(), Some(FailureCategory::TitleMismatch));
        assert!(calls.lock().expect("calls lock").is_empty());
    }

    #[tokio::test]
    async fn identical_inputs_give_identical_outcomes() {
        let (search, _) = StubSearch::new(|_, _| {
            Ok(vec![
                post("Camry runs red light at intersection", 2310),
                post(ROADCAM_FOUND, 8700),
            ])
        });
        let corrector = corrector(search, StubMedia(Some("https://v.redd.it/q8x7w6v5")));
        let story = roadcam_story();

        let first = corrector.correct(&story).await;
        let second = corrector.correct(&story).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn valid_locators_skip_correction() {
        let (search, calls) = StubSearch::new(|_, _| Ok(Vec::new()));
        let corrector = corrector(search, StubMedia(None));
        let story = roadcam_story().with_url("reddit.com/r/Roadcam/comments/1abcd2/corolla/");

        let resolution = corrector.resolve(&story).await;
        assert_eq!(
            resolution,
            LocatorResolution::AlreadyValid {
                url: "https://reddit.com/r/Roadcam/comments/1abcd2/corolla/".into()
            }
        );
        assert!(calls.lock().expect("calls lock").is_empty());

        let attempted = corrector.resolve(&roadcam_story()).await;
        assert!(matches!(attempted, LocatorResolution::Attempted(ref o) if !o.is_success()));
    }
}
