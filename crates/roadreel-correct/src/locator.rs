//! Offline classification of story locators.

use roadreel_core::StoryRecord;
use serde::Serialize;
use thiserror::Error;
use url::Url;

pub const RECOGNIZED_DOMAIN: &str = "reddit.com";
pub const POST_SEGMENT: &str = "comments";
pub const CATEGORY_SEGMENT: &str = "r";
/// A category root is `/r/<name>`: two non-empty path segments at most.
pub const MAX_CATEGORY_SEGMENTS: usize = 2;
const DEFAULT_SCHEME: &str = "https://";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorKind {
    Post,
    Category,
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum LocatorIssue {
    #[error("missing")]
    Missing,
    #[error("missing scheme")]
    MissingScheme,
    #[error("wrong domain")]
    WrongDomain,
    #[error("points to category root, not a specific item")]
    CategoryRoot,
    #[error("malformed")]
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocatorCheck {
    pub valid: bool,
    pub kind: Option<LocatorKind>,
    pub issue: Option<LocatorIssue>,
    /// Set for valid posts, and for any locator that only became parseable after
    /// the default scheme was prepended.
    pub normalized: Option<String>,
}

impl LocatorCheck {
    fn invalid(issue: LocatorIssue) -> Self {
        Self {
            valid: false,
            kind: None,
            issue: Some(issue),
            normalized: None,
        }
    }

    fn classified(kind: LocatorKind, normalized: Option<String>) -> Self {
        let issue = match kind {
            LocatorKind::Post => None,
            LocatorKind::Category => Some(LocatorIssue::CategoryRoot),
            LocatorKind::Malformed => Some(LocatorIssue::Malformed),
        };
        Self {
            valid: issue.is_none(),
            kind: Some(kind),
            issue,
            normalized,
        }
    }

    pub fn reason(&self) -> Option<String> {
        self.issue.map(|issue| issue.to_string())
    }
}

fn has_http_scheme(locator: &str) -> bool {
    let lower = locator.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn mentions_domain(locator: &str) -> bool {
    locator.to_ascii_lowercase().contains(RECOGNIZED_DOMAIN)
}

fn host_is_recognized(url: &Url) -> bool {
    url.host_str().is_some_and(|host| {
        let host = host.to_ascii_lowercase();
        host == RECOGNIZED_DOMAIN || host.ends_with(&format!(".{RECOGNIZED_DOMAIN}"))
    })
}

/// Post: a `comments` segment followed by a post id.
/// Category: `r/<name>` with nothing after it.
fn classify_path(url: &Url) -> LocatorKind {
    let segments = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect::<Vec<_>>())
        .unwrap_or_default();
    let is_post = segments
        .windows(2)
        .any(|pair| pair[0].eq_ignore_ascii_case(POST_SEGMENT));
    if is_post {
        return LocatorKind::Post;
    }
    let is_category = segments
        .first()
        .is_some_and(|first| first.eq_ignore_ascii_case(CATEGORY_SEGMENT))
        && segments.len() <= MAX_CATEGORY_SEGMENTS;
    if is_category {
        LocatorKind::Category
    } else {
        LocatorKind::Malformed
    }
}

/// Classify a locator without touching the network.
pub fn validate(locator: &str) -> LocatorCheck {
    let trimmed = locator.trim();
    if trimmed.is_empty() {
        return LocatorCheck::invalid(LocatorIssue::Missing);
    }

    let (raw, url, scheme_added) = if has_http_scheme(trimmed) {
        match Url::parse(trimmed) {
            Ok(url) => (trimmed.to_string(), url, false),
            Err(_) if mentions_domain(trimmed) => {
                return LocatorCheck::classified(LocatorKind::Malformed, None);
            }
            Err(_) => return LocatorCheck::invalid(LocatorIssue::WrongDomain),
        }
    } else {
        let candidate = format!("{DEFAULT_SCHEME}{trimmed}");
        match Url::parse(&candidate) {
            Ok(url) if host_is_recognized(&url) => (candidate, url, true),
            _ if mentions_domain(trimmed) => {
                return LocatorCheck::invalid(LocatorIssue::MissingScheme);
            }
            _ => return LocatorCheck::invalid(LocatorIssue::WrongDomain),
        }
    };

    if !host_is_recognized(&url) {
        return LocatorCheck::invalid(LocatorIssue::WrongDomain);
    }

    match classify_path(&url) {
        LocatorKind::Post => LocatorCheck::classified(LocatorKind::Post, Some(raw)),
        kind => LocatorCheck::classified(kind, scheme_added.then_some(raw)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldCheck {
    pub field: &'static str,
    pub check: LocatorCheck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoryLocatorReport {
    pub story_id: u64,
    pub all_valid: bool,
    pub fields: Vec<FieldCheck>,
}

/// Validate the primary `url` plus every alternate locator field present on the story.
/// An absent primary `url` is reported as missing; absent alternates are skipped.
pub fn validate_story_locators(story: &StoryRecord) -> StoryLocatorReport {
    let mut fields = vec![FieldCheck {
        field: "url",
        check: validate(story.url.as_deref().unwrap_or_default()),
    }];
    for (field, value) in [
        ("source_url", &story.source_url),
        ("reddit_url", &story.reddit_url),
        ("original_url", &story.original_url),
    ] {
        if let Some(value) = value {
            fields.push(FieldCheck {
                field,
                check: validate(value),
            });
        }
    }
    StoryLocatorReport {
        story_id: story.id,
        all_valid: fields.iter().all(|f| f.check.valid),
        fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_root_without_scheme_is_normalized_but_invalid() {
        let check = validate("reddit.com/r/Roadcam");
        assert!(!check.valid);
        assert_eq!(check.kind, Some(LocatorKind::Category));
        assert_eq!(
            check.reason().as_deref(),
            Some("points to category root, not a specific item")
        );
        assert_eq!(check.normalized.as_deref(), Some("https://reddit.com/r/Roadcam"));
    }

    #[test]
    fn post_locators_are_valid() {
        let check =
            validate("https://www.reddit.com/r/Roadcam/comments/1abcd2/corolla/?utm_source=share");
        assert!(check.valid);
        assert_eq!(check.kind, Some(LocatorKind::Post));
        assert!(check.issue.is_none());

        let bare = validate("old.reddit.com/r/Roadcam/comments/1abcd2/corolla/");
        assert!(bare.valid);
        assert_eq!(
            bare.normalized.as_deref(),
            Some("https://old.reddit.com/r/Roadcam/comments/1abcd2/corolla/")
        );
    }

    #[test]
    fn trailing_slash_category_is_still_a_category() {
        let check = validate("https://reddit.com/r/IdiotsInCars/");
        assert_eq!(check.kind, Some(LocatorKind::Category));
        assert!(check.normalized.is_none());
    }

    #[test]
    fn empty_and_blank_locators_are_missing() {
        assert_eq!(validate("").issue, Some(LocatorIssue::Missing));
        assert_eq!(validate("   ").reason().as_deref(), Some("missing"));
    }

    #[test]
    fn foreign_locators_are_wrong_domain() {
        for locator in [
            "https://example.com/r/Roadcam/comments/abc/x/",
            "http://notreddit.com.evil.io/r/Roadcam",
            "https://youtube.com/watch?v=dQw4w9WgXcQ",
            "www.example.org/r/Roadcam",
            "/r/Roadcam/comments/abc/x/",
            "https://reddit.co/r/x",
            "https://evil.com\\.reddit.com/r/Roadcam/comments/abc/x/",
            "https://evil.com\\@reddit.com/r/Roadcam/comments/abc/x/",
            "https://reddit.com@evil.com/r/Roadcam/comments/abc/x/",
            "https://evilreddit.com/r/Roadcam/comments/abc/x/",
        ] {
            let check = validate(locator);
            assert!(!check.valid, "{locator}");
            assert_eq!(check.reason().as_deref(), Some("wrong domain"), "{locator}");
        }
    }

    #[test]
    fn domain_mentioned_mid_string_lacks_a_scheme() {
        let check = validate("see reddit.com/r/Roadcam/comments/abc/x/");
        assert_eq!(check.issue, Some(LocatorIssue::MissingScheme));
        let ftp = validate("ftp://reddit.com/r/Roadcam/comments/abc/x/");
        assert_eq!(ftp.reason().as_deref(), Some("missing scheme"));
    }

    #[test]
    fn other_paths_are_malformed() {
        for locator in [
            "https://reddit.com/user/someone",
            "https://reddit.com/",
            "https://reddit.com/r/Roadcam/top/week",
            "https://reddit.com/r/Roadcam/comments/",
            "https://reddit.com:notaport/r/Roadcam/comments/abc/x/",
        ] {
            let check = validate(locator);
            assert_eq!(check.kind, Some(LocatorKind::Malformed), "{locator}");
            assert_eq!(check.issue, Some(LocatorIssue::Malformed), "{locator}");
        }
    }

    #[test]
    fn validation_is_deterministic() {
        let a = validate("reddit.com/r/Roadcam");
        let b = validate("reddit.com/r/Roadcam");
        assert_eq!(a, b);
    }

    #[test]
    fn story_report_covers_alternate_fields() {
        let mut story = StoryRecord::new(3, "Jeep Runs Stop Sign", "r/IdiotsInCars")
            .with_url("https://reddit.com/r/IdiotsInCars/comments/q9/jeep/");
        story.source_url = Some("reddit.com/r/IdiotsInCars".into());
        let report = validate_story_locators(&story);
        assert!(!report.all_valid);
        assert_eq!(report.fields.len(), 2);
        assert!(report.fields[0].check.valid);
        assert_eq!(report.fields[1].field, "source_url");
        assert_eq!(report.fields[1].check.kind, Some(LocatorKind::Category));

        let bare = validate_story_locators(&StoryRecord::new(4, "t", "r/Roadcam"));
        assert_eq!(bare.fields[0].check.issue, Some(LocatorIssue::Missing));
    }
}
