//! Maps free-text tier failure reasons onto a single [`FailureCategory`].

use std::path::Path;

use anyhow::{Context, Result};
use roadreel_core::FailureCategory;
use serde::Deserialize;
use tracing::debug;

pub const FAILURE_PATTERNS_FILE: &str = "failure_patterns.yaml";

#[derive(Debug, Clone, Deserialize)]
struct FailurePatternsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<FailureRule>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FailureRule {
    pub category: FailureCategory,
    pub contains_any: Vec<String>,
}

fn rule(category: FailureCategory, needles: &[&str]) -> FailureRule {
    FailureRule {
        category,
        contains_any: needles.iter().map(|n| n.to_string()).collect(),
    }
}

/// Ordered substring rules; the first rule with any hit decides the category.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureClassifier {
    rules: Vec<FailureRule>,
}

impl Default for FailureClassifier {
    fn default() -> Self {
        use roadreel_core::FailureCategory::*;
        Self::new(vec![
            rule(NoSearchResults, &["no posts found", "no matching posts", "empty results"]),
            rule(NetworkError, &["network", "timeout", "connection", "unavailable", "api error"]),
            rule(CategoryNotFound, &["subreddit", "invalid subreddit", "not found"]),
            rule(TitleMismatch, &["no suitable matches", "title", "similarity"]),
            rule(EngagementMismatch, &["upvote", "engagement", "score"]),
            rule(ParsingError, &["parsing", "json", "decode", "format"]),
        ])
    }
}

impl FailureClassifier {
    pub fn new(rules: Vec<FailureRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|r| FailureRule {
                category: r.category,
                contains_any: r.contains_any.iter().map(|n| n.to_ascii_lowercase()).collect(),
            })
            .collect();
        Self { rules }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: FailurePatternsFile =
            serde_yaml::from_str(text).context("parsing failure patterns")?;
        Ok(Self::new(file.rules))
    }

    /// `rules/failure_patterns.yaml` under the workspace root, or the built-in
    /// rules when the file is absent.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join(FAILURE_PATTERNS_FILE);
        if !path.exists() {
            debug!(
                path = %path.display(),
                "no failure pattern rules on disk; using built-in rules"
            );
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn rules(&self) -> &[FailureRule] {
        &self.rules
    }

    pub fn classify<S: AsRef<str>>(&self, reasons: &[S]) -> FailureCategory {
        let combined = reasons
            .iter()
            .map(|r| r.as_ref())
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        if combined.trim().is_empty() {
            return FailureCategory::UnknownError;
        }
        self.rules
            .iter()
            .find(|r| r.contains_any.iter().any(|needle| combined.contains(needle.as_str())))
            .map(|r| r.category)
            .unwrap_or(FailureCategory::UnknownError)
    }
}

/// Classify with the built-in rules.
pub fn categorize_failure<S: AsRef<str>>(reasons: &[S]) -> FailureCategory {
    FailureClassifier::default().classify(reasons)
}

#[cfg(test)]
mod tests {
    use super::*;
    use roadreel_core::FailureCategory::*;

    #[test]
    fn each_category_has_a_literal_trigger() {
        let cases = [
            ("No posts found in precise search", NoSearchResults),
            ("network timeout after 10s fetching https://www.reddit.com", NetworkError),
            ("api error: http status 503", NetworkError),
            ("subreddit r/NoSuchPlace not found", CategoryNotFound),
            ("https://x/post.json not found (http 404)", CategoryNotFound),
            ("No suitable matches found in precise search results", TitleMismatch),
            ("engagement too far from expected upvotes", EngagementMismatch),
            ("parsing error: search response is not a listing: expected value", ParsingError),
            ("something odd happened", UnknownError),
        ];
        for (reason, expected) in cases {
            assert_eq!(categorize_failure(&[reason]), expected, "{reason}");
        }
    }

    #[test]
    fn earlier_rules_win() {
        assert_eq!(categorize_failure(&["network hiccup while comparing title"]), NetworkError);
        assert_eq!(
            categorize_failure(&[
                "No suitable matches found in precise search results",
                "No posts found in broadened search",
            ]),
            NoSearchResults
        );
        assert_eq!(categorize_failure(&["bad json in score field"]), EngagementMismatch);
    }

    #[test]
    fn matching_ignores_case() {
        assert_eq!(categorize_failure(&["CONNECTION RESET BY PEER"]), NetworkError);
        assert_eq!(categorize_failure(&["Empty Results"]), NoSearchResults);
    }

    #[test]
    fn no_reasons_is_unknown() {
        assert_eq!(categorize_failure::<&str>(&[]), UnknownError);
        assert_eq!(categorize_failure(&["", "  "]), UnknownError);
    }

    #[test]
    fn yaml_rules_replace_the_builtin_order() {
        let classifier = FailureClassifier::from_yaml_str(
            "version: 1\n\
             rules:\n\
             \x20 - category: parsing_error\n\
             \x20   contains_any: [\"JSON\"]\n\
             \x20 - category: subreddit_not_found\n\
             \x20   contains_any: [\"banned\"]\n",
        )
        .expect("rules parse");
        assert_eq!(classifier.rules().len(), 2);
        assert_eq!(classifier.classify(&["network json failure"]), ParsingError);
        assert_eq!(classifier.classify(&["community banned"]), CategoryNotFound);
        assert_eq!(classifier.classify(&["network down"]), UnknownError);
    }

    #[test]
    fn workspace_rules_file_matches_builtin_rules() {
        let root = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        let loaded = FailureClassifier::from_workspace_root(&root).expect("workspace rules");
        assert_eq!(loaded, FailureClassifier::default());

        let tmp = tempfile::tempdir().expect("tempdir");
        assert_eq!(
            FailureClassifier::from_workspace_root(tmp.path()).expect("fallback"),
            FailureClassifier::default()
        );
    }
}
