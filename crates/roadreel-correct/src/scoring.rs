//! Candidate scoring: title overlap plus engagement proximity.

use std::collections::BTreeSet;

use roadreel_core::{CandidatePost, MatchResult};

use crate::terms::tokenize;

pub const TITLE_WEIGHT: f64 = 0.7;
pub const ENGAGEMENT_WEIGHT: f64 = 0.3;
pub const ORDER_BONUS_WEIGHT: f64 = 0.2;
/// Engagement similarity used when the story carries no expectation.
pub const NEUTRAL_ENGAGEMENT: f64 = 0.5;

/// Acceptance gates for one search tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchProfile {
    pub title_threshold: f64,
    pub engagement_tolerance: u64,
}

impl MatchProfile {
    pub const STRICT: Self = Self {
        title_threshold: 0.7,
        engagement_tolerance: 1000,
    };
    pub const LENIENT: Self = Self {
        title_threshold: 0.5,
        engagement_tolerance: 2000,
    };
}

fn lowercase_tokens(text: &str) -> Vec<String> {
    tokenize(text).into_iter().map(str::to_ascii_lowercase).collect()
}

/// Jaccard overlap of the lowercase word sets plus a word-order bonus, capped at 1.0.
///
/// The bonus walks the *target* tokens and looks each up in the candidate, so
/// swapping the arguments can change the result even though the Jaccard part
/// is symmetric.
pub fn title_similarity(found: &str, target: &str) -> f64 {
    let found_list = lowercase_tokens(found);
    let target_list = lowercase_tokens(target);
    if found_list.is_empty() || target_list.is_empty() {
        return 0.0;
    }

    let found_set = found_list.iter().map(String::as_str).collect::<BTreeSet<_>>();
    let target_set = target_list.iter().map(String::as_str).collect::<BTreeSet<_>>();

    let intersection = target_set.intersection(&found_set).count();
    let union = found_set.len() + target_set.len() - intersection;
    let jaccard = intersection as f64 / union as f64;

    let order_sum: f64 = target_list
        .iter()
        .enumerate()
        .filter_map(|(i, word)| {
            found_list
                .iter()
                .position(|f| f == word)
                .map(|j| 1.0 / (1.0 + i.abs_diff(j) as f64))
        })
        .sum();
    let order_bonus = order_sum / target_list.len() as f64 * ORDER_BONUS_WEIGHT;

    (jaccard + order_bonus).min(1.0)
}

fn engagement_delta(score: i64, target: u64) -> u64 {
    (i128::from(score) - i128::from(target)).unsigned_abs().min(u128::from(u64::MAX)) as u64
}

/// Proximity of a candidate's score to the expected engagement, in `[0, 1]`.
pub fn engagement_similarity(score: i64, target: Option<u64>, tolerance: u64) -> f64 {
    match target.filter(|t| *t > 0) {
        None => NEUTRAL_ENGAGEMENT,
        Some(target) => {
            let delta = engagement_delta(score, target) as f64;
            (1.0 - delta / target.max(tolerance) as f64).max(0.0)
        }
    }
}

/// Score one candidate. Returns `None` when it clears neither the title gate nor
/// the engagement gate; the engagement gate always passes without an expectation.
pub fn score_candidate(
    candidate: &CandidatePost,
    target_title: &str,
    target_engagement: Option<u64>,
    profile: &MatchProfile,
) -> Option<MatchResult> {
    let title = title_similarity(&candidate.title, target_title);
    let engagement =
        engagement_similarity(candidate.score, target_engagement, profile.engagement_tolerance);
    let confidence = TITLE_WEIGHT * title + ENGAGEMENT_WEIGHT * engagement;

    let title_ok = title >= profile.title_threshold;
    let engagement_ok = target_engagement
        .filter(|t| *t > 0)
        .map_or(true, |t| engagement_delta(candidate.score, t) <= profile.engagement_tolerance);

    (title_ok || engagement_ok).then(|| MatchResult {
        post: candidate.clone(),
        confidence,
        title_similarity: title,
        engagement_similarity: engagement,
    })
}

/// Highest-confidence acceptable candidate. Ties keep the earliest, and a
/// candidate must score above zero to be chosen at all.
pub fn best_match(
    candidates: &[CandidatePost],
    target_title: &str,
    target_engagement: Option<u64>,
    profile: &MatchProfile,
) -> Option<MatchResult> {
    let mut best: Option<MatchResult> = None;
    for candidate in candidates {
        let Some(scored) = score_candidate(candidate, target_title, target_engagement, profile)
        else {
            continue;
        };
        let best_confidence = best.as_ref().map_or(0.0, |b| b.confidence);
        if scored.confidence > best_confidence {
            best = Some(scored);
        }
    }
    best
}
