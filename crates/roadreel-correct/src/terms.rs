//! Search-term extraction from story titles.

/// Function words that never help a search.
pub const STOPWORDS: &[&str] = &[
    "with", "in", "the", "a", "an", "and", "or", "but", "of", "to", "for", "by", "from", "on",
    "at", "is", "was", "are", "were", "has", "have", "had", "will", "would", "could", "should",
    "may", "might",
];

pub const MAX_PRECISE_TERMS: usize = 6;
pub const MAX_BROADENED_TERMS: usize = 4;
/// Tokens shorter than this are dropped from precise terms.
pub const MIN_PRECISE_LEN: usize = 3;
/// Broadened terms are topped up with long words until at least this many are collected.
pub const MIN_BROADENED_TERMS: usize = 3;
pub const MIN_FILLER_LEN: usize = 5;

/// Domain keywords, grouped in priority order.
pub const PRIORITY_GROUPS: &[(&str, &[&str])] = &[
    (
        "vehicle",
        &[
            "corolla", "camry", "honda", "toyota", "bmw", "ford", "jeep", "truck", "semi", "car",
            "vehicle",
        ],
    ),
    (
        "collision",
        &["crash", "accident", "rear", "end", "hit", "collision", "slam", "wreck", "smash"],
    ),
    (
        "roadway",
        &["spacex", "rocket", "launch", "highway", "road", "freeway", "traffic", "driver"],
    ),
    ("evidence", &["dashcam", "camera", "video", "footage", "caught", "captured"]),
];

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Maximal word-character runs made only of ASCII letters, in title order.
/// Runs mixing in digits or underscores (`4x4`, `I_95`) are skipped whole.
pub fn tokenize(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = None;
    for (idx, c) in text.char_indices().chain(std::iter::once((text.len(), ' '))) {
        match (start, is_word_char(c)) {
            (None, true) => start = Some(idx),
            (Some(begin), false) => {
                let run = &text[begin..idx];
                if run.chars().all(|ch| ch.is_ascii_alphabetic()) {
                    tokens.push(run);
                }
                start = None;
            }
            _ => {}
        }
    }
    tokens
}

pub fn is_stopword(word: &str) -> bool {
    STOPWORDS.iter().any(|s| s.eq_ignore_ascii_case(word))
}

fn is_priority_word(word: &str) -> bool {
    PRIORITY_GROUPS
        .iter()
        .flat_map(|(_, words)| words.iter())
        .any(|w| w.eq_ignore_ascii_case(word))
}

/// Up to six content words, original casing and order, stopwords removed.
pub fn extract_precise_terms(title: &str) -> Vec<String> {
    tokenize(title)
        .into_iter()
        .filter(|t| t.len() >= MIN_PRECISE_LEN && !is_stopword(t))
        .take(MAX_PRECISE_TERMS)
        .map(str::to_string)
        .collect()
}

/// Up to four priority keywords in title order, topped up with long words
/// when fewer than three were found.
pub fn extract_broadened_terms(title: &str) -> Vec<String> {
    fn seen(terms: &[&str], word: &str) -> bool {
        terms.iter().any(|t| t.eq_ignore_ascii_case(word))
    }

    let tokens = tokenize(title);
    let mut terms: Vec<&str> = Vec::new();
    for &token in &tokens {
        if is_priority_word(token) && !seen(&terms, token) {
            terms.push(token);
        }
    }

    if terms.len() < MIN_BROADENED_TERMS {
        let mut added = 0;
        for &token in &tokens {
            if added == MIN_BROADENED_TERMS {
                break;
            }
            if token.len() >= MIN_FILLER_LEN && !seen(&terms, token) {
                terms.push(token);
                added += 1;
            }
        }
    }

    terms.truncate(MAX_BROADENED_TERMS);
    terms.into_iter().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROADCAM_TITLE: &str = "Corolla Rear-Ended with SpaceX Launch in Background";

    #[test]
    fn precise_terms_keep_order_and_casing() {
        assert_eq!(
            extract_precise_terms(ROADCAM_TITLE),
            vec!["Corolla", "Rear", "Ended", "SpaceX", "Launch", "Background"]
        );
    }

    #[test]
    fn precise_terms_cap_at_six() {
        let terms = extract_precise_terms(
            "Truck trailer swings across three lanes during heavy morning traffic jam",
        );
        assert_eq!(terms.len(), MAX_PRECISE_TERMS);
        assert_eq!(terms[0], "Truck");
        assert_eq!(terms[5], "lanes");
    }

    #[test]
    fn precise_terms_never_contain_stopwords_or_short_tokens() {
        for title in [
            ROADCAM_TITLE,
            "A car and a truck at the light",
            "Was it the driver or the bike? Would have been worse",
            "Red light runner hits 4x4 on I-95",
        ] {
            for term in extract_precise_terms(title) {
                assert!(!is_stopword(&term), "{title}: {term}");
                assert!(term.len() >= MIN_PRECISE_LEN, "{title}: {term}");
                assert!(term.chars().all(|c| c.is_ascii_alphabetic()), "{title}: {term}");
            }
        }
    }

    #[test]
    fn tokenizer_skips_mixed_runs() {
        assert_eq!(
            tokenize("Red light runner hits 4x4 on I-95"),
            vec!["Red", "light", "runner", "hits", "on", "I"]
        );
        assert_eq!(tokenize("café crash"), vec!["crash"]);
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn empty_or_stopword_titles_yield_no_terms() {
        assert!(extract_precise_terms("").is_empty());
        assert!(extract_precise_terms("it is in the of a").is_empty());
        assert!(extract_broadened_terms("").is_empty());
    }

    #[test]
    fn broadened_terms_follow_title_order_of_priority_words() {
        assert_eq!(
            extract_broadened_terms(ROADCAM_TITLE),
            vec!["Corolla", "Rear", "SpaceX", "Launch"]
        );
    }

    #[test]
    fn broadened_terms_are_topped_up_with_long_words() {
        assert_eq!(
            extract_broadened_terms("Unbelievable merge near exit ramp"),
            vec!["Unbelievable", "merge"]
        );
        assert_eq!(
            extract_broadened_terms("Motorcycle lanesplits between stopped buses on bridge"),
            vec!["Motorcycle", "lanesplits", "between"]
        );
        assert_eq!(
            extract_broadened_terms("Jeep swerves around stalled minivan"),
            vec!["Jeep", "swerves", "around", "stalled"]
        );
    }

    #[test]
    fn broadened_terms_have_no_duplicates() {
        assert_eq!(
            extract_broadened_terms("Truck slams truck, truck wreck"),
            vec!["Truck", "wreck", "slams"]
        );
    }
}
