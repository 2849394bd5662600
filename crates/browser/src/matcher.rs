//! Label-matching strategies for locating controls by text.

/// Scores how well a candidate element's text matches the wanted label.
pub trait TextMatcher: Send + Sync {
    /// `Some(score)` in `(0, 1]` when the candidate qualifies, higher is better.
    fn score(&self, wanted: &str, candidate: &str) -> Option<f64>;

    /// Longest candidate text worth collecting from the page.
    fn candidate_limit(&self, wanted: &str) -> usize {
        wanted.chars().count() * 3 + 64
    }

    /// Index of the best-scoring candidate. Ties keep the earliest.
    fn best<'a>(&self, wanted: &str, candidates: &'a [String]) -> Option<(usize, &'a str)> {
        let mut best: Option<(usize, f64)> = None;
        for (i, c) in candidates.iter().enumerate() {
            if let Some(score) = self.score(wanted, c) {
                if best.map_or(true, |(_, s)| score > s) {
                    best = Some((i, score));
                }
            }
        }
        best.map(|(i, _)| (i, candidates[i].as_str()))
    }
}

/// Whitespace-trimmed equality.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatcher;

impl TextMatcher for ExactMatcher {
    fn score(&self, wanted: &str, candidate: &str) -> Option<f64> {
        (candidate.trim() == wanted.trim()).then_some(1.0)
    }

    fn candidate_limit(&self, wanted: &str) -> usize {
        wanted.trim().chars().count()
    }
}

/// Literal, case-sensitive substring. Shorter candidates score higher so the
/// innermost element carrying the text wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainsMatcher;

impl TextMatcher for ContainsMatcher {
    fn score(&self, wanted: &str, candidate: &str) -> Option<f64> {
        if wanted.is_empty() || !candidate.contains(wanted) {
            return None;
        }
        Some(wanted.len() as f64 / candidate.len().max(1) as f64)
    }

    fn candidate_limit(&self, _wanted: &str) -> usize {
        50_000
    }
}

/// Approximate label match, tolerant of case, punctuation, spacing and small
/// wording changes.
#[derive(Debug, Clone, Copy)]
pub struct BestMatcher {
    /// Minimum score to qualify.
    pub threshold: f64,
}

impl Default for BestMatcher {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

impl TextMatcher for BestMatcher {
    fn score(&self, wanted: &str, candidate: &str) -> Option<f64> {
        let w = compact(wanted);
        let c = compact(candidate);
        if w.is_empty() || c.is_empty() {
            return None;
        }

        let (short, long) = if w.len() <= c.len() { (&w, &c) } else { (&c, &w) };
        let ratio = short.len() as f64 / long.len() as f64;

        // Containment only counts when the shorter text is a substantial part
        // of the longer one; a bare word inside a sentence is not a match.
        let score = if w == c {
            1.0
        } else if ratio >= 0.5 && long.contains(short.as_str()) {
            0.5 + 0.45 * ratio
        } else {
            0.9 * token_overlap(wanted, candidate)
        };

        (score >= self.threshold).then_some(score)
    }
}

/// Lowercase alphanumerics only.
fn compact(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Jaccard similarity of the lowercase word sets.
fn token_overlap(a: &str, b: &str) -> f64 {
    use std::collections::HashSet;

    let words = |s: &str| -> HashSet<String> {
        s.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect()
    };
    let a = words(a);
    let b = words(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(&b).count() as f64;
    let union = a.union(&b).count() as f64;
    inter / union
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exact() {
        assert_eq!(ExactMatcher.score("DeepSearch", "  DeepSearch "), Some(1.0));
        assert_eq!(ExactMatcher.score("DeepSearch", "Deep Search"), None);
    }

    #[test]
    fn test_contains_prefers_innermost() {
        let candidates = strings(&["The answer is {NO} because ...", "{NO}", "nothing"]);
        let (idx, text) = ContainsMatcher.best("{NO}", &candidates).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(text, "{NO}");
        assert!(ContainsMatcher.best("{YES}", &candidates).is_none());
    }

    #[test]
    fn test_contains_is_case_sensitive() {
        assert!(ContainsMatcher.score("{NO}", "{no}").is_none());
    }

    #[test]
    fn test_best_tolerates_label_drift() {
        let m = BestMatcher::default();
        assert_eq!(m.score("DeepSearch", "Deep Search"), Some(1.0));
        assert!(m.score("DeepSearch", "DeeperSearch").is_none());
        assert!(m.score("DeepSearch", "DeepSearch (beta)").is_some());
        assert!(m.score("DeepSearch", "Think").is_none());
    }

    #[test]
    fn test_best_picks_highest_score() {
        let m = BestMatcher::default();
        let candidates = strings(&["Think", "DeepSearch mode enabled for this chat", "DeepSearch"]);
        let (idx, _) = m.best("DeepSearch", &candidates).unwrap();
        assert_eq!(idx, 2);
    }

    #[test]
    fn test_best_matches_reworded_notice() {
        let m = BestMatcher::default();
        let wanted = "You've reached your limit of 30 Grok DeepSearch questions per 2 hours for now.";
        let seen = "You have reached your limit of 30 DeepSearch questions per 2 hours for now";
        assert!(m.score(wanted, seen).is_some());
        assert!(m.score(wanted, "Ask anything").is_none());
        assert!(m.score(wanted, "DeepSearch").is_none());
    }
}
