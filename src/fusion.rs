//! Rank fusion and fast lexical scoring.
//!
//! Reciprocal-rank fusion combines the ranked lists produced by the
//! retrieval fan-out; a cheap term-match score picks the chunks worth
//! sending to the reranker; character-bigram Jaccard similarity catches
//! near-identical documents that survive exact content dedup.

use std::collections::{HashMap, HashSet};

use crate::chunker::is_cjk;

/// RRF constant.
pub const RRF_K: f64 = 60.0;

/// One ranked input list for fusion. Keys are document identities; the
/// caller assigns weights (the original BM25 and vector lists get 2.0).
#[derive(Debug, Clone)]
pub struct RankedList {
    pub weight: f64,
    pub keys: Vec<String>,
}

/// A fused document with its RRF score and best rank across input lists.
#[derive(Debug, Clone)]
pub struct FusedDoc {
    pub key: String,
    pub score: f64,
    /// Best (lowest) 0-based rank the document held in any input list.
    pub best_rank: usize,
}

/// Reciprocal-rank fusion: `score(d) = Σ weight / (k + rank)`, ranks
/// 0-based. Documents whose best rank in any list was very high get a
/// bonus: rank 0 → +0.05, ranks 1–2 → +0.02.
///
/// The result is ordered by score descending, ties broken by first
/// appearance across the input lists, so fusion is deterministic given a
/// fixed set and order of lists.
pub fn rrf_fuse(lists: &[RankedList], k: f64) -> Vec<FusedDoc> {
    let mut scores: HashMap<&str, f64> = HashMap::new();
    let mut best_rank: HashMap<&str, usize> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();

    for list in lists {
        for (rank, key) in list.keys.iter().enumerate() {
            let entry = scores.entry(key.as_str()).or_insert_with(|| {
                order.push(key.as_str());
                0.0
            });
            *entry += list.weight / (k + rank as f64);
            best_rank
                .entry(key.as_str())
                .and_modify(|r| *r = (*r).min(rank))
                .or_insert(rank);
        }
    }

    let mut fused: Vec<FusedDoc> = order
        .into_iter()
        .map(|key| {
            let rank = best_rank[key];
            let bonus = match rank {
                0 => 0.05,
                1 | 2 => 0.02,
                _ => 0.0,
            };
            FusedDoc {
                key: key.to_string(),
                score: scores[key] + bonus,
                best_rank: rank,
            }
        })
        .collect();

    // Stable sort keeps first-appearance order for equal scores.
    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    fused
}

/// Extract match terms from a query for fast chunk scoring.
///
/// The query is lowercased and split on whitespace. CJK words contribute
/// character trigrams (or the word itself when shorter than three
/// characters); non-CJK tokens are kept when longer than two characters.
/// The whole lowercased query is always included as a phrase term.
pub fn extract_terms(query: &str) -> Vec<String> {
    let lower = query.to_lowercase();
    let mut terms: Vec<String> = Vec::new();

    for word in lower.split_whitespace() {
        if word.chars().any(is_cjk) {
            let chars: Vec<char> = word.chars().collect();
            if chars.len() < 3 {
                push_unique(&mut terms, word.to_string());
            } else {
                for tri in chars.windows(3) {
                    push_unique(&mut terms, tri.iter().collect());
                }
            }
        } else if word.chars().count() > 2 {
            push_unique(&mut terms, word.to_string());
        }
    }

    let phrase = lower.trim().to_string();
    if !phrase.is_empty() {
        push_unique(&mut terms, phrase);
    }
    terms
}

fn push_unique(terms: &mut Vec<String>, term: String) {
    if !terms.contains(&term) {
        terms.push(term);
    }
}

/// Fast term-match score for chunk selection: occurrences weighted by term
/// length, so rarer, longer terms (and the whole-query phrase) dominate.
pub fn score_chunk(chunk_text: &str, terms: &[String]) -> f64 {
    let lower = chunk_text.to_lowercase();
    let mut score = 0.0;
    for term in terms {
        let occurrences = lower.matches(term.as_str()).count();
        if occurrences > 0 {
            score += occurrences as f64 * term.chars().count() as f64;
        }
    }
    score
}

/// Collapse runs of whitespace so formatting differences don't defeat
/// near-duplicate detection.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn bigram_set(text: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = text.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Jaccard similarity over character bigrams of the whitespace-normalized
/// texts. `1.0` for identical inputs, `0.0` for disjoint ones.
pub fn jaccard_bigrams(a: &str, b: &str) -> f64 {
    let a = bigram_set(&normalize_whitespace(a));
    let b = bigram_set(&normalize_whitespace(b));
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(&b).count() as f64;
    let union = a.union(&b).count() as f64;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(weight: f64, keys: &[&str]) -> RankedList {
        RankedList {
            weight,
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn rrf_sums_reciprocal_ranks() {
        let lists = vec![list(1.0, &["a", "b"]), list(1.0, &["b", "a"])];
        let fused = rrf_fuse(&lists, RRF_K);
        // Both appear at ranks 0 and 1; same base score and same bonus.
        assert_eq!(fused.len(), 2);
        assert!((fused[0].score - fused[1].score).abs() < 1e-12);
        // Ties break by first appearance: "a" leads.
        assert_eq!(fused[0].key, "a");
        let expected = 1.0 / 60.0 + 1.0 / 61.0 + 0.05;
        assert!((fused[0].score - expected).abs() < 1e-12);
    }

    #[test]
    fn rrf_weights_first_lists_heavier() {
        let lists = vec![list(2.0, &["a"]), list(1.0, &["b"])];
        let fused = rrf_fuse(&lists, RRF_K);
        assert_eq!(fused[0].key, "a");
        assert!(fused[0].score > fused[1].score);
    }

    #[test]
    fn rrf_top_rank_bonus() {
        // "b" never ranks 0, so it gets the smaller bonus.
        let lists = vec![list(1.0, &["a", "b"])];
        let fused = rrf_fuse(&lists, RRF_K);
        let a = fused.iter().find(|d| d.key == "a").unwrap();
        let b = fused.iter().find(|d| d.key == "b").unwrap();
        assert_eq!(a.best_rank, 0);
        assert!((a.score - (1.0 / 60.0 + 0.05)).abs() < 1e-12);
        assert_eq!(b.best_rank, 1);
        assert!((b.score - (1.0 / 61.0 + 0.02)).abs() < 1e-12);
    }

    #[test]
    fn rrf_is_invariant_to_list_order_given_fixed_weights() {
        let l1 = list(1.0, &["a", "b", "c"]);
        let l2 = list(1.0, &["c", "a"]);
        let fused_ab = rrf_fuse(&[l1.clone(), l2.clone()], RRF_K);
        let fused_ba = rrf_fuse(&[l2, l1], RRF_K);
        for doc in &fused_ab {
            let other = fused_ba.iter().find(|d| d.key == doc.key).unwrap();
            assert!((doc.score - other.score).abs() < 1e-12);
        }
    }

    #[test]
    fn terms_include_whole_query_phrase() {
        let terms = extract_terms("How do I make Pasta?");
        assert!(terms.contains(&"how".to_string()));
        assert!(terms.contains(&"pasta?".to_string()));
        assert!(terms.contains(&"how do i make pasta?".to_string()));
        // Tokens of length <= 2 are dropped.
        assert!(!terms.contains(&"do".to_string()));
    }

    #[test]
    fn terms_extract_cjk_trigrams() {
        let terms = extract_terms("日本の電車");
        assert!(terms.contains(&"日本の".to_string()));
        assert!(terms.contains(&"本の電".to_string()));
        assert!(terms.contains(&"の電車".to_string()));

        let short = extract_terms("電車");
        assert!(short.contains(&"電車".to_string()));
    }

    #[test]
    fn chunk_scoring_prefers_matching_chunks() {
        let terms = extract_terms("pasta water");
        let hit = score_chunk("Always salt the pasta water before boiling.", &terms);
        let partial = score_chunk("Pasta is made of durum wheat.", &terms);
        let miss = score_chunk("Trains in Japan are punctual.", &terms);
        assert!(hit > partial, "{hit} vs {partial}");
        assert!(partial > miss);
        assert_eq!(miss, 0.0);
    }

    #[test]
    fn jaccard_identical_and_whitespace_insensitive() {
        assert!((jaccard_bigrams("a b c", "a  b\n c") - 1.0).abs() < 1e-12);
        assert_eq!(jaccard_bigrams("", ""), 1.0);
        assert_eq!(jaccard_bigrams("abc", ""), 0.0);
    }

    #[test]
    fn jaccard_detects_near_duplicates() {
        let a = "The pasta water binds the sauce when emulsified properly.";
        let b = "The pasta water binds the sauce when emulsified properly!";
        assert!(jaccard_bigrams(a, b) >= 0.90);

        let c = "Completely different text about git branches.";
        assert!(jaccard_bigrams(a, c) < 0.5);
    }
}
