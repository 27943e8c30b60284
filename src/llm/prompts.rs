//! Prompt templates and response parsing for the chat-based operations.
//!
//! Both protocols are plain text on purpose: small models follow them more
//! reliably than JSON, and a tolerant line parser degrades gracefully when
//! they drift.

use crate::chunker::docid;

/// Fixed query-expansion prompt. The model must answer with exactly three
/// labeled lines and no prose.
pub const EXPANSION_PROMPT: &str = "\
You rewrite a search query for a hybrid retrieval system over personal \
Markdown notes. Reply with exactly three lines and nothing else:
lex: <keywords for full-text search, most distinctive terms first>
vec: <a rephrased natural-language query for semantic search>
hyde: <a one-sentence hypothetical note that would answer the query>";

/// Default reranker prompt. Overridden by `<config_dir>/rerank-prompt.txt`
/// when present; `{{query}}` and `{{documents}}` are substituted literally.
pub const DEFAULT_RERANK_PROMPT: &str = "\
You are a search result reranker. Given a query and a numbered list of \
candidate passages, reply with one line per RELEVANT candidate, most \
relevant first, in the form:
[index] the sentence or phrase from that candidate which answers the query

Skip irrelevant candidates. If none are relevant reply with the single \
word NONE.

Query: {{query}}

Candidates:
{{documents}}";

/// The three kinds of sub-queries expansion can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Keyword query for the full-text index.
    Lex,
    /// Natural-language query for the vector index.
    Vec,
    /// Hypothetical document (HyDE) for the vector index.
    Hyde,
}

/// One expanded sub-query.
#[derive(Debug, Clone, PartialEq)]
pub struct Queryable {
    pub kind: QueryKind,
    pub text: String,
}

/// Parse the model's expansion reply tolerantly: case-insensitive `lex:` /
/// `vec:` / `hyde:` prefixes, unknown lines ignored, first occurrence of
/// each kind wins.
pub fn parse_expansion(raw: &str) -> Vec<Queryable> {
    let mut out: Vec<Queryable> = Vec::new();
    for line in raw.lines() {
        let line = line.trim().trim_start_matches(['-', '*', ' ']);
        let lower = line.to_lowercase();
        let (kind, prefix_len) = if lower.starts_with("lex:") {
            (QueryKind::Lex, 4)
        } else if lower.starts_with("vec:") {
            (QueryKind::Vec, 4)
        } else if lower.starts_with("hyde:") {
            (QueryKind::Hyde, 5)
        } else {
            continue;
        };
        let text = line[prefix_len..].trim();
        if text.is_empty() || out.iter().any(|q| q.kind == kind) {
            continue;
        }
        out.push(Queryable {
            kind,
            text: text.to_string(),
        });
    }
    out
}

/// Deterministic expansion used when the provider is unavailable or its
/// reply cannot be parsed.
pub fn fallback_expansion(query: &str, include_lexical: bool) -> Vec<Queryable> {
    let mut out = Vec::new();
    if include_lexical {
        out.push(Queryable {
            kind: QueryKind::Lex,
            text: query.to_string(),
        });
    }
    out.push(Queryable {
        kind: QueryKind::Vec,
        text: query.to_string(),
    });
    out.push(Queryable {
        kind: QueryKind::Hyde,
        text: format!("Information about {query}"),
    });
    out
}

/// Build the user prompt for query expansion, optionally carrying
/// caller-supplied context about the corpus.
pub fn render_expansion_input(query: &str, context: Option<&str>) -> String {
    match context {
        Some(ctx) if !ctx.trim().is_empty() => {
            format!("Context: {}\n\nQuery: {}", ctx.trim(), query)
        }
        _ => format!("Query: {query}"),
    }
}

/// Substitute `{{query}}` and `{{documents}}` into a rerank prompt template.
/// Documents are numbered `[0]`, `[1]`, … in input order.
pub fn render_rerank_prompt(template: &str, query: &str, documents: &[String]) -> String {
    let numbered = documents
        .iter()
        .enumerate()
        .map(|(i, d)| format!("[{i}] {d}"))
        .collect::<Vec<_>>()
        .join("\n\n");
    template
        .replace("{{query}}", query)
        .replace("{{documents}}", &numbered)
}

/// One parsed line of the LLM reranker's reply.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRerankHit {
    /// Candidate index as sent in the prompt.
    pub index: usize,
    /// Synthetic score preserving the model's ordering.
    pub score: f64,
    /// Text the model extracted from the candidate, when non-empty.
    pub extract: Option<String>,
}

/// Parse the LLM reranker's plain-text reply.
///
/// Accepts lines of the form `[i] extracted content`; out-of-range and
/// repeated indices are dropped. Scores descend by `0.05` per rank so the
/// model's ordering survives the blend. The literal `NONE` (or anything
/// unparseable) yields an empty list.
pub fn parse_llm_rerank(raw: &str, candidate_count: usize) -> Vec<LlmRerankHit> {
    let mut out: Vec<LlmRerankHit> = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('[') else {
            continue;
        };
        let Some(close) = rest.find(']') else {
            continue;
        };
        let Ok(index) = rest[..close].trim().parse::<usize>() else {
            continue;
        };
        if index >= candidate_count || out.iter().any(|h| h.index == index) {
            continue;
        }
        let extract = rest[close + 1..].trim();
        let rank = out.len();
        out.push(LlmRerankHit {
            index,
            score: 1.0 - rank as f64 * 0.05,
            extract: if extract.is_empty() {
                None
            } else {
                Some(extract.to_string())
            },
        });
    }
    out
}

/// Stable cache key for an LLM operation: canonical JSON with sorted keys.
pub fn cache_key(op: &str, provider: &str, model: &str, inputs: &[&str]) -> String {
    use std::collections::BTreeMap;
    let mut map: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
    map.insert("inputs", serde_json::json!(inputs));
    map.insert("model", serde_json::json!(model));
    map.insert("op", serde_json::json!(op));
    map.insert("provider", serde_json::json!(provider));
    // BTreeMap serializes in sorted key order, so equal inputs always
    // produce byte-identical keys.
    let canonical = serde_json::to_string(&map).unwrap_or_default();
    let hash = crate::chunker::hash_content(&canonical);
    format!("{op}:{}", docid(&hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion_parses_three_lines() {
        let raw = "lex: pasta water ratio\nvec: how much water for pasta\nhyde: Use one liter per 100g of pasta.";
        let parsed = parse_expansion(raw);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].kind, QueryKind::Lex);
        assert_eq!(parsed[0].text, "pasta water ratio");
        assert_eq!(parsed[2].kind, QueryKind::Hyde);
    }

    #[test]
    fn expansion_is_case_insensitive_and_skips_noise() {
        let raw = "Sure, here you go:\nLEX: git branching\nVEC: branch workflows\nsomething else\nHyde: A note about git.";
        let parsed = parse_expansion(raw);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[1].text, "branch workflows");
    }

    #[test]
    fn expansion_first_occurrence_wins() {
        let raw = "vec: first\nvec: second";
        let parsed = parse_expansion(raw);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].text, "first");
    }

    #[test]
    fn fallback_is_deterministic() {
        let with_lex = fallback_expansion("trains in japan", true);
        assert_eq!(with_lex.len(), 3);
        assert_eq!(with_lex[0].kind, QueryKind::Lex);
        assert_eq!(with_lex[2].text, "Information about trains in japan");

        let without = fallback_expansion("trains in japan", false);
        assert_eq!(without.len(), 2);
        assert_eq!(without[0].kind, QueryKind::Vec);
    }

    #[test]
    fn rerank_prompt_substitution() {
        let docs = vec!["alpha".to_string(), "beta".to_string()];
        let prompt = render_rerank_prompt(DEFAULT_RERANK_PROMPT, "q", &docs);
        assert!(prompt.contains("Query: q"));
        assert!(prompt.contains("[0] alpha"));
        assert!(prompt.contains("[1] beta"));
        assert!(!prompt.contains("{{query}}"));
    }

    #[test]
    fn llm_rerank_parses_ordering_and_scores() {
        let hits = parse_llm_rerank("[2] extracted\n[0] extracted", 3);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].index, 2);
        assert!((hits[0].score - 1.0).abs() < 1e-9);
        assert_eq!(hits[1].index, 0);
        assert!((hits[1].score - 0.95).abs() < 1e-9);
        assert_eq!(hits[0].extract.as_deref(), Some("extracted"));
    }

    #[test]
    fn llm_rerank_filters_bad_indices() {
        let hits = parse_llm_rerank("[9] nope\n[1] ok\n[1] repeat\nnot a line\nNONE", 3);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].index, 1);
    }

    #[test]
    fn llm_rerank_none_is_empty() {
        assert!(parse_llm_rerank("NONE", 3).is_empty());
        assert!(parse_llm_rerank("", 3).is_empty());
    }

    #[test]
    fn llm_rerank_empty_extract_is_none() {
        let hits = parse_llm_rerank("[0]", 2);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].extract.is_none());
    }

    #[test]
    fn cache_key_is_order_independent_of_nothing_but_inputs() {
        let a = cache_key("expand", "siliconflow", "m", &["q1"]);
        let b = cache_key("expand", "siliconflow", "m", &["q1"]);
        let c = cache_key("expand", "siliconflow", "m", &["q2"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("expand:"));
    }
}
