//! Full-text search over the FTS5 mirror table.
//!
//! The user query is compiled into a three-tier FTS5 match expression so
//! exact phrases outrank proximity matches, which outrank any-term hits:
//!
//! ```text
//! ("pasta water") OR NEAR("pasta" "water", 10) OR ("pasta" OR "water")
//! ```
//!
//! FTS5's `bm25()` rank is negative (more negative = better). It is folded
//! into a stable `[0, 1]` score with a logistic transform so downstream
//! fusion can compare it against vector similarities.

use sqlx::Row;

use super::Store;
use crate::error::Result;

/// A per-document full-text hit. One row per document (best snippet),
/// never per chunk.
#[derive(Debug, Clone)]
pub struct FtsResult {
    pub id: i64,
    pub collection: String,
    pub path: String,
    pub title: String,
    pub hash: String,
    /// Normalized BM25 score in `[0, 1]`.
    pub score: f64,
    pub snippet: String,
}

/// Build the tiered FTS5 match expression for a user query.
///
/// Input is sanitized to alphanumerics and apostrophes; terms shorter than
/// two characters are dropped. Returns `None` when nothing queryable
/// remains.
pub fn build_fts_query(query: &str) -> Option<String> {
    let sanitized: String = query
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '\'' { c } else { ' ' })
        .collect();

    let terms: Vec<&str> = sanitized
        .split_whitespace()
        .filter(|t| t.chars().count() >= 2)
        .collect();

    match terms.len() {
        0 => None,
        1 => Some(format!("\"{}\"", terms[0])),
        _ => {
            let phrase = format!("(\"{}\")", terms.join(" "));
            let near_terms = terms
                .iter()
                .map(|t| format!("\"{t}\""))
                .collect::<Vec<_>>()
                .join(" ");
            let near = format!("NEAR({near_terms}, 10)");
            let any = terms
                .iter()
                .map(|t| format!("\"{t}\""))
                .collect::<Vec<_>>()
                .join(" OR ");
            Some(format!("{phrase} OR {near} OR ({any})"))
        }
    }
}

/// Fold a raw (negative) BM25 rank into `[~0.01, ~0.99]`, monotonically.
pub fn normalize_bm25(raw: f64) -> f64 {
    let s = raw.abs();
    1.0 / (1.0 + (-(s - 5.0) / 3.0).exp())
}

impl Store {
    /// Ranked full-text search. `collections`, when present, restricts the
    /// result to the union of the named collections; an empty list yields
    /// an empty result.
    pub async fn search_fts(
        &self,
        query: &str,
        limit: usize,
        collections: Option<&[String]>,
    ) -> Result<Vec<FtsResult>> {
        let Some(match_expr) = build_fts_query(query) else {
            return Ok(Vec::new());
        };
        if matches!(collections, Some(c) if c.is_empty()) {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT d.id, d.collection, d.path, d.title, d.hash,
                    documents_fts.rank AS rank,
                    snippet(documents_fts, 1, '', '', '…', 24) AS snip
             FROM documents_fts
             JOIN documents d ON d.id = documents_fts.doc_id
             WHERE documents_fts MATCH ? AND d.active = 1",
        );
        if let Some(cols) = collections {
            let placeholders = vec!["?"; cols.len()].join(", ");
            sql.push_str(&format!(" AND d.collection IN ({placeholders})"));
        }
        sql.push_str(" ORDER BY documents_fts.rank LIMIT ?");

        let mut q = sqlx::query(&sql).bind(&match_expr);
        if let Some(cols) = collections {
            for c in cols {
                q = q.bind(c);
            }
        }
        q = q.bind(limit as i64);

        let rows = q.fetch_all(self.pool()).await?;
        let results = rows
            .into_iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                FtsResult {
                    id: row.get("id"),
                    collection: row.get("collection"),
                    path: row.get("path"),
                    title: row.get("title"),
                    hash: row.get("hash"),
                    score: normalize_bm25(rank),
                    snippet: row.get("snip"),
                }
            })
            .collect();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::hash_content;
    use crate::store::Store;

    #[test]
    fn fts_query_schema_for_two_terms() {
        let q = build_fts_query("pasta water!").unwrap();
        assert_eq!(
            q,
            "(\"pasta water\") OR NEAR(\"pasta\" \"water\", 10) OR (\"pasta\" OR \"water\")"
        );
    }

    #[test]
    fn fts_query_single_term() {
        assert_eq!(build_fts_query("pasta").unwrap(), "\"pasta\"");
        // Short fragments are dropped entirely.
        assert_eq!(build_fts_query("a ?"), None);
        assert_eq!(build_fts_query("!!"), None);
    }

    #[test]
    fn fts_query_keeps_apostrophes_and_drops_punctuation() {
        let q = build_fts_query("what's := this?").unwrap();
        assert!(q.contains("\"what's\""));
        assert!(q.contains("\"this\""));
        assert!(!q.contains(":="));
    }

    #[test]
    fn bm25_normalization_is_monotone_in_unit_interval() {
        let raws = [-0.1, -1.0, -3.0, -5.0, -8.0, -15.0, -40.0];
        let mut prev = 0.0;
        for raw in raws {
            let s = normalize_bm25(raw);
            assert!(s > 0.0 && s < 1.0, "out of range: {s}");
            assert!(s >= prev, "not monotone at raw {raw}");
            prev = s;
        }
        // Midpoint of the logistic sits at |raw| = 5.
        assert!((normalize_bm25(-5.0) - 0.5).abs() < 1e-9);
    }

    async fn seeded_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("t.sqlite")).await.unwrap();
        let docs = [
            ("food", "pasta.md", "pasta water binds sauce when emulsified"),
            ("dev", "git.md", "git feature branch workflow notes"),
            ("travel", "japan.md", "Japan trains are fast and punctual"),
        ];
        for (coll, path, body) in docs {
            let hash = hash_content(body);
            store
                .add_document(coll, path, path, &hash, body, 1, 1, 1)
                .await
                .unwrap();
        }
        (dir, store)
    }

    #[tokio::test]
    async fn search_finds_matching_document() {
        let (_dir, store) = seeded_store().await;
        let results = store.search_fts("pasta", 20, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "pasta.md");
        assert!(results[0].score > 0.0);
    }

    #[tokio::test]
    async fn search_limit_is_monotone() {
        let (_dir, store) = seeded_store().await;
        let small = store.search_fts("notes OR pasta OR japan", 1, None).await.unwrap();
        let large = store.search_fts("notes OR pasta OR japan", 20, None).await.unwrap();
        assert!(large.len() >= small.len());
        // Increasing the limit only appends at the tail.
        for (a, b) in small.iter().zip(large.iter()) {
            assert_eq!(a.id, b.id);
        }
    }

    #[tokio::test]
    async fn collection_filter_is_a_union() {
        let (_dir, store) = seeded_store().await;
        let filter = vec!["food".to_string(), "travel".to_string()];
        let results = store
            .search_fts("pasta OR japan OR git", 20, Some(&filter))
            .await
            .unwrap();
        let colls: Vec<&str> = results.iter().map(|r| r.collection.as_str()).collect();
        assert!(colls.contains(&"food"));
        assert!(colls.contains(&"travel"));
        assert!(!colls.contains(&"dev"));

        let empty: Vec<String> = Vec::new();
        assert!(store
            .search_fts("pasta", 20, Some(&empty))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn deactivated_documents_drop_out_of_search() {
        let (_dir, store) = seeded_store().await;
        store.deactivate_document("travel", "japan.md").await.unwrap();
        let results = store.search_fts("japan", 20, None).await.unwrap();
        assert!(results.is_empty());
    }
}
