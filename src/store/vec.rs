//! Chunk-vector persistence and nearest-neighbor scan.
//!
//! Vectors are stored as little-endian `f32` BLOBs keyed by
//! `(content hash, chunk seq)`. A singleton `vec_meta` row records the
//! dimension and model of the active vector table; all vectors share that
//! dimension, and changing the embedding model requires a rebuild.
//!
//! The scan is brute force: cosine similarity computed in-process over the
//! vectors referenced by active documents. Results are chunk-level — one
//! row per matching chunk, never collapsed per file.

use sqlx::Row;
use std::collections::HashSet;

use super::Store;
use crate::error::{QmdError, Result};

/// A chunk-level vector hit.
#[derive(Debug, Clone)]
pub struct VecResult {
    pub hash: String,
    pub seq: i64,
    pub pos: i64,
    /// Cosine similarity mapped to `[0, 1]`.
    pub score: f64,
    pub collection: String,
    pub path: String,
    pub title: String,
}

/// Encode a float vector as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; `0.0` for mismatched or empty vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

impl Store {
    /// Record (or verify) the vector table dimension. Fails with
    /// [`QmdError::DimensionMismatch`] when a different dimension is
    /// already on disk.
    pub async fn ensure_vec_table(&self, dimension: usize, model: &str) -> Result<()> {
        let existing: Option<i64> = sqlx::query_scalar("SELECT dimension FROM vec_meta WHERE id = 1")
            .fetch_optional(self.pool())
            .await?;

        match existing {
            Some(dim) if dim as usize != dimension => Err(QmdError::DimensionMismatch {
                existing: dim as usize,
                requested: dimension,
            }),
            Some(_) => Ok(()),
            None => {
                sqlx::query("INSERT INTO vec_meta (id, dimension, model) VALUES (1, ?, ?)")
                    .bind(dimension as i64)
                    .bind(model)
                    .execute(self.pool())
                    .await?;
                Ok(())
            }
        }
    }

    /// `(dimension, model)` of the active vector table, if one exists.
    pub async fn vec_table_info(&self) -> Result<Option<(usize, String)>> {
        let row = sqlx::query("SELECT dimension, model FROM vec_meta WHERE id = 1")
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| (r.get::<i64, _>("dimension") as usize, r.get("model"))))
    }

    /// Drop every vector and the dimension record (model change, `embed -f`).
    pub async fn clear_all_embeddings(&self) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM vectors").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM vec_meta").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Content hashes of active documents with no vector for `model`.
    pub async fn get_hashes_needing_embedding(&self, model: &str) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT d.hash FROM documents d
             WHERE d.active = 1
               AND d.hash NOT IN (SELECT hash FROM vectors WHERE model = ?)
             ORDER BY d.hash",
        )
        .bind(model)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// All content hashes referenced by active documents.
    pub async fn get_hashes_for_embedding(&self) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT hash FROM documents WHERE active = 1 ORDER BY hash",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn insert_embedding(
        &self,
        hash: &str,
        seq: i64,
        pos: i64,
        vector: &[f32],
        model: &str,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO vectors (hash, seq, pos, embedding, model, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(hash, seq) DO UPDATE SET
                 pos = excluded.pos,
                 embedding = excluded.embedding,
                 model = excluded.model,
                 created_at = excluded.created_at",
        )
        .bind(hash)
        .bind(seq)
        .bind(pos)
        .bind(vec_to_blob(vector))
        .bind(model)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn count_vectors(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors")
            .fetch_one(self.pool())
            .await?;
        Ok(n as u64)
    }

    /// Remove vectors whose content blob is gone.
    pub async fn cleanup_orphaned_vectors(&self) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM vectors WHERE hash NOT IN (SELECT hash FROM content)")
                .execute(self.pool())
                .await?;
        Ok(result.rows_affected())
    }

    /// Chunk-level nearest-neighbor search. Fails with
    /// [`QmdError::VectorUnavailable`] when no vector table has been built,
    /// and [`QmdError::DimensionMismatch`] when the query embedding does
    /// not match the table dimension.
    pub async fn search_vec(
        &self,
        embedding: &[f32],
        model: &str,
        limit: usize,
        collections: Option<&[String]>,
    ) -> Result<Vec<VecResult>> {
        let Some((dimension, _)) = self.vec_table_info().await? else {
            return Err(QmdError::VectorUnavailable);
        };
        if dimension != embedding.len() {
            return Err(QmdError::DimensionMismatch {
                existing: dimension,
                requested: embedding.len(),
            });
        }
        if matches!(collections, Some(c) if c.is_empty()) {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT v.hash, v.seq, v.pos, v.embedding, d.collection, d.path, d.title
             FROM vectors v
             JOIN documents d ON d.hash = v.hash AND d.active = 1",
        );
        if let Some(cols) = collections {
            let placeholders = vec!["?"; cols.len()].join(", ");
            sql.push_str(&format!(" AND d.collection IN ({placeholders})"));
        }
        sql.push_str(" WHERE v.model = ? ORDER BY d.id");

        let mut q = sqlx::query(&sql);
        if let Some(cols) = collections {
            for c in cols {
                q = q.bind(c);
            }
        }
        q = q.bind(model);

        let rows = q.fetch_all(self.pool()).await?;

        // Identical files share a hash; keep one row per (hash, seq) but
        // never collapse distinct chunks of the same file.
        let mut seen: HashSet<(String, i64)> = HashSet::new();
        let mut results: Vec<VecResult> = Vec::new();
        for row in rows {
            let hash: String = row.get("hash");
            let seq: i64 = row.get("seq");
            if !seen.insert((hash.clone(), seq)) {
                continue;
            }
            let blob: Vec<u8> = row.get("embedding");
            let vec = blob_to_vec(&blob);
            let cos = cosine_similarity(embedding, &vec) as f64;
            results.push(VecResult {
                hash,
                seq,
                pos: row.get("pos"),
                score: (cos + 1.0) / 2.0,
                collection: row.get("collection"),
                path: row.get("path"),
                title: row.get("title"),
            });
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(limit);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::hash_content;
    use crate::store::Store;

    #[test]
    fn blob_roundtrip() {
        let v = vec![1.0f32, -2.5, 3.125, 0.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn cosine_basics() {
        let a = [1.0, 0.0];
        assert!((cosine_similarity(&a, &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&a, &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    async fn store_with_doc(body: &str) -> (tempfile::TempDir, Store, String) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("t.sqlite")).await.unwrap();
        let hash = hash_content(body);
        store
            .add_document("notes", "a.md", "a", &hash, body, 1, 1, 1)
            .await
            .unwrap();
        (dir, store, hash)
    }

    #[tokio::test]
    async fn search_without_vectors_is_unavailable() {
        let (_dir, store, _) = store_with_doc("body").await;
        let err = store.search_vec(&[0.1, 0.2], "m", 10, None).await.unwrap_err();
        assert!(matches!(err, QmdError::VectorUnavailable));
    }

    #[tokio::test]
    async fn dimension_is_enforced() {
        let (_dir, store, hash) = store_with_doc("body").await;
        store.ensure_vec_table(2, "m").await.unwrap();
        store.ensure_vec_table(2, "m").await.unwrap();
        let err = store.ensure_vec_table(3, "m").await.unwrap_err();
        assert!(matches!(
            err,
            QmdError::DimensionMismatch { existing: 2, requested: 3 }
        ));

        store
            .insert_embedding(&hash, 0, 0, &[1.0, 0.0], "m", 1)
            .await
            .unwrap();
        let err = store
            .search_vec(&[1.0, 0.0, 0.0], "m", 10, None)
            .await
            .unwrap_err();
        assert!(matches!(err, QmdError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn chunk_granularity_is_preserved() {
        let (_dir, store, hash) = store_with_doc("body text").await;
        store.ensure_vec_table(2, "m").await.unwrap();
        store.insert_embedding(&hash, 0, 0, &[1.0, 0.0], "m", 1).await.unwrap();
        store.insert_embedding(&hash, 1, 40, &[0.6, 0.8], "m", 1).await.unwrap();

        let results = store.search_vec(&[1.0, 0.0], "m", 10, None).await.unwrap();
        assert_eq!(results.len(), 2, "both chunks must contribute rows");
        assert_eq!(results[0].seq, 0);
        assert!(results[0].score > results[1].score);
        // Scores are mapped into [0, 1].
        for r in &results {
            assert!(r.score >= 0.0 && r.score <= 1.0);
        }
    }

    #[tokio::test]
    async fn vectors_for_inactive_documents_are_excluded() {
        let (_dir, store, hash) = store_with_doc("body text").await;
        store.ensure_vec_table(2, "m").await.unwrap();
        store.insert_embedding(&hash, 0, 0, &[1.0, 0.0], "m", 1).await.unwrap();

        store.deactivate_document("notes", "a.md").await.unwrap();
        let results = store.search_vec(&[1.0, 0.0], "m", 10, None).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn orphaned_vectors_are_cleaned() {
        let (_dir, store, hash) = store_with_doc("body text").await;
        store.ensure_vec_table(2, "m").await.unwrap();
        store.insert_embedding(&hash, 0, 0, &[1.0, 0.0], "m", 1).await.unwrap();

        store.deactivate_document("notes", "a.md").await.unwrap();
        store.delete_inactive_documents().await.unwrap();
        store.cleanup_orphaned_content().await.unwrap();
        assert_eq!(store.cleanup_orphaned_vectors().await.unwrap(), 1);
        assert_eq!(store.count_vectors().await.unwrap(), 0);
    }
}
