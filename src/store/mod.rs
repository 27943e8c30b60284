//! The store owns all persistent state: schema, transactions, and typed
//! operations over documents, content blobs, chunk vectors, and the LLM
//! response cache.
//!
//! Ownership rules:
//!
//! - Only the store touches the database handle; callers never see SQL.
//! - Every multi-statement mutation runs inside a single transaction,
//!   including the FTS mirror rows that track active documents.
//! - Reads are short-lived snapshot reads; a single process writes at a time.
//!
//! Full-text and vector search primitives live in the [`fts`] and [`vec`]
//! submodules as further `impl Store` blocks.

mod fts;
mod schema;
mod vec;

pub use fts::{build_fts_query, normalize_bm25, FtsResult};
pub use vec::VecResult;

use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::error::{QmdError, Result};

/// A logical file within a collection at a point in time.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: i64,
    pub collection: String,
    pub path: String,
    pub title: String,
    pub hash: String,
    pub created_at: i64,
    pub modified_at: i64,
    pub active: bool,
}

/// Summary returned by [`Store::get_index_health`].
#[derive(Debug, Clone)]
pub struct IndexHealth {
    /// Content hashes of active documents still lacking vectors.
    pub needs_embedding: u64,
    /// Active document count.
    pub total_docs: u64,
    /// Days since the newest active document was modified.
    pub days_stale: i64,
}

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open the index database, creating it and its schema if missing.
    /// Schema errors are fatal.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let pool = crate::db::connect(path).await?;
        schema::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ============ Content blobs ============

    /// Idempotent insert keyed by content hash.
    pub async fn insert_content(&self, hash: &str, body: &str, now: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO content (hash, body, created_at) VALUES (?, ?, ?)")
            .bind(hash)
            .bind(body)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_content(&self, hash: &str) -> Result<Option<String>> {
        let body: Option<String> = sqlx::query_scalar("SELECT body FROM content WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(body)
    }

    // ============ Documents ============

    /// Insert a new document. Fails with [`QmdError::Conflict`] when an
    /// active row already exists for `(collection, path)`.
    pub async fn insert_document(
        &self,
        collection: &str,
        path: &str,
        title: &str,
        hash: &str,
        created: i64,
        modified: i64,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let id = insert_document_tx(&mut tx, collection, path, title, hash, created, modified)
            .await?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn find_active_document(
        &self,
        collection: &str,
        path: &str,
    ) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, collection, path, title, hash, created_at, modified_at, active
             FROM documents WHERE collection = ? AND path = ? AND active = 1",
        )
        .bind(collection)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_document))
    }

    /// Point an existing document at new content. Atomic with its FTS mirror.
    pub async fn update_document(
        &self,
        id: i64,
        title: &str,
        hash: &str,
        modified: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        update_document_tx(&mut tx, id, title, hash, modified).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Update only the derived title (content hash unchanged).
    pub async fn update_document_title(&self, id: i64, title: &str, modified: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT path, hash FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| QmdError::NotFound(format!("document id {id}")))?;
        let path: String = row.get("path");
        let hash: String = row.get("hash");
        let body: String = sqlx::query_scalar("SELECT body FROM content WHERE hash = ?")
            .bind(&hash)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| QmdError::NotFound(format!("content {hash}")))?;

        sqlx::query("UPDATE documents SET title = ?, modified_at = ? WHERE id = ?")
            .bind(title)
            .bind(modified)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        fts_delete(&mut tx, id).await?;
        fts_insert(&mut tx, id, &body, title, &path).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Soft-delete: sets `active = 0`. Returns whether a row changed.
    pub async fn deactivate_document(&self, collection: &str, path: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM documents WHERE collection = ? AND path = ? AND active = 1",
        )
        .bind(collection)
        .bind(path)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = id else {
            return Ok(false);
        };

        sqlx::query("UPDATE documents SET active = 0 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        fts_delete(&mut tx, id).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// New document plus its content blob, one transaction. Used by
    /// ingestion so each file's reconciliation commits atomically.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_document(
        &self,
        collection: &str,
        path: &str,
        title: &str,
        hash: &str,
        body: &str,
        created: i64,
        modified: i64,
        now: i64,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO content (hash, body, created_at) VALUES (?, ?, ?)")
            .bind(hash)
            .bind(body)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        let id = insert_document_tx(&mut tx, collection, path, title, hash, created, modified)
            .await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Changed content for an existing document, one transaction.
    pub async fn replace_document_content(
        &self,
        id: i64,
        title: &str,
        hash: &str,
        body: &str,
        modified: i64,
        now: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO content (hash, body, created_at) VALUES (?, ?, ?)")
            .bind(hash)
            .bind(body)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        update_document_tx(&mut tx, id, title, hash, modified).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Active documents, optionally restricted to one collection, ordered by
    /// `(collection, path)`.
    pub async fn list_active_documents(
        &self,
        collection: Option<&str>,
    ) -> Result<Vec<Document>> {
        let rows = match collection {
            Some(coll) => {
                sqlx::query(
                    "SELECT id, collection, path, title, hash, created_at, modified_at, active
                     FROM documents WHERE active = 1 AND collection = ?
                     ORDER BY collection, path",
                )
                .bind(coll)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, collection, path, title, hash, created_at, modified_at, active
                     FROM documents WHERE active = 1 ORDER BY collection, path",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.into_iter().map(row_to_document).collect())
    }

    /// Paths of active documents in a collection.
    pub async fn active_paths(&self, collection: &str) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT path FROM documents WHERE collection = ? AND active = 1",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Look up an active document by its 6-character hash prefix. The first
    /// match by id wins when prefixes collide.
    pub async fn find_document_by_docid(&self, prefix: &str) -> Result<Option<Document>> {
        let clean: String = prefix
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .collect::<String>()
            .to_lowercase();
        if clean.is_empty() {
            return Ok(None);
        }
        let pattern = format!("{clean}%");
        let row = sqlx::query(
            "SELECT id, collection, path, title, hash, created_at, modified_at, active
             FROM documents WHERE active = 1 AND hash LIKE ? ORDER BY id LIMIT 1",
        )
        .bind(pattern)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_document))
    }

    /// Rename a collection across its document rows and FTS mirror.
    pub async fn rename_collection(&self, old: &str, new: &str) -> Result<u64> {
        let result = sqlx::query("UPDATE documents SET collection = ? WHERE collection = ?")
            .bind(new)
            .bind(old)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Deactivate every active document in a collection. Returns the count.
    pub async fn deactivate_collection(&self, collection: &str) -> Result<u64> {
        let paths = self.active_paths(collection).await?;
        let mut n = 0u64;
        for path in paths {
            if self.deactivate_document(collection, &path).await? {
                n += 1;
            }
        }
        Ok(n)
    }

    // ============ LLM response cache ============

    pub async fn cache_get(&self, key: &str, ttl_secs: i64, now: i64) -> Result<Option<String>> {
        let row = sqlx::query("SELECT response, created_at FROM llm_cache WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let created: i64 = row.get("created_at");
                if now - created > ttl_secs {
                    sqlx::query("DELETE FROM llm_cache WHERE key = ?")
                        .bind(key)
                        .execute(&self.pool)
                        .await?;
                    Ok(None)
                } else {
                    Ok(Some(row.get("response")))
                }
            }
            None => Ok(None),
        }
    }

    pub async fn cache_put(&self, key: &str, response: &str, now: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO llm_cache (key, response, created_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET response = excluded.response,
                                           created_at = excluded.created_at",
        )
        .bind(key)
        .bind(response)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_llm_cache(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM llm_cache").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    // ============ Cleanup ============

    /// Remove content blobs no document row references (history included).
    pub async fn cleanup_orphaned_content(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM content WHERE hash NOT IN (SELECT DISTINCT hash FROM documents)",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Hard-delete soft-deleted document rows.
    pub async fn delete_inactive_documents(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM documents WHERE active = 0")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    // ============ Health and counts ============

    pub async fn get_index_health(&self, now: i64) -> Result<IndexHealth> {
        let total_docs: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE active = 1")
                .fetch_one(&self.pool)
                .await?;

        let needs_embedding: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT d.hash) FROM documents d
             WHERE d.active = 1
               AND d.hash NOT IN (SELECT DISTINCT hash FROM vectors)",
        )
        .fetch_one(&self.pool)
        .await?;

        let newest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(modified_at) FROM documents WHERE active = 1")
                .fetch_one(&self.pool)
                .await?;

        let days_stale = newest.map(|ts| (now - ts).max(0) / 86_400).unwrap_or(0);

        Ok(IndexHealth {
            needs_embedding: needs_embedding as u64,
            total_docs: total_docs as u64,
            days_stale,
        })
    }

    /// `(collection, active document count)` pairs for status output.
    pub async fn collection_counts(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT collection, COUNT(*) AS n FROM documents
             WHERE active = 1 GROUP BY collection ORDER BY collection",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("collection"), row.get("n")))
            .collect())
    }
}

// ============ Transaction helpers ============

async fn insert_document_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    collection: &str,
    path: &str,
    title: &str,
    hash: &str,
    created: i64,
    modified: i64,
) -> Result<i64> {
    let existing: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM documents WHERE collection = ? AND path = ? AND active = 1",
    )
    .bind(collection)
    .bind(path)
    .fetch_optional(&mut **tx)
    .await?;
    if existing.is_some() {
        return Err(QmdError::Conflict(format!(
            "active document already exists at {collection}/{path}"
        )));
    }

    let body: String = sqlx::query_scalar("SELECT body FROM content WHERE hash = ?")
        .bind(hash)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| QmdError::NotFound(format!("content {hash}")))?;

    let result = sqlx::query(
        "INSERT INTO documents (collection, path, title, hash, created_at, modified_at, active)
         VALUES (?, ?, ?, ?, ?, ?, 1)",
    )
    .bind(collection)
    .bind(path)
    .bind(title)
    .bind(hash)
    .bind(created)
    .bind(modified)
    .execute(&mut **tx)
    .await?;
    let id = result.last_insert_rowid();

    fts_insert(tx, id, &body, title, path).await?;
    Ok(id)
}

async fn update_document_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    id: i64,
    title: &str,
    hash: &str,
    modified: i64,
) -> Result<()> {
    let path: String = sqlx::query_scalar("SELECT path FROM documents WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| QmdError::NotFound(format!("document id {id}")))?;

    let body: String = sqlx::query_scalar("SELECT body FROM content WHERE hash = ?")
        .bind(hash)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| QmdError::NotFound(format!("content {hash}")))?;

    sqlx::query("UPDATE documents SET title = ?, hash = ?, modified_at = ? WHERE id = ?")
        .bind(title)
        .bind(hash)
        .bind(modified)
        .bind(id)
        .execute(&mut **tx)
        .await?;

    fts_delete(tx, id).await?;
    fts_insert(tx, id, &body, title, &path).await?;
    Ok(())
}

async fn fts_insert(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    doc_id: i64,
    body: &str,
    title: &str,
    path: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO documents_fts (doc_id, body, title, path) VALUES (?, ?, ?, ?)")
        .bind(doc_id)
        .bind(body)
        .bind(title)
        .bind(path)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn fts_delete(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, doc_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM documents_fts WHERE doc_id = ?")
        .bind(doc_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn row_to_document(row: sqlx::sqlite::SqliteRow) -> Document {
    Document {
        id: row.get("id"),
        collection: row.get("collection"),
        path: row.get("path"),
        title: row.get("title"),
        hash: row.get("hash"),
        created_at: row.get("created_at"),
        modified_at: row.get("modified_at"),
        active: row.get::<i64, _>("active") != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::hash_content;

    async fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("test.sqlite")).await.unwrap();
        (dir, store)
    }

    async fn add(store: &Store, collection: &str, path: &str, body: &str) -> (String, i64) {
        let hash = hash_content(body);
        let id = store
            .add_document(collection, path, "title", &hash, body, 100, 100, 100)
            .await
            .unwrap();
        (hash, id)
    }

    #[tokio::test]
    async fn content_insert_is_idempotent() {
        let (_dir, store) = open_store().await;
        let hash = hash_content("body");
        store.insert_content(&hash, "body", 1).await.unwrap();
        store.insert_content(&hash, "body", 2).await.unwrap();
        assert_eq!(store.get_content(&hash).await.unwrap().as_deref(), Some("body"));
    }

    #[tokio::test]
    async fn duplicate_active_document_conflicts() {
        let (_dir, store) = open_store().await;
        add(&store, "notes", "a.md", "alpha body").await;
        let hash = hash_content("other body");
        store.insert_content(&hash, "other body", 1).await.unwrap();
        let err = store
            .insert_document("notes", "a.md", "t", &hash, 1, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, QmdError::Conflict(_)));
    }

    #[tokio::test]
    async fn deactivate_then_reinsert() {
        let (_dir, store) = open_store().await;
        add(&store, "notes", "a.md", "alpha body").await;

        assert!(store.deactivate_document("notes", "a.md").await.unwrap());
        assert!(!store.deactivate_document("notes", "a.md").await.unwrap());
        assert!(store
            .find_active_document("notes", "a.md")
            .await
            .unwrap()
            .is_none());

        // A fresh insert at the same path is allowed after deactivation.
        add(&store, "notes", "a.md", "alpha body v2").await;
        let doc = store
            .find_active_document("notes", "a.md")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.hash, hash_content("alpha body v2"));
    }

    #[tokio::test]
    async fn update_document_repoints_hash() {
        let (_dir, store) = open_store().await;
        let (_, id) = add(&store, "notes", "a.md", "first").await;
        let new_hash = hash_content("second");
        store
            .replace_document_content(id, "new title", &new_hash, "second", 200, 200)
            .await
            .unwrap();
        let doc = store
            .find_active_document("notes", "a.md")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.hash, new_hash);
        assert_eq!(doc.title, "new title");
        assert_eq!(doc.modified_at, 200);
    }

    #[tokio::test]
    async fn docid_prefix_lookup() {
        let (_dir, store) = open_store().await;
        let (hash, _) = add(&store, "notes", "a.md", "alpha body").await;
        let doc = store
            .find_document_by_docid(&hash[..6])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.path, "a.md");
        assert!(store
            .find_document_by_docid("zzzzzz")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn orphaned_content_is_collected() {
        let (_dir, store) = open_store().await;
        let (hash, _) = add(&store, "notes", "a.md", "alpha body").await;
        store.deactivate_document("notes", "a.md").await.unwrap();

        // Still referenced by the inactive row.
        assert_eq!(store.cleanup_orphaned_content().await.unwrap(), 0);

        assert_eq!(store.delete_inactive_documents().await.unwrap(), 1);
        assert_eq!(store.cleanup_orphaned_content().await.unwrap(), 1);
        assert!(store.get_content(&hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn index_health_counts() {
        let (_dir, store) = open_store().await;
        add(&store, "notes", "a.md", "alpha body").await;
        add(&store, "notes", "b.md", "beta body").await;

        let health = store.get_index_health(100 + 86_400 * 3).await.unwrap();
        assert_eq!(health.total_docs, 2);
        assert_eq!(health.needs_embedding, 2);
        assert_eq!(health.days_stale, 3);
    }

    #[tokio::test]
    async fn cache_honors_ttl() {
        let (_dir, store) = open_store().await;
        store.cache_put("k", "v", 1000).await.unwrap();
        assert_eq!(
            store.cache_get("k", 60, 1030).await.unwrap().as_deref(),
            Some("v")
        );
        assert!(store.cache_get("k", 60, 1100).await.unwrap().is_none());
        // Expired entry was evicted.
        assert!(store.cache_get("k", 600, 1101).await.unwrap().is_none());
    }
}
