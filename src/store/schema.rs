//! Index database schema.
//!
//! Created idempotently on every open. Tables:
//!
//! - `content` — content-addressed bodies, keyed by SHA-256.
//! - `documents` — logical files; at most one `active` row per
//!   `(collection, path)`, enforced by a partial unique index.
//! - `documents_fts` — FTS5 mirror of active documents (body, title, path),
//!   maintained in the same transaction as each document mutation.
//! - `vectors` / `vec_meta` — chunk embeddings keyed by `(hash, seq)` plus
//!   the singleton dimension record.
//! - `llm_cache` — optional response cache for best-effort LLM operations.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content (
            hash TEXT PRIMARY KEY,
            body TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            path TEXT NOT NULL,
            title TEXT NOT NULL,
            hash TEXT NOT NULL REFERENCES content(hash),
            created_at INTEGER NOT NULL,
            modified_at INTEGER NOT NULL,
            active INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS ux_documents_active
        ON documents(collection, path) WHERE active = 1
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_hash ON documents(hash)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection, active)",
    )
    .execute(pool)
    .await?;

    // FTS5 virtual tables are not idempotent natively, check first.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'documents_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE documents_fts USING fts5(
                doc_id UNINDEXED,
                body,
                title,
                path
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vectors (
            hash TEXT NOT NULL,
            seq INTEGER NOT NULL,
            pos INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            model TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (hash, seq)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vec_meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            dimension INTEGER NOT NULL,
            model TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS llm_cache (
            key TEXT PRIMARY KEY,
            response TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
