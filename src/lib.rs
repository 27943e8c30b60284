//! # qmd
//!
//! **Hybrid search over local Markdown corpora, built to serve AI agents as
//! a long-term memory backend.**
//!
//! qmd ingests files into named *collections*, maintains a content-addressed
//! store with a full-text (FTS5/BM25) index and a chunk-vector index, and
//! answers natural-language queries through a multi-stage pipeline: query
//! expansion, parallel lexical + vector retrieval, reciprocal-rank fusion,
//! per-document chunk selection, and LLM reranking.
//!
//! ## Architecture
//!
//! ```text
//! Collections ─▶ Ingest ─▶ SQLite (content + FTS5 + vectors)
//!                              │
//!            ┌─────────────────┤
//!            ▼                 ▼
//!       CLI (qmd)      HTTP tool server (MCP hosts)
//!            │                 │
//!            └──── Retrieval pipeline ──── LLM gateway (expand / embed / rerank)
//! ```
//!
//! ## Query pipeline
//!
//! 1. BM25 probe; a strong, well-separated top hit skips expansion.
//! 2. LLM query expansion into `lex:` / `vec:` / `hyde:` sub-queries
//!    (cached, with a deterministic fallback).
//! 3. Concurrent fan-out over FTS and the vector index.
//! 4. Reciprocal-rank fusion (`k = 60`), original lists weighted 2.0.
//! 5. Per-document chunk selection by fast term matching.
//! 6. LLM rerank; failures degrade to fused order, never to an error.
//! 7. Score blend, dedup (exact docid + bigram-Jaccard), format.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | `index.yml` collections/contexts, `.env`, tuning knobs |
//! | [`error`] | typed error taxonomy |
//! | [`db`] | SQLite connection pool (WAL) |
//! | [`store`] | schema and all persistence: documents, content, vectors, FTS, cache |
//! | [`chunker`] | content hashing, title extraction, char/token chunking |
//! | [`llm`] | provider gateway: transport, retry, circuit breaker, prompts |
//! | [`ingest`] | collection reconciliation with safety filters |
//! | [`embedder`] | vector index maintenance |
//! | [`search`] | BM25 / vector / full-pipeline retrieval |
//! | [`fusion`] | RRF, term extraction, near-duplicate detection |
//! | [`context`] | context annotations and resolution |
//! | [`get`] | fileref parsing, `get` / `multi-get` |
//! | [`format`] | text/json/csv/md/xml/files output |
//! | [`status`] | status, doctor, cleanup |
//! | [`progress`] | stderr progress reporting |
//! | [`server`] | MCP-compatible HTTP tool server |
//! | [`engine`] | top-level owner of store + gateway + config |

pub mod chunker;
pub mod config;
pub mod context;
pub mod db;
pub mod embedder;
pub mod engine;
pub mod error;
pub mod format;
pub mod fusion;
pub mod get;
pub mod ingest;
pub mod llm;
pub mod progress;
pub mod search;
pub mod server;
pub mod status;
pub mod store;
