//! The retrieval pipeline.
//!
//! `search` is plain BM25, `vsearch` is vectors only, and `query` is the
//! full pipeline:
//!
//! 1. An unconditional BM25 probe; a strong, well-separated top hit skips
//!    query expansion entirely.
//! 2. Expansion (cached) into `lex:` / `vec:` / `hyde:` sub-queries.
//! 3. Concurrent fan-out: one FTS search per lexical queryable, one vector
//!    search per semantic queryable, originals always included.
//! 4. Reciprocal-rank fusion (`k = 60`), the two original lists weighted
//!    2.0, plus a small bonus for documents that topped any input list.
//! 5. Per-document chunk selection by fast term-match score.
//! 6. LLM rerank of the selected chunks; failure degrades to fused order.
//! 7. Score blend, `min_score` filter, exact + near-duplicate dedup.
//!
//! No single sub-search failure fails a query: every stage degrades. The
//! query fails only when no ranked list could be produced at all.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

use crate::chunker::{chunk_document, chunk_document_by_tokens, docid};
use crate::context::resolve_context;
use crate::engine::Engine;
use crate::error::{QmdError, Result};
use crate::fusion::{
    extract_terms, jaccard_bigrams, rrf_fuse, score_chunk, FusedDoc, RankedList, RRF_K,
};
use crate::llm::{
    fallback_expansion, parse_expansion, QueryKind, Queryable, RerankDoc,
    EXPANSION_CACHE_TTL_SECS,
};

/// Strong-signal shortcut: skip expansion when the BM25 probe's top score
/// is at least this...
pub const SHORTCUT_TOP: f64 = 0.85;
/// ...and leads the runner-up by at least this.
pub const SHORTCUT_GAP: f64 = 0.15;

/// Per-sub-search result cap (larger under `--all`).
const FANOUT_LIMIT: usize = 20;
const FANOUT_LIMIT_ALL: usize = 100;

/// Effective limit when `--all` is requested.
const ALL_SENTINEL: usize = 10_000;

/// Near-duplicate merge threshold (character-bigram Jaccard).
const NEAR_DUP_JACCARD: f64 = 0.90;

/// One result as emitted to formatters; field names follow the JSON
/// contract.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docid: Option<String>,
    pub score: f64,
    /// Virtual path: `qmd://collection/path`.
    pub file: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(rename = "alsoIn", skip_serializing_if = "Vec::is_empty")]
    pub also_in: Vec<String>,
    pub body: String,
    pub snippet: String,
}

/// Caller options shared by all three query paths.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    pub min_score: f64,
    pub all: bool,
    pub collections: Vec<String>,
    /// Extra caller-supplied context passed to query expansion.
    pub context: Option<String>,
    pub profile: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            min_score: 0.0,
            all: false,
            collections: Vec::new(),
            context: None,
            profile: false,
        }
    }
}

impl SearchOptions {
    fn effective_limit(&self) -> usize {
        if self.all {
            ALL_SENTINEL
        } else {
            self.limit
        }
    }

    fn fanout_limit(&self) -> usize {
        if self.all {
            FANOUT_LIMIT_ALL
        } else {
            FANOUT_LIMIT
        }
    }
}

/// Decide whether the BM25 probe alone is a strong enough signal to skip
/// query expansion.
pub fn strong_signal(scores: &[f64]) -> bool {
    match scores {
        [] => false,
        [top] => *top >= SHORTCUT_TOP && *top >= SHORTCUT_GAP,
        [top, second, ..] => *top >= SHORTCUT_TOP && (top - second) >= SHORTCUT_GAP,
    }
}

// ============ search (BM25 only) ============

pub async fn search_bm25(
    engine: &Engine,
    query: &str,
    opts: &SearchOptions,
) -> Result<Vec<SearchHit>> {
    let filter = engine.config.resolve_collection_filter(&opts.collections);
    let results = engine
        .store
        .search_fts(query, opts.effective_limit(), filter.as_deref())
        .await?;

    let hits = results
        .into_iter()
        .filter(|r| r.score >= opts.min_score)
        .map(|r| {
            let context = resolve_context(&engine.config.contexts, &r.collection, &r.path);
            SearchHit {
                docid: Some(docid(&r.hash).to_string()),
                score: r.score,
                file: format!("qmd://{}/{}", r.collection, r.path),
                title: r.title,
                context,
                also_in: Vec::new(),
                body: r.snippet.clone(),
                snippet: r.snippet,
            }
        })
        .collect();
    Ok(hits)
}

// ============ vsearch (vectors only) ============

pub async fn search_vector(
    engine: &Engine,
    query: &str,
    opts: &SearchOptions,
) -> Result<Vec<SearchHit>> {
    let filter = engine.config.resolve_collection_filter(&opts.collections);
    let Some((_, model)) = engine.store.vec_table_info().await? else {
        return Err(QmdError::VectorUnavailable);
    };
    let embedding = engine.gateway.embed_query(query).await?;
    let results = engine
        .store
        .search_vec(&embedding, &model, opts.effective_limit(), filter.as_deref())
        .await?;

    let mut hits = Vec::new();
    for r in results {
        if r.score < opts.min_score {
            continue;
        }
        let body = chunk_text_for(engine, &r.hash, r.seq, r.pos).await?;
        let context = resolve_context(&engine.config.contexts, &r.collection, &r.path);
        hits.push(SearchHit {
            docid: Some(docid(&r.hash).to_string()),
            score: r.score,
            file: format!("qmd://{}/{}", r.collection, r.path),
            title: r.title,
            context,
            also_in: Vec::new(),
            body: body.clone(),
            snippet: truncate_snippet(&body),
        });
    }
    Ok(hits)
}

/// Text of embedding chunk `seq` of a content blob, falling back to a
/// slice at `pos` when chunk boundaries moved.
async fn chunk_text_for(engine: &Engine, hash: &str, seq: i64, pos: i64) -> Result<String> {
    let Some(body) = engine.store.get_content(hash).await? else {
        return Ok(String::new());
    };
    let chunks = chunk_document_by_tokens(&body);
    if let Some(chunk) = chunks.get(seq as usize) {
        return Ok(chunk.text.clone());
    }
    let start = (pos as usize).min(body.len());
    let mut end = (start + 800).min(body.len());
    while end < body.len() && !body.is_char_boundary(end) {
        end += 1;
    }
    while !body.is_char_boundary(start) && end > start {
        end -= 1;
    }
    Ok(body[start..end].to_string())
}

// ============ query (full pipeline) ============

/// Per-document info accumulated across sub-searches, keyed by
/// `collection/path`.
#[derive(Debug, Clone)]
struct DocInfo {
    collection: String,
    path: String,
    title: String,
    hash: String,
    fts_snippet: Option<String>,
}

pub async fn query_pipeline(
    engine: &Engine,
    query: &str,
    opts: &SearchOptions,
) -> Result<Vec<SearchHit>> {
    let filter = engine.config.resolve_collection_filter(&opts.collections);
    let filter_ref = filter.as_deref();
    let now = chrono::Utc::now().timestamp();
    let started = Instant::now();

    // 1. Unconditional BM25 probe.
    let probe = engine.store.search_fts(query, FANOUT_LIMIT, filter_ref).await?;
    let probe_scores: Vec<f64> = probe.iter().map(|r| r.score).collect();
    profile(opts, started, "bm25 probe");

    // 2. Expansion, unless the probe is a strong, well-separated signal.
    let queryables: Vec<Queryable> = if strong_signal(&probe_scores) {
        tracing::debug!("strong BM25 signal, skipping query expansion");
        Vec::new()
    } else {
        expand_cached(engine, query, opts.context.as_deref(), now).await
    };
    profile(opts, started, "expansion");

    // 3. Fan-out. The original BM25 list and the original vector list come
    // first; they carry the heavier RRF weight.
    let vec_texts: Vec<String> = std::iter::once(query.to_string())
        .chain(
            queryables
                .iter()
                .filter(|q| matches!(q.kind, QueryKind::Vec | QueryKind::Hyde))
                .map(|q| q.text.clone()),
        )
        .collect();
    let lex_texts: Vec<String> = queryables
        .iter()
        .filter(|q| q.kind == QueryKind::Lex)
        .map(|q| q.text.clone())
        .collect();

    let embeddings = embed_for_fanout(engine, &vec_texts).await;
    let vec_model = engine
        .store
        .vec_table_info()
        .await
        .ok()
        .flatten()
        .map(|(_, m)| m);

    let fanout_limit = opts.fanout_limit();
    let mut lists: Vec<RankedList> = Vec::new();
    let mut info: HashMap<String, DocInfo> = HashMap::new();

    // Original BM25 first (weight 2.0) — reuse the probe unless --all needs
    // a deeper list.
    let bm25_original = if opts.all {
        engine.store.search_fts(query, fanout_limit, filter_ref).await?
    } else {
        probe
    };
    lists.push(fts_list(2.0, &bm25_original, &mut info));

    // Original vector search second (weight 2.0), when available.
    if let (Some(model), Some(Some(first))) = (&vec_model, embeddings.as_ref().map(|e| e.first()))
    {
        if let Some(embedding) = first {
            match engine
                .store
                .search_vec(embedding, model, fanout_limit, filter_ref)
                .await
            {
                Ok(results) => lists.push(vec_list(2.0, &results, &mut info)),
                Err(err) if err.is_degradable() => {
                    tracing::debug!(error = %err, "vector search degraded");
                }
                Err(err) => return Err(err),
            }
        }
    }

    // Expanded lexical queryables.
    let lex_futures = lex_texts.iter().map(|text| {
        let store = &engine.store;
        async move { store.search_fts(text, fanout_limit, filter_ref).await }
    });
    for result in futures::future::join_all(lex_futures).await {
        match result {
            Ok(results) => lists.push(fts_list(1.0, &results, &mut info)),
            Err(err) => tracing::debug!(error = %err, "lexical sub-search failed"),
        }
    }

    // Expanded semantic queryables (embeddings[1..] pair with vec_texts[1..]).
    if let (Some(model), Some(embeddings)) = (&vec_model, embeddings.as_ref()) {
        let vec_futures = embeddings.iter().skip(1).flatten().map(|embedding| {
            let store = &engine.store;
            async move { store.search_vec(embedding, model, fanout_limit, filter_ref).await }
        });
        for result in futures::future::join_all(vec_futures).await {
            match result {
                Ok(results) => lists.push(vec_list(1.0, &results, &mut info)),
                Err(err) => tracing::debug!(error = %err, "vector sub-search failed"),
            }
        }
    }
    profile(opts, started, "fan-out");

    if lists.iter().all(|l| l.keys.is_empty()) {
        return Ok(Vec::new());
    }

    // 4. Fusion, 5. candidate cap.
    let mut fused = rrf_fuse(&lists, RRF_K);
    fused.truncate(engine.config.rerank_doc_limit);
    profile(opts, started, "fusion");

    // 6. Chunk selection, 7. rerank, 8. blend.
    let hits = rerank_and_blend(engine, query, &fused, &info).await?;
    profile(opts, started, "rerank");

    // 9. Filter and dedup, 10. limit.
    let mut hits = dedup_hits(hits, opts.min_score);
    hits.truncate(opts.effective_limit());
    profile(opts, started, "dedup");
    Ok(hits)
}

/// Cached query expansion with deterministic fallback. Never fails.
async fn expand_cached(
    engine: &Engine,
    query: &str,
    context: Option<&str>,
    now: i64,
) -> Vec<Queryable> {
    let key = engine.gateway.expand_cache_key(query, context);

    if let Some(key) = &key {
        if let Ok(Some(raw)) = engine
            .store
            .cache_get(key, EXPANSION_CACHE_TTL_SECS, now)
            .await
        {
            let parsed = parse_expansion(&raw);
            if !parsed.is_empty() {
                return parsed;
            }
        }
    }

    match engine.gateway.expand_query_raw(query, context).await {
        Ok(raw) => {
            if let Some(key) = &key {
                if let Err(err) = engine.store.cache_put(key, &raw, now).await {
                    tracing::debug!(error = %err, "expansion cache write failed");
                }
            }
            let parsed = parse_expansion(&raw);
            if parsed.is_empty() {
                fallback_expansion(query, true)
            } else {
                parsed
            }
        }
        Err(err) => {
            tracing::debug!(error = %err, "expansion degraded to fallback");
            fallback_expansion(query, true)
        }
    }
}

/// Embed the original query plus every semantic queryable in one batch.
/// `None` disables the vector side of the fan-out entirely.
async fn embed_for_fanout(engine: &Engine, texts: &[String]) -> Option<Vec<Option<Vec<f32>>>> {
    engine.gateway.embed_provider()?;
    match engine.gateway.embed_batch(texts).await {
        Ok(embeddings) => Some(embeddings),
        Err(err) => {
            tracing::debug!(error = %err, "fan-out embedding degraded, lexical only");
            None
        }
    }
}

fn doc_key(collection: &str, path: &str) -> String {
    format!("{collection}/{path}")
}

fn fts_list(
    weight: f64,
    results: &[crate::store::FtsResult],
    info: &mut HashMap<String, DocInfo>,
) -> RankedList {
    let mut keys = Vec::with_capacity(results.len());
    for r in results {
        let key = doc_key(&r.collection, &r.path);
        info.entry(key.clone()).or_insert_with(|| DocInfo {
            collection: r.collection.clone(),
            path: r.path.clone(),
            title: r.title.clone(),
            hash: r.hash.clone(),
            fts_snippet: Some(r.snippet.clone()),
        });
        keys.push(key);
    }
    RankedList { weight, keys }
}

fn vec_list(
    weight: f64,
    results: &[crate::store::VecResult],
    info: &mut HashMap<String, DocInfo>,
) -> RankedList {
    // Vector hits are chunk-level; fusion operates on documents, so keep
    // each document's best-ranked appearance.
    let mut keys: Vec<String> = Vec::new();
    for r in results {
        let key = doc_key(&r.collection, &r.path);
        if keys.contains(&key) {
            continue;
        }
        info.entry(key.clone()).or_insert_with(|| DocInfo {
            collection: r.collection.clone(),
            path: r.path.clone(),
            title: r.title.clone(),
            hash: r.hash.clone(),
            fts_snippet: None,
        });
        keys.push(key);
    }
    RankedList { weight, keys }
}

/// Chunk selection, rerank, and score blend for the fused candidates.
async fn rerank_and_blend(
    engine: &Engine,
    query: &str,
    fused: &[FusedDoc],
    info: &HashMap<String, DocInfo>,
) -> Result<Vec<SearchHit>> {
    let terms = extract_terms(query);
    // 1-based fused rank per document.
    let rrf_rank: HashMap<&str, usize> = fused
        .iter()
        .enumerate()
        .map(|(i, d)| (d.key.as_str(), i + 1))
        .collect();

    // Select top chunks per candidate. `best_chunk` remembers each file's
    // top-scored chunk for the degraded paths.
    let mut rerank_docs: Vec<RerankDoc> = Vec::new();
    let mut chunk_bodies: HashMap<String, String> = HashMap::new();
    let mut best_chunk: HashMap<String, String> = HashMap::new();
    for doc in fused {
        let Some(doc_info) = info.get(&doc.key) else {
            continue;
        };
        let Some(body) = engine.store.get_content(&doc_info.hash).await? else {
            continue;
        };
        let file = format!("qmd://{}/{}", doc_info.collection, doc_info.path);

        let chunks = chunk_document(&body);
        let mut scored: Vec<(usize, f64, &str)> = chunks
            .iter()
            .enumerate()
            .map(|(idx, c)| (idx, score_chunk(&c.text, &terms), c.text.as_str()))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(engine.config.rerank_chunks_per_doc);

        if let Some((_, _, text)) = scored.first() {
            best_chunk.insert(file.clone(), text.to_string());
        }
        for (idx, _, text) in scored {
            let key = format!("{file}::{idx}");
            chunk_bodies.insert(key.clone(), text.to_string());
            rerank_docs.push(RerankDoc {
                key,
                text: text.to_string(),
            });
        }
    }

    let rerank_result = if rerank_docs.is_empty() {
        Ok(Vec::new())
    } else {
        engine.gateway.rerank(query, &rerank_docs).await
    };
    let rerank_err = rerank_result.as_ref().err().map(|e| e.to_string());

    let mut hits: Vec<SearchHit> = Vec::new();
    match rerank_result {
        Ok(scores) if scores.iter().any(|s| s.extract.is_some()) => {
            // LLM-as-reranker extract mode: trust the model's ordering and
            // return the extracted text as the snippet body.
            let mut seen_files: Vec<String> = Vec::new();
            for score in scores {
                let Some((file, _)) = score.key.rsplit_once("::") else {
                    continue;
                };
                if seen_files.iter().any(|f| f == file) {
                    continue;
                }
                seen_files.push(file.to_string());
                let Some(hit) =
                    hit_for_file(engine, file, info, score.score, score.extract.as_deref(), &chunk_bodies, &score.key)
                else {
                    continue;
                };
                hits.push(hit);
            }
        }
        Ok(scores) if !scores.is_empty() => {
            // Dedicated reranker: aggregate per document by best chunk
            // score, then blend with the document's fused rank.
            let mut best: HashMap<String, f64> = HashMap::new();
            for score in &scores {
                if let Some((file, _)) = score.key.rsplit_once("::") {
                    let entry = best.entry(file.to_string()).or_insert(f64::MIN);
                    *entry = entry.max(score.score);
                }
            }
            for doc in fused {
                let Some(doc_info) = info.get(&doc.key) else {
                    continue;
                };
                let file = format!("qmd://{}/{}", doc_info.collection, doc_info.path);
                let rank = rrf_rank[doc.key.as_str()];
                let rerank_score = best.get(&file).copied().unwrap_or(0.0);
                let final_score = blend_score(rank, rerank_score);
                let body = best_chunk_body(&file, &best_chunk, doc_info);
                hits.push(make_hit(engine, doc_info, final_score, body));
            }
            hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        }
        Ok(_) | Err(_) => {
            if let Some(err) = &rerank_err {
                tracing::debug!(error = %err, "rerank degraded to fused scores");
            }
            // Pure RRF ordering: the rerank term contributes nothing.
            for doc in fused {
                let Some(doc_info) = info.get(&doc.key) else {
                    continue;
                };
                let file = format!("qmd://{}/{}", doc_info.collection, doc_info.path);
                let rank = rrf_rank[doc.key.as_str()];
                let final_score = blend_score(rank, 0.0);
                let body = best_chunk_body(&file, &best_chunk, doc_info);
                hits.push(make_hit(engine, doc_info, final_score, body));
            }
        }
    }

    Ok(hits)
}

/// Blend a document's 1-based fused rank with its best rerank score.
pub fn blend_score(rrf_rank: usize, rerank_score: f64) -> f64 {
    let rrf_weight = if rrf_rank <= 3 {
        0.75
    } else if rrf_rank <= 10 {
        0.60
    } else {
        0.40
    };
    rrf_weight * (1.0 / rrf_rank as f64) + (1.0 - rrf_weight) * rerank_score
}

fn best_chunk_body(
    file: &str,
    best_chunk: &HashMap<String, String>,
    doc_info: &DocInfo,
) -> String {
    // Top-scored selected chunk for this file, else the FTS snippet.
    best_chunk
        .get(file)
        .cloned()
        .or_else(|| doc_info.fts_snippet.clone())
        .unwrap_or_default()
}

fn make_hit(engine: &Engine, doc_info: &DocInfo, score: f64, body: String) -> SearchHit {
    let context = resolve_context(&engine.config.contexts, &doc_info.collection, &doc_info.path);
    SearchHit {
        docid: Some(docid(&doc_info.hash).to_string()),
        score,
        file: format!("qmd://{}/{}", doc_info.collection, doc_info.path),
        title: doc_info.title.clone(),
        context,
        also_in: Vec::new(),
        body: body.clone(),
        snippet: truncate_snippet(&body),
    }
}

fn hit_for_file(
    engine: &Engine,
    file: &str,
    info: &HashMap<String, DocInfo>,
    score: f64,
    extract: Option<&str>,
    chunk_bodies: &HashMap<String, String>,
    chunk_key: &str,
) -> Option<SearchHit> {
    let key = file.strip_prefix("qmd://")?;
    let doc_info = info.get(key)?;
    let body = match extract {
        Some(text) => text.to_string(),
        None => chunk_bodies.get(chunk_key).cloned().unwrap_or_default(),
    };
    Some(make_hit(engine, doc_info, score, body))
}

/// Drop sub-threshold hits, dedup by exact docid, then merge
/// near-identical bodies, recording merged paths under `alsoIn`.
fn dedup_hits(hits: Vec<SearchHit>, min_score: f64) -> Vec<SearchHit> {
    let mut sorted = hits;
    sorted.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut out: Vec<SearchHit> = Vec::new();
    for hit in sorted {
        if hit.score < min_score {
            continue;
        }
        // Exact content identity: same docid means same bytes.
        if let Some(existing) = out
            .iter_mut()
            .find(|h| h.docid.is_some() && h.docid == hit.docid)
        {
            if existing.file != hit.file {
                existing.also_in.push(hit.file.clone());
            }
            continue;
        }
        // Near-identity by character-bigram Jaccard over the bodies.
        if let Some(existing) = out.iter_mut().find(|h| {
            !h.body.is_empty()
                && !hit.body.is_empty()
                && jaccard_bigrams(&h.body, &hit.body) >= NEAR_DUP_JACCARD
        }) {
            if existing.file != hit.file {
                existing.also_in.push(hit.file.clone());
            }
            continue;
        }
        out.push(hit);
    }
    out
}

fn truncate_snippet(body: &str) -> String {
    const MAX: usize = 240;
    if body.chars().count() <= MAX {
        return body.to_string();
    }
    let truncated: String = body.chars().take(MAX).collect();
    format!("{truncated}…")
}

fn profile(opts: &SearchOptions, started: Instant, stage: &str) {
    if opts.profile {
        eprintln!("profile: {stage} at {:?}", started.elapsed());
    }
}
