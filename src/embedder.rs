//! Embedding engine: keep the vector index in sync with active content.
//!
//! Selects the content hashes lacking vectors for the current model, chunks
//! them by tokens, and writes one vector per `(hash, seq)`. The provider is
//! probed once for its embedding dimension before any batch is sent, so a
//! model change is caught up front as a `DimensionMismatch` instead of a
//! half-written table.

use crate::chunker::chunk_document_by_tokens;
use crate::config::Config;
use crate::error::{QmdError, Result};
use crate::llm::Gateway;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::store::Store;

#[derive(Debug, Default, Clone)]
pub struct EmbedReport {
    pub hashes: u64,
    pub chunks: u64,
    pub embedded: u64,
    pub failed: u64,
    pub bytes: u64,
}

/// Build or update the vector index. With `force`, all existing vectors
/// (and the dimension record) are dropped first.
pub async fn run_embed(
    store: &Store,
    gateway: &Gateway,
    config: &Config,
    force: bool,
    reporter: &dyn ProgressReporter,
) -> Result<EmbedReport> {
    let provider = gateway.embed_provider().ok_or_else(|| {
        QmdError::Config(
            "no embedding provider configured (set SILICONFLOW_API_KEY or OPENAI_API_KEY)".into(),
        )
    })?;
    let model = provider.embed_model.clone();

    if force {
        store.clear_all_embeddings().await?;
    }

    let hashes = store.get_hashes_needing_embedding(&model).await?;
    let mut report = EmbedReport {
        hashes: hashes.len() as u64,
        ..Default::default()
    };
    if hashes.is_empty() {
        return Ok(report);
    }

    // One probe pins the dimension before anything is written.
    let probe = gateway.embed_query("dimension probe").await?;
    store.ensure_vec_table(probe.len(), &model).await?;

    // Progress is bytes-based: chunk counts vary wildly per document and
    // make for a jumpy ETA.
    let mut bodies: Vec<(String, String)> = Vec::new();
    let mut total_bytes = 0u64;
    for hash in &hashes {
        if let Some(body) = store.get_content(hash).await? {
            total_bytes += body.len() as u64;
            bodies.push((hash.clone(), body));
        }
    }

    let now = chrono::Utc::now().timestamp();
    let mut done_bytes = 0u64;

    for (hash, body) in &bodies {
        let chunks: Vec<_> = chunk_document_by_tokens(body)
            .into_iter()
            .filter(|c| !c.text.trim().is_empty())
            .collect();
        report.chunks += chunks.len() as u64;

        let mut seq_base = 0usize;
        for batch in chunks.chunks(config.embed_batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = match gateway.embed_batch(&texts).await {
                Ok(vectors) => vectors,
                Err(batch_err) => {
                    // Batch failed wholesale; retry per item so one bad
                    // chunk cannot sink its neighbors.
                    tracing::warn!(error = %batch_err, "embedding batch failed, retrying per item");
                    let mut singles: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
                    let mut any_ok = false;
                    for text in &texts {
                        match gateway.embed_batch(std::slice::from_ref(text)).await {
                            Ok(mut one) => {
                                let v = one.pop().flatten();
                                any_ok |= v.is_some();
                                singles.push(v);
                            }
                            Err(_) => singles.push(None),
                        }
                    }
                    if !any_ok {
                        return Err(batch_err);
                    }
                    singles
                }
            };

            for (offset, (chunk, vector)) in batch.iter().zip(vectors).enumerate() {
                match vector {
                    Some(v) => {
                        store
                            .insert_embedding(
                                hash,
                                (seq_base + offset) as i64,
                                chunk.pos as i64,
                                &v,
                                &model,
                                now,
                            )
                            .await?;
                        report.embedded += 1;
                    }
                    None => report.failed += 1,
                }
            }
            seq_base += batch.len();
        }

        done_bytes += body.len() as u64;
        report.bytes = done_bytes;
        reporter.report(ProgressEvent::Embedding {
            done_bytes,
            total_bytes,
        });
    }

    reporter.finish();
    Ok(report)
}
