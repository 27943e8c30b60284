//! Status, doctor, and cleanup command bodies.

use anyhow::Result;
use std::time::Instant;

use crate::engine::Engine;
use crate::progress::format_bytes;

/// `status`: per-collection counts plus index health.
pub async fn run_status(engine: &Engine) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let health = engine.store.get_index_health(now).await?;
    let counts = engine.store.collection_counts().await?;
    let vectors = engine.store.count_vectors().await?;
    let db_path = engine.config.index_db_path();
    let db_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    println!("qmd index '{}'", engine.config.index_name);
    println!("  database:        {} ({})", db_path.display(), format_bytes(db_size));
    println!("  documents:       {}", health.total_docs);
    println!("  vectors:         {}", vectors);
    println!("  needs embedding: {}", health.needs_embedding);
    println!("  days stale:      {}", health.days_stale);

    if !counts.is_empty() {
        println!();
        println!("  {:<24} {:>8}", "COLLECTION", "DOCS");
        for (name, n) in &counts {
            let configured = engine.config.find_collection(name).is_some();
            let marker = if configured { "" } else { "  (not in index.yml)" };
            println!("  {:<24} {:>8}{}", name, n, marker);
        }
    }
    Ok(())
}

/// `doctor`: configuration, provider routing, and index health at a glance.
pub async fn run_doctor(engine: &Engine, bench: bool) -> Result<()> {
    println!("qmd doctor");
    println!("  config dir: {}", engine.config.config_dir.display());
    println!("  data dir:   {}", engine.config.data_dir.display());
    println!("  index:      {}", engine.config.index_db_path().display());

    println!();
    println!("  providers:");
    for (op, provider) in engine.gateway.describe_routes() {
        match provider {
            Some(name) => println!("    {:<16} {}", op, name),
            None => println!("    {:<16} (none configured)", op),
        }
    }

    let now = chrono::Utc::now().timestamp();
    let health = engine.store.get_index_health(now).await?;
    println!();
    println!("  documents:       {}", health.total_docs);
    println!("  needs embedding: {}", health.needs_embedding);
    match engine.store.vec_table_info().await? {
        Some((dim, model)) => println!("  vector table:    {dim} dims ({model})"),
        None => println!("  vector table:    not built (run `qmd embed`)"),
    }

    if bench {
        let started = Instant::now();
        let results = engine.store.search_fts("bench probe query", 20, None).await?;
        println!();
        println!(
            "  bm25 probe:      {} results in {:?}",
            results.len(),
            started.elapsed()
        );
    }
    Ok(())
}

/// Totals removed by `cleanup`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CleanupReport {
    pub cache_entries: u64,
    pub inactive_documents: u64,
    pub orphaned_content: u64,
    pub orphaned_vectors: u64,
}

/// `cleanup`: drop the LLM cache, prune history, and compact the database.
pub async fn run_cleanup(engine: &Engine) -> Result<CleanupReport> {
    let report = CleanupReport {
        cache_entries: engine.store.clear_llm_cache().await?,
        inactive_documents: engine.store.delete_inactive_documents().await?,
        orphaned_content: engine.store.cleanup_orphaned_content().await?,
        orphaned_vectors: engine.store.cleanup_orphaned_vectors().await?,
    };
    engine.store.vacuum().await?;
    Ok(report)
}
