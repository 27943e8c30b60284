//! qmd command-line interface.
//!
//! Thin dispatch over the engine: argument parsing and output rendering
//! live here, everything else in the library. Stdout carries structured
//! payloads; logs and progress go to stderr. Exit code 0 on success, 1 on
//! usage or unrecoverable errors.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use qmd::config::{CollectionConfig, Config};
use qmd::engine::Engine;
use qmd::error::QmdError;
use qmd::format::{render_results, OutputFormat};
use qmd::get::{get_body, multi_get, parse_fileref, resolve_fileref, split_line_suffix, GetOptions};
use qmd::ingest::{run_update_command, sync_collection, IngestOptions, IngestReport};
use qmd::progress::{default_reporter, NoProgress, ProgressReporter};
use qmd::search::{query_pipeline, search_bm25, search_vector, SearchOptions};

#[derive(Parser)]
#[command(
    name = "qmd",
    about = "Hybrid search over local Markdown — an index and memory backend for AI agents",
    version
)]
struct Cli {
    /// Named index file to operate on
    #[arg(long, global = true)]
    index: Option<String>,

    /// JSON output
    #[arg(long, global = true)]
    json: bool,
    /// CSV output
    #[arg(long, global = true)]
    csv: bool,
    /// Markdown output
    #[arg(long, global = true)]
    md: bool,
    /// XML output
    #[arg(long, global = true)]
    xml: bool,
    /// File list output
    #[arg(long, global = true)]
    files: bool,

    /// Maximum number of results
    #[arg(short = 'n', global = true)]
    limit: Option<usize>,

    /// Return all results (no limit)
    #[arg(long, global = true)]
    all: bool,

    /// Minimum score threshold
    #[arg(long, global = true)]
    min_score: Option<f64>,

    /// Print full bodies instead of snippets
    #[arg(long, global = true)]
    full: bool,

    /// Restrict to collections (repeatable)
    #[arg(short = 'c', long = "collection", global = true)]
    collections: Vec<String>,

    /// Extra context passed to query expansion
    #[arg(long, global = true)]
    context: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage collections
    Collection {
        #[command(subcommand)]
        action: CollectionAction,
    },

    /// Manage context annotations
    Context {
        #[command(subcommand)]
        action: ContextAction,
    },

    /// List collections or files by virtual path
    Ls {
        /// `collection` or `collection/prefix`
        target: Option<String>,
    },

    /// Print a document (fileref, qmd:// path, collection/path, or #docid)
    Get {
        fileref: String,
        /// First line to print (1-based)
        #[arg(long)]
        from: Option<usize>,
        /// Number of lines to print
        #[arg(short = 'l')]
        lines: Option<usize>,
        /// Prefix lines with their numbers
        #[arg(long)]
        line_numbers: bool,
    },

    /// Print multiple documents by glob or comma-separated list
    #[command(name = "multi-get")]
    MultiGet {
        pattern: String,
        /// Lines per document
        #[arg(short = 'l')]
        lines: Option<usize>,
        /// Cumulative byte budget
        #[arg(long, default_value_t = 1024 * 1024)]
        max_bytes: u64,
    },

    /// Re-index all collections
    Update {
        /// Allow running per-collection update commands from index.yml
        #[arg(long)]
        allow_run: bool,
    },

    /// Build or rebuild chunk embeddings
    Embed {
        /// Drop existing vectors first
        #[arg(short = 'f')]
        force: bool,
        /// Per-operation timeout in milliseconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Drop the LLM cache, prune history, and compact the database
    Cleanup,

    /// Full-text (BM25) search
    Search { query: String },

    /// Vector-only search
    Vsearch { query: String },

    /// Full retrieval pipeline: expansion, fusion, rerank
    Query {
        query: String,
        /// Print per-stage timings to stderr
        #[arg(long)]
        profile: bool,
        /// Verbose logging
        #[arg(long)]
        verbose: bool,
        /// Per-operation timeout in milliseconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Index health and per-collection counts
    Status,

    /// Configuration and provider diagnostics
    Doctor {
        /// Time a BM25 probe query
        #[arg(long)]
        bench: bool,
    },

    /// Start the MCP-compatible HTTP tool server
    Mcp,
}

#[derive(Subcommand)]
enum CollectionAction {
    /// Add a directory as a collection and index it
    Add {
        path: PathBuf,
        /// Collection name (default: directory basename)
        #[arg(long)]
        name: Option<String>,
        /// Glob mask (default: **/*.md)
        #[arg(long)]
        mask: Option<String>,
    },
    /// List configured collections
    List,
    /// Remove a collection and deactivate its documents
    Remove { name: String },
    /// Rename a collection
    Rename { old: String, new: String },
}

#[derive(Subcommand)]
enum ContextAction {
    /// Attach a context annotation to a virtual path (`/` means global)
    Add {
        /// Virtual path, omitted for global
        path_or_text: String,
        /// Annotation text (when the first argument is a path)
        text: Option<String>,
    },
    /// List context annotations
    List,
    /// Validate annotations against configured collections
    Check,
    /// Remove an annotation
    Rm { path: String },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(matches!(
        &cli.command,
        Commands::Query { verbose: true, .. }
    ));

    // --timeout mirrors QMD_TIMEOUT_MS; set it before config load so the
    // gateway picks it up.
    if let Commands::Embed { timeout: Some(t), .. } | Commands::Query { timeout: Some(t), .. } =
        &cli.command
    {
        std::env::set_var("QMD_TIMEOUT_MS", t.to_string());
    }

    let format = output_format(&cli);
    let mut config = Config::load(cli.index.clone())?;

    match &cli.command {
        Commands::Collection { action } => {
            collection_command(&mut config, action, format).await?;
        }
        Commands::Context { action } => {
            context_command(&mut config, action).await?;
        }
        Commands::Ls { target } => {
            let engine = Engine::open(config).await?;
            run_ls(&engine, target.as_deref()).await?;
            engine.close().await;
        }
        Commands::Get {
            fileref,
            from,
            lines,
            line_numbers,
        } => {
            let engine = Engine::open(config).await?;
            let (raw, line) = split_line_suffix(fileref);
            let parsed = parse_fileref(raw)?;
            let doc = resolve_fileref(&engine, &parsed).await?;
            let opts = GetOptions {
                from: (*from).or(line),
                lines: *lines,
                line_numbers: *line_numbers,
            };
            println!("{}", get_body(&engine, &doc, &opts).await?);
            engine.close().await;
        }
        Commands::MultiGet {
            pattern,
            lines,
            max_bytes,
        } => {
            let engine = Engine::open(config).await?;
            let hits = multi_get(&engine, pattern, *lines, *max_bytes).await?;
            println!("{}", render_results(&hits, format, true));
            engine.close().await;
        }
        Commands::Update { allow_run } => {
            let engine = Engine::open(config).await?;
            run_update(&engine, *allow_run, &cli.collections).await?;
            engine.close().await;
        }
        Commands::Embed { force, .. } => {
            let engine = Engine::open(config).await?;
            let reporter = default_reporter();
            let report = qmd::embedder::run_embed(
                &engine.store,
                &engine.gateway,
                &engine.config,
                *force,
                reporter.as_ref(),
            )
            .await?;
            eprintln!(
                "embed: {} documents, {} chunks, {} embedded, {} failed",
                report.hashes, report.chunks, report.embedded, report.failed
            );
            engine.close().await;
        }
        Commands::Cleanup => {
            let engine = Engine::open(config).await?;
            let report = qmd::status::run_cleanup(&engine).await?;
            eprintln!(
                "cleanup: {} cache entries, {} inactive documents, {} orphaned blobs, {} orphaned vectors",
                report.cache_entries,
                report.inactive_documents,
                report.orphaned_content,
                report.orphaned_vectors
            );
            engine.close().await;
        }
        Commands::Search { query } => {
            let engine = Engine::open(config).await?;
            let opts = search_options(&cli, 0.0);
            let hits = search_bm25(&engine, query, &opts).await?;
            println!("{}", render_results(&hits, format, cli.full));
            engine.close().await;
        }
        Commands::Vsearch { query } => {
            let engine = Engine::open(config).await?;
            let opts = search_options(&cli, 0.3);
            match search_vector(&engine, query, &opts).await {
                Ok(hits) => println!("{}", render_results(&hits, format, cli.full)),
                Err(QmdError::VectorUnavailable) => {
                    eprintln!("{}", QmdError::VectorUnavailable);
                    println!("{}", render_results(&[], format, cli.full));
                }
                Err(err) => return Err(err.into()),
            }
            engine.close().await;
        }
        Commands::Query { query, profile, .. } => {
            let engine = Engine::open(config).await?;
            let mut opts = search_options(&cli, 0.0);
            opts.profile = *profile;
            let hits = query_pipeline(&engine, query, &opts).await?;
            println!("{}", render_results(&hits, format, cli.full));
            engine.close().await;
        }
        Commands::Status => {
            let engine = Engine::open(config).await?;
            qmd::status::run_status(&engine).await?;
            engine.close().await;
        }
        Commands::Doctor { bench } => {
            let engine = Engine::open(config).await?;
            qmd::status::run_doctor(&engine, *bench).await?;
            engine.close().await;
        }
        Commands::Mcp => {
            let engine = Arc::new(Engine::open(config).await?);
            qmd::server::run_server(engine).await?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "qmd=debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("QMD_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn output_format(cli: &Cli) -> OutputFormat {
    if cli.json {
        OutputFormat::Json
    } else if cli.csv {
        OutputFormat::Csv
    } else if cli.md {
        OutputFormat::Md
    } else if cli.xml {
        OutputFormat::Xml
    } else if cli.files {
        OutputFormat::Files
    } else {
        OutputFormat::Text
    }
}

fn search_options(cli: &Cli, default_min_score: f64) -> SearchOptions {
    SearchOptions {
        limit: cli.limit.unwrap_or(10),
        min_score: cli.min_score.unwrap_or(default_min_score),
        all: cli.all,
        collections: cli.collections.clone(),
        context: cli.context.clone(),
        profile: false,
    }
}

fn ingest_reporter(format: OutputFormat) -> Box<dyn ProgressReporter> {
    if format.is_machine() {
        Box::new(NoProgress)
    } else {
        default_reporter()
    }
}

fn print_ingest_report(name: &str, report: &IngestReport) {
    eprintln!(
        "index {name}: {} added, {} updated, {} unchanged, {} deactivated",
        report.added,
        report.updated + report.title_updated,
        report.unchanged,
        report.deactivated
    );
    let skips = &report.skips;
    if skips.total() > 0 {
        eprintln!(
            "  skipped: {} symlink escapes, {} too large, {} binary, {} unreadable",
            skips.symlink_escape, skips.too_large, skips.binary, skips.unreadable
        );
    }
}

async fn collection_command(
    config: &mut Config,
    action: &CollectionAction,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match action {
        CollectionAction::Add { path, name, mask } => {
            let absolute = std::fs::canonicalize(path)
                .map_err(|e| anyhow::anyhow!("{} is not accessible: {e}", path.display()))?;
            let name = name.clone().unwrap_or_else(|| {
                absolute
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "root".to_string())
            });
            if config.find_collection(&name).is_some() {
                anyhow::bail!("collection '{name}' already exists");
            }
            let coll = CollectionConfig {
                name: name.clone(),
                path: absolute,
                mask: mask.clone().unwrap_or_else(|| "**/*.md".to_string()),
                update_command: None,
            };
            config.collections.push(coll.clone());
            config.save_index_file()?;

            let engine = Engine::open(config.clone()).await?;
            let reporter = ingest_reporter(format);
            let opts = IngestOptions {
                max_file_bytes: engine.config.max_index_file_bytes,
                now: chrono::Utc::now().timestamp(),
                reporter: reporter.as_ref(),
            };
            let report = sync_collection(&engine.store, &coll, &opts).await?;
            print_ingest_report(&name, &report);
            engine.close().await;
        }
        CollectionAction::List => {
            for coll in &config.collections {
                println!(
                    "{:<20} {}  ({})",
                    coll.name,
                    coll.path.display(),
                    coll.mask
                );
            }
        }
        CollectionAction::Remove { name } => {
            let before = config.collections.len();
            config.collections.retain(|c| &c.name != name);
            if config.collections.len() == before {
                anyhow::bail!("no collection named '{name}'");
            }
            config.save_index_file()?;

            let engine = Engine::open(config.clone()).await?;
            let n = engine.store.deactivate_collection(name).await?;
            eprintln!("removed collection '{name}' ({n} documents deactivated)");
            engine.close().await;
        }
        CollectionAction::Rename { old, new } => {
            if config.find_collection(new).is_some() {
                anyhow::bail!("collection '{new}' already exists");
            }
            let Some(coll) = config.collections.iter_mut().find(|c| &c.name == old) else {
                anyhow::bail!("no collection named '{old}'");
            };
            coll.name = new.clone();

            // Re-key any contexts under the old name.
            let keys: Vec<String> = config
                .contexts
                .keys()
                .filter(|k| *k == old || k.starts_with(&format!("{old}/")))
                .cloned()
                .collect();
            for key in keys {
                if let Some(text) = config.contexts.remove(&key) {
                    let new_key = format!("{new}{}", &key[old.len()..]);
                    config.contexts.insert(new_key, text);
                }
            }
            config.save_index_file()?;

            let engine = Engine::open(config.clone()).await?;
            let n = engine.store.rename_collection(old, new).await?;
            eprintln!("renamed '{old}' to '{new}' ({n} documents)");
            engine.close().await;
        }
    }
    Ok(())
}

async fn context_command(config: &mut Config, action: &ContextAction) -> anyhow::Result<()> {
    match action {
        ContextAction::Add { path_or_text, text } => {
            let (key, value) = match text {
                Some(text) => (qmd::context::normalize_key(path_or_text), text.clone()),
                None => ("/".to_string(), path_or_text.clone()),
            };
            config.contexts.insert(key.clone(), value);
            config.save_index_file()?;
            eprintln!("context set for '{key}'");
        }
        ContextAction::List => {
            for (key, text) in &config.contexts {
                println!("{:<32} {}", key, text);
            }
        }
        ContextAction::Check => {
            let engine = Engine::open(config.clone()).await?;
            for key in config.contexts.keys() {
                if key == "/" {
                    println!("{:<32} ok (global)", key);
                    continue;
                }
                let (collection, prefix) = match key.split_once('/') {
                    Some((c, p)) => (c, Some(p)),
                    None => (key.as_str(), None),
                };
                if config.find_collection(collection).is_none() {
                    println!("{:<32} unknown collection '{collection}'", key);
                    continue;
                }
                let docs = engine.store.list_active_documents(Some(collection)).await?;
                let matched = match prefix {
                    Some(prefix) => docs.iter().any(|d| d.path.starts_with(prefix)),
                    None => !docs.is_empty(),
                };
                if matched {
                    println!("{:<32} ok", key);
                } else {
                    println!("{:<32} no documents match", key);
                }
            }
            engine.close().await;
        }
        ContextAction::Rm { path } => {
            let key = qmd::context::normalize_key(path);
            if config.contexts.remove(&key).is_none() {
                anyhow::bail!("no context for '{key}'");
            }
            config.save_index_file()?;
            eprintln!("context removed for '{key}'");
        }
    }
    Ok(())
}

async fn run_ls(engine: &Engine, target: Option<&str>) -> anyhow::Result<()> {
    match target {
        None => {
            let counts = engine.store.collection_counts().await?;
            for (name, n) in counts {
                println!("{:<20} {:>6} documents", name, n);
            }
        }
        Some(target) => {
            let target = target.trim_start_matches("qmd://");
            let (collection, prefix) = match target.split_once('/') {
                Some((c, p)) => (c, Some(p)),
                None => (target, None),
            };
            let docs = engine.store.list_active_documents(Some(collection)).await?;
            for doc in docs {
                if let Some(prefix) = prefix {
                    if !doc.path.starts_with(prefix) {
                        continue;
                    }
                }
                println!("qmd://{}/{}  #{}", doc.collection, doc.path, qmd::chunker::docid(&doc.hash));
            }
        }
    }
    Ok(())
}

async fn run_update(
    engine: &Engine,
    allow_run: bool,
    only: &[String],
) -> anyhow::Result<()> {
    let collections: Vec<_> = engine
        .config
        .collections
        .iter()
        .filter(|c| only.is_empty() || only.contains(&c.name))
        .cloned()
        .collect();
    if collections.is_empty() {
        anyhow::bail!("no collections configured (use `qmd collection add <path>`)");
    }

    let reporter = default_reporter();
    for coll in &collections {
        if coll.update_command.is_some() {
            if allow_run {
                run_update_command(coll)?;
            } else {
                eprintln!(
                    "skipping update command for '{}' (pass --allow-run to execute)",
                    coll.name
                );
            }
        }
        let opts = IngestOptions {
            max_file_bytes: engine.config.max_index_file_bytes,
            now: chrono::Utc::now().timestamp(),
            reporter: reporter.as_ref(),
        };
        let report = sync_collection(&engine.store, coll, &opts).await?;
        print_ingest_report(&coll.name, &report);
    }
    Ok(())
}
