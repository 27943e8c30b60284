//! Ingestion: reconcile a collection's filesystem state with the store.
//!
//! A sync walks the collection root with its glob, applies the safety
//! filters (symlink escape, size cap, binary sniff, strict UTF-8), and
//! diffs each surviving file against the store by content hash. Files
//! disappear from the active set only when the walk no longer yields them.
//! Every file's reconciliation commits in a single transaction, so a
//! failed sync never leaves a collection half-updated.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::chunker::{extract_title, hash_content};
use crate::config::CollectionConfig;
use crate::error::{QmdError, Result};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::store::Store;

/// Directory components never descended into, on top of dotfile pruning.
const EXCLUDED_DIRS: &[&str] = &["node_modules", ".git", ".cache", "vendor", "dist", "build"];

/// Per-reason skip counters, reported after the scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SkipCounts {
    pub symlink_escape: u64,
    pub too_large: u64,
    pub binary: u64,
    pub unreadable: u64,
}

impl SkipCounts {
    pub fn total(&self) -> u64 {
        self.symlink_escape + self.too_large + self.binary + self.unreadable
    }
}

/// Outcome of one collection sync.
#[derive(Debug, Default, Clone)]
pub struct IngestReport {
    pub scanned: u64,
    pub added: u64,
    pub updated: u64,
    pub title_updated: u64,
    pub unchanged: u64,
    pub deactivated: u64,
    pub orphaned_content_removed: u64,
    pub skips: SkipCounts,
}

pub struct IngestOptions<'a> {
    /// Files larger than this are skipped with a `too_large` record.
    pub max_file_bytes: u64,
    /// Clock, injected so tests control timestamps.
    pub now: i64,
    pub reporter: &'a dyn ProgressReporter,
}

/// Reconcile one collection. Individual files skip on safety or I/O
/// problems; only store-level errors abort.
pub async fn sync_collection(
    store: &Store,
    coll: &CollectionConfig,
    opts: &IngestOptions<'_>,
) -> Result<IngestReport> {
    let root = &coll.path;
    let real_root = std::fs::canonicalize(root).map_err(|e| {
        QmdError::Config(format!(
            "collection '{}' root {} is not accessible: {e}",
            coll.name,
            root.display()
        ))
    })?;

    let glob = build_globset(&coll.mask)
        .map_err(|e| QmdError::Config(format!("bad glob '{}': {e}", coll.mask)))?;

    opts.reporter.report(ProgressEvent::Scanning {
        collection: coll.name.clone(),
    });

    let mut report = IngestReport::default();
    let candidates = collect_candidates(root, &glob, &mut report);

    let total = candidates.len() as u64;
    let mut seen_paths: HashSet<String> = HashSet::new();
    let mut processed = 0u64;

    for candidate in &candidates {
        processed += 1;
        opts.reporter.report(ProgressEvent::Ingesting {
            collection: coll.name.clone(),
            n: processed,
            total,
        });

        let Some(file) = read_candidate(candidate, &real_root, opts.max_file_bytes, &mut report)
        else {
            continue;
        };
        report.scanned += 1;

        let path = disambiguate_path(
            normalize_rel_path(&candidate.relative),
            &candidate.relative,
            &mut seen_paths,
        );

        let hash = hash_content(&file.body);
        let title = extract_title(&file.body, &candidate.relative);

        match store.find_active_document(&coll.name, &path).await? {
            Some(existing) if existing.hash == hash && existing.title == title => {
                report.unchanged += 1;
            }
            Some(existing) if existing.hash == hash => {
                store
                    .update_document_title(existing.id, &title, file.modified)
                    .await?;
                report.title_updated += 1;
            }
            Some(existing) => {
                store
                    .replace_document_content(
                        existing.id,
                        &title,
                        &hash,
                        &file.body,
                        file.modified,
                        opts.now,
                    )
                    .await?;
                report.updated += 1;
            }
            None => {
                store
                    .add_document(
                        &coll.name,
                        &path,
                        &title,
                        &hash,
                        &file.body,
                        file.created,
                        file.modified,
                        opts.now,
                    )
                    .await?;
                report.added += 1;
            }
        }
    }

    // Deactivate whatever the walk no longer yields.
    for existing_path in store.active_paths(&coll.name).await? {
        if !seen_paths.contains(&existing_path) {
            if store.deactivate_document(&coll.name, &existing_path).await? {
                report.deactivated += 1;
            }
        }
    }

    report.orphaned_content_removed = store.cleanup_orphaned_content().await?;
    opts.reporter.finish();
    Ok(report)
}

struct Candidate {
    absolute: PathBuf,
    relative: String,
}

struct CandidateFile {
    body: String,
    created: i64,
    modified: i64,
}

/// Walk the root, pruning excluded and hidden components, and keep glob
/// matches in sorted order for deterministic reconciliation.
fn collect_candidates(root: &Path, glob: &GlobSet, report: &mut IngestReport) -> Vec<Candidate> {
    let mut out = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_excluded_component(entry.file_name()));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                tracing::debug!(error = %err, "walk error, skipping entry");
                report.skips.unreadable += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        if !glob.is_match(&relative) {
            continue;
        }
        out.push(Candidate {
            absolute: entry.path().to_path_buf(),
            relative,
        });
    }

    out.sort_by(|a, b| a.relative.cmp(&b.relative));
    out
}

/// Apply the safety filters to one candidate. `None` means skipped, with
/// the reason recorded (empty files skip silently).
fn read_candidate(
    candidate: &Candidate,
    real_root: &Path,
    max_file_bytes: u64,
    report: &mut IngestReport,
) -> Option<CandidateFile> {
    // Resolve symlinks; anything outside the real root is an escape.
    let resolved = match std::fs::canonicalize(&candidate.absolute) {
        Ok(p) => p,
        Err(err) => {
            tracing::debug!(path = %candidate.relative, error = %err, "unresolvable, skipping");
            report.skips.unreadable += 1;
            return None;
        }
    };
    if path_escapes(real_root, &resolved) {
        report.skips.symlink_escape += 1;
        return None;
    }

    let metadata = match std::fs::metadata(&candidate.absolute) {
        Ok(m) => m,
        Err(err) => {
            tracing::debug!(path = %candidate.relative, error = %err, "stat failed, skipping");
            report.skips.unreadable += 1;
            return None;
        }
    };
    if metadata.len() > max_file_bytes {
        report.skips.too_large += 1;
        return None;
    }

    let bytes = match std::fs::read(&candidate.absolute) {
        Ok(b) => b,
        Err(err) => {
            tracing::debug!(path = %candidate.relative, error = %err, "read failed, skipping");
            report.skips.unreadable += 1;
            return None;
        }
    };
    if bytes.contains(&0) {
        report.skips.binary += 1;
        return None;
    }
    let body = match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(_) => {
            report.skips.unreadable += 1;
            return None;
        }
    };
    if body.trim().is_empty() {
        return None;
    }

    let modified = file_time(metadata.modified().ok());
    let created = file_time(metadata.created().ok()).min(modified).max(0);
    Some(CandidateFile {
        body,
        created: if created > 0 { created } else { modified },
        modified,
    })
}

fn file_time(time: Option<std::time::SystemTime>) -> i64 {
    time.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn is_excluded_component(name: &std::ffi::OsStr) -> bool {
    let name = name.to_string_lossy();
    name.starts_with('.') || EXCLUDED_DIRS.contains(&name.as_ref())
}

/// True when `resolved` is not equal to or under `real_root`. On
/// case-insensitive filesystems the comparison is case-folded.
fn path_escapes(real_root: &Path, resolved: &Path) -> bool {
    if resolved.starts_with(real_root) {
        return false;
    }
    if cfg!(any(target_os = "macos", target_os = "windows")) {
        let root = real_root.to_string_lossy().to_lowercase();
        let path = resolved.to_string_lossy().to_lowercase();
        return !Path::new(&path).starts_with(Path::new(&root));
    }
    true
}

/// Normalize a relative path into a stable document path: forward slashes,
/// no leading `./`, no repeated separators.
pub fn normalize_rel_path(relative: &str) -> String {
    let mut path = relative.replace('\\', "/");
    while path.starts_with("./") {
        path = path[2..].to_string();
    }
    while path.contains("//") {
        path = path.replace("//", "/");
    }
    path.trim_start_matches('/').to_string()
}

/// Resolve collisions between normalized paths deterministically: fall back
/// to the raw relative path, then suffix `~N`.
fn disambiguate_path(
    normalized: String,
    raw_relative: &str,
    seen: &mut HashSet<String>,
) -> String {
    if seen.insert(normalized.clone()) {
        return normalized;
    }
    if seen.insert(raw_relative.to_string()) {
        return raw_relative.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{normalized}~{n}");
        if seen.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

fn build_globset(mask: &str) -> std::result::Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    builder.add(Glob::new(mask)?);
    Ok(builder.build()?)
}

/// Run a collection's `update_command` in its root via `sh -c`. Only
/// invoked when the caller passed `--allow-run`.
pub fn run_update_command(coll: &CollectionConfig) -> Result<()> {
    let Some(command) = &coll.update_command else {
        return Ok(());
    };
    tracing::info!(collection = %coll.name, command, "running update command");
    let status = std::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(&coll.path)
        .status()?;
    if !status.success() {
        return Err(QmdError::Config(format!(
            "update command for '{}' exited with {status}",
            coll.name
        )));
    }
    Ok(())
}
