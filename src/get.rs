//! Document retrieval by file reference.
//!
//! A fileref can be any of:
//!
//! - `#abcdef` — 6-character content-hash prefix (docid)
//! - `qmd://collection/path` — virtual path
//! - `collection/path` — bare virtual path
//! - a filesystem path under some collection root
//!
//! `get` returns one document with optional line windowing; `multi-get`
//! expands a glob (or comma-separated list) over virtual paths with a
//! cumulative byte budget.

use globset::Glob;
use std::path::Path;

use crate::engine::Engine;
use crate::error::{QmdError, Result};
use crate::search::SearchHit;
use crate::store::Document;

/// A parsed file reference.
#[derive(Debug, Clone, PartialEq)]
pub enum FileRef {
    DocId(String),
    Virtual { collection: String, path: String },
    Fs(String),
}

/// Options for `get`.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// 1-based first line to print.
    pub from: Option<usize>,
    /// Number of lines to print.
    pub lines: Option<usize>,
    pub line_numbers: bool,
}

/// Split a trailing `:<line>` suffix off a fileref. The scheme colon in
/// `qmd://` never matches because the suffix must be all digits.
pub fn split_line_suffix(raw: &str) -> (&str, Option<usize>) {
    if let Some((head, tail)) = raw.rsplit_once(':') {
        if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(line) = tail.parse::<usize>() {
                return (head, Some(line));
            }
        }
    }
    (raw, None)
}

/// Parse a raw fileref string (without line suffix).
pub fn parse_fileref(raw: &str) -> Result<FileRef> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(QmdError::Usage("empty file reference".into()));
    }
    if let Some(id) = raw.strip_prefix('#') {
        return Ok(FileRef::DocId(id.to_string()));
    }
    if let Some(rest) = raw.strip_prefix("qmd://") {
        return virtual_ref(rest);
    }
    if raw.starts_with('/') || raw.starts_with("./") || raw.starts_with("~/") {
        return Ok(FileRef::Fs(raw.to_string()));
    }
    // Bare `collection/path`; a bare name with no slash cannot address a
    // document.
    if raw.contains('/') {
        return virtual_ref(raw);
    }
    Err(QmdError::Usage(format!(
        "unrecognized file reference '{raw}' (use #docid, qmd://collection/path, or a file path)"
    )))
}

fn virtual_ref(rest: &str) -> Result<FileRef> {
    let (collection, path) = rest
        .split_once('/')
        .ok_or_else(|| QmdError::Usage(format!("incomplete virtual path '{rest}'")))?;
    if collection.is_empty() || path.is_empty() {
        return Err(QmdError::Usage(format!("incomplete virtual path '{rest}'")));
    }
    Ok(FileRef::Virtual {
        collection: collection.to_string(),
        path: path.to_string(),
    })
}

/// Resolve a fileref to its active document.
pub async fn resolve_fileref(engine: &Engine, fileref: &FileRef) -> Result<Document> {
    match fileref {
        FileRef::DocId(prefix) => engine
            .store
            .find_document_by_docid(prefix)
            .await?
            .ok_or_else(|| QmdError::NotFound(format!("#{prefix}"))),
        FileRef::Virtual { collection, path } => engine
            .store
            .find_active_document(collection, path)
            .await?
            .ok_or_else(|| QmdError::NotFound(format!("qmd://{collection}/{path}"))),
        FileRef::Fs(raw) => {
            let absolute = std::fs::canonicalize(Path::new(raw))
                .map_err(|_| QmdError::NotFound(raw.clone()))?;
            for coll in &engine.config.collections {
                let Ok(root) = std::fs::canonicalize(&coll.path) else {
                    continue;
                };
                if let Ok(rel) = absolute.strip_prefix(&root) {
                    let rel = crate::ingest::normalize_rel_path(&rel.to_string_lossy());
                    if let Some(doc) =
                        engine.store.find_active_document(&coll.name, &rel).await?
                    {
                        return Ok(doc);
                    }
                }
            }
            Err(QmdError::NotFound(raw.clone()))
        }
    }
}

/// Fetch a document's body and apply the line window.
pub async fn get_body(engine: &Engine, doc: &Document, opts: &GetOptions) -> Result<String> {
    let body = engine
        .store
        .get_content(&doc.hash)
        .await?
        .ok_or_else(|| QmdError::NotFound(format!("content {}", doc.hash)))?;
    Ok(render_body(&body, opts))
}

/// Apply `--from` / `-l` / `--line-numbers` to a body.
pub fn render_body(body: &str, opts: &GetOptions) -> String {
    let from = opts.from.unwrap_or(1).max(1);
    let all_lines: Vec<&str> = body.lines().collect();
    let start = from - 1;
    if start >= all_lines.len() {
        return String::new();
    }
    let end = match opts.lines {
        Some(n) => (start + n).min(all_lines.len()),
        None => all_lines.len(),
    };

    let window = &all_lines[start..end];
    if opts.line_numbers {
        let width = end.to_string().len();
        window
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:>width$}: {line}", start + i + 1))
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        window.join("\n")
    }
}

/// `multi-get`: expand a glob or comma-separated fileref list into hits,
/// bounded by a cumulative byte budget.
pub async fn multi_get(
    engine: &Engine,
    pattern: &str,
    max_lines: Option<usize>,
    max_bytes: u64,
) -> Result<Vec<SearchHit>> {
    let docs = if pattern.contains(',') {
        let mut out = Vec::new();
        for part in pattern.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let fileref = parse_fileref(part)?;
            match resolve_fileref(engine, &fileref).await {
                Ok(doc) => out.push(doc),
                Err(QmdError::NotFound(what)) => {
                    tracing::warn!(fileref = %what, "not found, skipping");
                }
                Err(err) => return Err(err),
            }
        }
        out
    } else {
        let glob = Glob::new(pattern.trim_start_matches("qmd://"))
            .map_err(|e| QmdError::Usage(format!("bad pattern '{pattern}': {e}")))?
            .compile_matcher();
        engine
            .store
            .list_active_documents(None)
            .await?
            .into_iter()
            .filter(|d| glob.is_match(format!("{}/{}", d.collection, d.path)))
            .collect()
    };

    let mut out = Vec::new();
    let mut budget = max_bytes;
    for doc in docs {
        if budget == 0 {
            break;
        }
        let opts = GetOptions {
            from: None,
            lines: max_lines,
            line_numbers: false,
        };
        let mut body = get_body(engine, &doc, &opts).await?;
        if body.len() as u64 > budget {
            let mut cut = budget as usize;
            while cut > 0 && !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        budget = budget.saturating_sub(body.len() as u64);

        out.push(SearchHit {
            docid: Some(crate::chunker::docid(&doc.hash).to_string()),
            score: 1.0,
            file: format!("qmd://{}/{}", doc.collection, doc.path),
            title: doc.title.clone(),
            context: crate::context::resolve_context(
                &engine.config.contexts,
                &doc.collection,
                &doc.path,
            ),
            also_in: Vec::new(),
            snippet: body.chars().take(240).collect(),
            body,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fileref_parsing() {
        assert_eq!(
            parse_fileref("#abc123").unwrap(),
            FileRef::DocId("abc123".into())
        );
        assert_eq!(
            parse_fileref("qmd://notes/recipes/pasta.md").unwrap(),
            FileRef::Virtual {
                collection: "notes".into(),
                path: "recipes/pasta.md".into()
            }
        );
        assert_eq!(
            parse_fileref("notes/pasta.md").unwrap(),
            FileRef::Virtual {
                collection: "notes".into(),
                path: "pasta.md".into()
            }
        );
        assert_eq!(
            parse_fileref("/home/u/notes/pasta.md").unwrap(),
            FileRef::Fs("/home/u/notes/pasta.md".into())
        );
        assert!(parse_fileref("").is_err());
        assert!(parse_fileref("bare-name").is_err());
        assert!(parse_fileref("qmd://notes").is_err());
    }

    #[test]
    fn line_suffix_split() {
        assert_eq!(split_line_suffix("notes/a.md:12"), ("notes/a.md", Some(12)));
        assert_eq!(
            split_line_suffix("qmd://notes/a.md"),
            ("qmd://notes/a.md", None)
        );
        assert_eq!(split_line_suffix("notes/a.md"), ("notes/a.md", None));
        assert_eq!(split_line_suffix("#abc123"), ("#abc123", None));
    }

    #[test]
    fn body_windowing() {
        let body = "one\ntwo\nthree\nfour";
        let opts = GetOptions {
            from: Some(2),
            lines: Some(2),
            line_numbers: false,
        };
        assert_eq!(render_body(body, &opts), "two\nthree");

        let opts = GetOptions {
            from: Some(10),
            lines: None,
            line_numbers: false,
        };
        assert_eq!(render_body(body, &opts), "");
    }

    #[test]
    fn body_line_numbers() {
        let body = "alpha\nbeta";
        let opts = GetOptions {
            from: None,
            lines: None,
            line_numbers: true,
        };
        assert_eq!(render_body(body, &opts), "1: alpha\n2: beta");
    }
}
