//! Configuration loading and validation.
//!
//! qmd keeps its state in two places:
//!
//! - `<config_dir>/index.yml` — collections and context annotations (YAML).
//! - `<data_dir>/<index-name>.sqlite` — the index database.
//!
//! `<config_dir>/.env` may hold provider keys and `QMD_*` tuning knobs.
//! `QMD_`-prefixed keys from that file override the inherited environment;
//! all other keys are only set when absent, so a shell-exported API key
//! always wins over the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default per-file size cap for indexing (64 MiB).
pub const DEFAULT_MAX_INDEX_FILE_BYTES: u64 = 64 * 1024 * 1024;

/// A named view over a filesystem subtree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionConfig {
    /// Unique collection name, used as a logical namespace.
    pub name: String,
    /// Absolute root path of the subtree.
    pub path: PathBuf,
    /// Glob selecting files beneath the root.
    #[serde(default = "default_mask")]
    pub mask: String,
    /// Optional shell command run before re-indexing (requires `--allow-run`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_command: Option<String>,
}

fn default_mask() -> String {
    "**/*.md".to_string()
}

/// On-disk shape of `index.yml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexFile {
    #[serde(default)]
    pub collections: Vec<CollectionConfig>,
    /// Context annotations keyed by virtual path prefix (`/` is global).
    #[serde(default)]
    pub contexts: BTreeMap<String, String>,
}

/// Which rerank backend the gateway should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerankMode {
    /// Chat model prompted as a reranker (default).
    Llm,
    /// Dedicated rerank endpoint.
    Rerank,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Selected index name (`--index`), default `index`.
    pub index_name: String,
    pub collections: Vec<CollectionConfig>,
    pub contexts: BTreeMap<String, String>,

    /// Caller-visible timeout applied to all outbound requests, if set.
    pub timeout_ms: Option<u64>,
    pub embed_batch_size: usize,
    pub rerank_doc_limit: usize,
    pub rerank_chunks_per_doc: usize,
    pub max_index_file_bytes: u64,
    pub rerank_mode: RerankMode,
    pub breaker_cooldown_ms: u64,
}

impl Config {
    /// Load configuration for the given index name, applying `.env` and
    /// environment overrides.
    pub fn load(index_name: Option<String>) -> Result<Self> {
        let config_dir = config_dir()?;
        let data_dir = data_dir()?;
        apply_env_file(&config_dir.join(".env"));

        let index_file = load_index_file(&config_dir.join("index.yml"))?;

        Ok(Self {
            config_dir,
            data_dir,
            index_name: index_name.unwrap_or_else(|| "index".to_string()),
            collections: index_file.collections,
            contexts: index_file.contexts,
            timeout_ms: env_u64("QMD_TIMEOUT_MS"),
            embed_batch_size: env_usize("QMD_EMBED_BATCH_SIZE").unwrap_or(32),
            rerank_doc_limit: env_usize("QMD_RERANK_DOC_LIMIT").unwrap_or(40),
            rerank_chunks_per_doc: env_usize("QMD_RERANK_CHUNKS_PER_DOC").unwrap_or(3),
            max_index_file_bytes: env_file_size("QMD_MAX_INDEX_FILE_BYTES")
                .unwrap_or(DEFAULT_MAX_INDEX_FILE_BYTES),
            rerank_mode: match std::env::var("QMD_RERANK_MODE").as_deref() {
                Ok("rerank") => RerankMode::Rerank,
                _ => RerankMode::Llm,
            },
            breaker_cooldown_ms: env_u64("QMD_BREAKER_COOLDOWN_MS").unwrap_or(5 * 60 * 1000),
        })
    }

    /// Path of the index database file for the selected index name.
    pub fn index_db_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.sqlite", self.index_name))
    }

    /// Path of the optional rerank prompt override.
    pub fn rerank_prompt_path(&self) -> PathBuf {
        self.config_dir.join("rerank-prompt.txt")
    }

    pub fn find_collection(&self, name: &str) -> Option<&CollectionConfig> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// Persist collections and contexts back to `index.yml`.
    pub fn save_index_file(&self) -> Result<()> {
        let file = IndexFile {
            collections: self.collections.clone(),
            contexts: self.contexts.clone(),
        };
        std::fs::create_dir_all(&self.config_dir)?;
        let yaml = serde_yaml::to_string(&file)?;
        let path = self.config_dir.join("index.yml");
        std::fs::write(&path, yaml)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Validate a user-supplied collection filter against the configured
    /// collections. Unknown or empty names are dropped with a warning; the
    /// query itself never fails. Returns `None` when no filter was given.
    pub fn resolve_collection_filter(&self, requested: &[String]) -> Option<Vec<String>> {
        if requested.is_empty() {
            return None;
        }
        let mut known = Vec::new();
        for name in requested {
            if name.trim().is_empty() {
                tracing::warn!("ignoring empty collection name in filter");
                continue;
            }
            if self.find_collection(name).is_some() {
                if !known.contains(name) {
                    known.push(name.clone());
                }
            } else {
                tracing::warn!(collection = %name, "unknown collection in filter, dropping");
            }
        }
        Some(known)
    }
}

/// `$QMD_CONFIG_DIR`, else `~/.config/qmd`.
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("QMD_CONFIG_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME").context("HOME is not set")?;
    Ok(Path::new(&home).join(".config").join("qmd"))
}

/// `$QMD_DATA_DIR`, else `~/.local/share/qmd`.
pub fn data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("QMD_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME").context("HOME is not set")?;
    Ok(Path::new(&home).join(".local").join("share").join("qmd"))
}

fn load_index_file(path: &Path) -> Result<IndexFile> {
    if !path.exists() {
        return Ok(IndexFile::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let file: IndexFile = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let mut seen = std::collections::HashSet::new();
    for coll in &file.collections {
        if coll.name.trim().is_empty() {
            anyhow::bail!("collection with empty name in {}", path.display());
        }
        if !seen.insert(coll.name.clone()) {
            anyhow::bail!(
                "duplicate collection name '{}' in {}",
                coll.name,
                path.display()
            );
        }
    }
    Ok(file)
}

/// Apply `<config_dir>/.env`. `QMD_`-prefixed keys override the inherited
/// environment; other keys are set only when absent.
fn apply_env_file(path: &Path) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().trim_start_matches("export ").trim();
        let value = value.trim().trim_matches('"').trim_matches('\'');
        if key.is_empty() {
            continue;
        }
        if key.starts_with("QMD_") || std::env::var(key).is_err() {
            std::env::set_var(key, value);
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|v| *v > 0)
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()?
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|v| *v > 0)
}

/// Size knob parsed as a float so `NaN`, infinities, and non-positive values
/// all fall back to the default.
fn env_file_size(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    let parsed: f64 = raw.trim().parse().ok()?;
    if !parsed.is_finite() || parsed <= 0.0 {
        return None;
    }
    Some(parsed as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_file_roundtrip() {
        let yaml = r#"
collections:
  - name: notes
    path: /home/u/notes
    mask: "**/*.md"
contexts:
  "/": "personal knowledge base"
  "notes/recipes": "cooking notes"
"#;
        let parsed: IndexFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.collections.len(), 1);
        assert_eq!(parsed.collections[0].name, "notes");
        assert_eq!(parsed.collections[0].mask, "**/*.md");
        assert_eq!(parsed.contexts.len(), 2);
        assert_eq!(
            parsed.contexts.get("notes/recipes").map(String::as_str),
            Some("cooking notes")
        );
    }

    #[test]
    fn mask_defaults_to_markdown() {
        let yaml = "collections:\n  - name: docs\n    path: /tmp/docs\n";
        let parsed: IndexFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.collections[0].mask, "**/*.md");
    }

    #[test]
    fn file_size_knob_rejects_nan_and_nonpositive() {
        std::env::set_var("QMD_TEST_SIZE_A", "NaN");
        assert_eq!(env_file_size("QMD_TEST_SIZE_A"), None);
        std::env::set_var("QMD_TEST_SIZE_A", "-5");
        assert_eq!(env_file_size("QMD_TEST_SIZE_A"), None);
        std::env::set_var("QMD_TEST_SIZE_A", "0");
        assert_eq!(env_file_size("QMD_TEST_SIZE_A"), None);
        std::env::set_var("QMD_TEST_SIZE_A", "1048576");
        assert_eq!(env_file_size("QMD_TEST_SIZE_A"), Some(1048576));
    }

    fn test_config() -> Config {
        Config {
            config_dir: PathBuf::from("/tmp"),
            data_dir: PathBuf::from("/tmp"),
            index_name: "index".into(),
            collections: vec![CollectionConfig {
                name: "notes".into(),
                path: PathBuf::from("/tmp/notes"),
                mask: "**/*.md".into(),
                update_command: None,
            }],
            contexts: BTreeMap::new(),
            timeout_ms: None,
            embed_batch_size: 32,
            rerank_doc_limit: 40,
            rerank_chunks_per_doc: 3,
            max_index_file_bytes: DEFAULT_MAX_INDEX_FILE_BYTES,
            rerank_mode: RerankMode::Llm,
            breaker_cooldown_ms: 300_000,
        }
    }

    #[test]
    fn collection_filter_drops_unknown_names() {
        let config = test_config();

        assert_eq!(config.resolve_collection_filter(&[]), None);
        let filter = config
            .resolve_collection_filter(&["notes".to_string(), "ghost".to_string()])
            .unwrap();
        assert_eq!(filter, vec!["notes".to_string()]);
        let empty = config
            .resolve_collection_filter(&["ghost".to_string()])
            .unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn index_db_path_uses_index_name() {
        let mut config = test_config();
        config.index_name = "work".into();
        assert!(config.index_db_path().ends_with("work.sqlite"));
    }
}
