//! Error taxonomy for the qmd core.
//!
//! Errors are classified by kind, not by origin: callers match on the
//! variant to decide whether to degrade (retrieval), skip (ingestion),
//! or abort (store/schema). The CLI boundary converts everything into
//! `anyhow` with a short message and exit code 1.

use thiserror::Error;

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, QmdError>;

#[derive(Debug, Error)]
pub enum QmdError {
    /// Missing or invalid command arguments.
    #[error("{0}")]
    Usage(String),

    /// Bad YAML, missing provider key, unrecognized provider.
    #[error("config error: {0}")]
    Config(String),

    /// A remote call failed after retries.
    #[error("provider {provider} failed during {op}{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Provider {
        provider: String,
        op: &'static str,
        status: Option<u16>,
        message: String,
    },

    /// Circuit open for this provider; retry after the cooldown.
    #[error("provider {provider} is cooling down for {remaining_secs}s after repeated failures")]
    ProviderCoolingDown {
        provider: String,
        remaining_secs: u64,
    },

    /// The vector subsystem has not been initialized (no embeddings built).
    #[error("vector index unavailable — run `qmd embed` first")]
    VectorUnavailable,

    /// The on-disk vector table was built with a different embedding dimension.
    #[error("embedding dimension mismatch: index has {existing}, model produces {requested} — rebuild with `qmd embed -f`")]
    DimensionMismatch { existing: usize, requested: usize },

    /// Store uniqueness violation. Indicates a bug or a concurrent writer.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Document, collection, or context absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Cooperative cancellation via timeout or user signal.
    #[error("cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl QmdError {
    /// True for failures that a best-effort caller may absorb by degrading
    /// to a deterministic fallback (expansion, rerank).
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            QmdError::Provider { .. }
                | QmdError::ProviderCoolingDown { .. }
                | QmdError::VectorUnavailable
                | QmdError::Cancelled
        )
    }
}
