//! Ingest and embed progress reporting.
//!
//! Progress is emitted on **stderr** so stdout stays parseable in machine
//! formats. The human reporter rewrites a single line using a clear-line
//! escape; when stderr is not a TTY, progress is off by default.

use std::io::Write;

/// A progress event from ingestion or embedding.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Walking a collection root; total not known yet.
    Scanning { collection: String },
    /// Ingest phase: `n` of `total` files processed.
    Ingesting { collection: String, n: u64, total: u64 },
    /// Embed phase: bytes processed out of total bytes, for a stable ETA.
    Embedding { done_bytes: u64, total_bytes: u64 },
}

/// Reports progress. Implementations write to stderr.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
    /// Terminate any in-place progress line before normal output resumes.
    fn finish(&self) {}
}

/// Human-friendly single-line progress on stderr.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Scanning { collection } => {
                format!("scan {collection}  discovering...")
            }
            ProgressEvent::Ingesting { collection, n, total } => {
                format!("index {collection}  {n} / {total} files")
            }
            ProgressEvent::Embedding { done_bytes, total_bytes } => {
                let pct = if *total_bytes > 0 {
                    done_bytes * 100 / total_bytes
                } else {
                    100
                };
                format!(
                    "embed  {} / {} ({pct}%)",
                    format_bytes(*done_bytes),
                    format_bytes(*total_bytes)
                )
            }
        };
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "\r\x1b[2K{line}");
        let _ = err.flush();
    }

    fn finish(&self) {
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "\r\x1b[2K");
        let _ = err.flush();
    }
}

/// No-op reporter for quiet/machine modes.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Default reporter: human progress when stderr is a TTY, otherwise off.
pub fn default_reporter() -> Box<dyn ProgressReporter> {
    if atty::is(atty::Stream::Stderr) {
        Box::new(StderrProgress)
    } else {
        Box::new(NoProgress)
    }
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
