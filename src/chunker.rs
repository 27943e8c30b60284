//! Deterministic content chunking and hashing.
//!
//! Content blobs are addressed by the SHA-256 of their UTF-8 bytes; the
//! first six hex characters double as the short `docid` shown to users.
//! Two chunkers cover the two consumers:
//!
//! - [`chunk_document`] — character-bounded, paragraph-boundary chunks for
//!   retrieval-time context building.
//! - [`chunk_document_by_tokens`] — token-bounded chunks with overlap for
//!   embedding.
//!
//! Token counts are a stable approximation (one CJK codepoint ≈ one token,
//! four ASCII characters ≈ one token), so chunk boundaries never depend on
//! which embedding provider is configured. Same input, same output.

use sha2::{Digest, Sha256};

/// Character budget for retrieval-time chunks.
pub const RETRIEVAL_CHUNK_CHARS: usize = 2000;

/// Token budget for embedding-time chunks.
pub const EMBED_CHUNK_TOKENS: usize = 200;

/// Token overlap between consecutive embedding chunks.
pub const EMBED_CHUNK_OVERLAP: usize = 40;

/// A retrieval-time chunk: a contiguous span of the body.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    /// Byte offset of the chunk start within the body.
    pub pos: usize,
}

/// An embedding-time chunk with its approximate token count.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenChunk {
    pub text: String,
    /// Byte offset of the chunk start within the body.
    pub pos: usize,
    pub tokens: usize,
}

/// SHA-256 of the body's UTF-8 bytes, lowercase hex.
pub fn hash_content(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Short document identifier: the first six hex characters of the hash.
pub fn docid(hash: &str) -> &str {
    &hash[..hash.len().min(6)]
}

/// Derive a title from the body: first ATX heading, else first Setext
/// heading, else the file stem of the fallback path.
pub fn extract_title(body: &str, fallback_path: &str) -> String {
    let mut prev: Option<&str> = None;
    for line in body.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix('#') {
            let heading = rest.trim_start_matches('#').trim();
            if !heading.is_empty() {
                return heading.to_string();
            }
        }
        // Setext: non-empty line underlined with = or -
        if let Some(p) = prev {
            if !trimmed.is_empty()
                && (trimmed.chars().all(|c| c == '=') || trimmed.chars().all(|c| c == '-'))
                && !p.is_empty()
            {
                return p.to_string();
            }
        }
        prev = Some(trimmed);
    }

    let name = fallback_path
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(fallback_path);
    name.rsplit_once('.')
        .map(|(stem, _)| stem)
        .filter(|s| !s.is_empty())
        .unwrap_or(name)
        .to_string()
}

/// True for codepoints treated as CJK for tokenization and term extraction.
pub fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3400..=0x4DBF     // CJK Extension A
        | 0x4E00..=0x9FFF   // CJK Unified Ideographs
        | 0x3040..=0x309F   // Hiragana
        | 0x30A0..=0x30FF   // Katakana
        | 0xAC00..=0xD7AF   // Hangul syllables
        | 0xF900..=0xFAFF   // CJK Compatibility Ideographs
    )
}

/// Approximate token count: one token per CJK codepoint, one token per four
/// non-CJK characters of each whitespace-delimited word (minimum one).
pub fn approx_token_count(text: &str) -> usize {
    let mut tokens = 0usize;
    for word in text.split_whitespace() {
        let cjk = word.chars().filter(|c| is_cjk(*c)).count();
        let other = word.chars().count() - cjk;
        tokens += cjk;
        if other > 0 {
            tokens += (other + 3) / 4;
        }
    }
    tokens
}

/// Split a body into character-bounded chunks on paragraph boundaries.
///
/// Paragraphs are packed until [`RETRIEVAL_CHUNK_CHARS`] would be exceeded;
/// a single oversize paragraph becomes its own chunk rather than being cut
/// mid-sentence. `pos` is the byte offset of the chunk's first paragraph.
pub fn chunk_document(body: &str) -> Vec<Chunk> {
    chunk_document_with_budget(body, RETRIEVAL_CHUNK_CHARS)
}

fn chunk_document_with_budget(body: &str, max_chars: usize) -> Vec<Chunk> {
    if body.trim().is_empty() {
        return Vec::new();
    }

    let paragraphs = split_paragraphs(body);
    let mut chunks = Vec::new();
    let mut buf = String::new();
    let mut buf_pos = 0usize;

    for (pos, para) in paragraphs {
        let would_be = if buf.is_empty() {
            para.chars().count()
        } else {
            buf.chars().count() + 2 + para.chars().count()
        };

        if would_be > max_chars && !buf.is_empty() {
            chunks.push(Chunk {
                text: std::mem::take(&mut buf),
                pos: buf_pos,
            });
        }

        if buf.is_empty() {
            buf_pos = pos;
            buf.push_str(para);
        } else {
            buf.push_str("\n\n");
            buf.push_str(para);
        }
    }

    if !buf.is_empty() {
        chunks.push(Chunk { text: buf, pos: buf_pos });
    }

    chunks
}

/// Paragraphs with their byte offsets, empty paragraphs dropped.
fn split_paragraphs(body: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    for raw in body.split("\n\n") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            // offset of the trimmed text within the raw slice
            let lead = raw.len() - raw.trim_start().len();
            out.push((offset + lead, trimmed));
        }
        offset += raw.len() + 2;
    }
    out
}

/// Split a body into token-bounded chunks with overlap, on line boundaries.
///
/// Lines are packed until `max_tokens` would be exceeded; the next chunk
/// restarts far enough back that roughly `overlap` tokens of trailing lines
/// are repeated. Consecutive chunk byte ranges therefore cover the whole
/// body, with intentional overlap at the seams.
pub fn chunk_document_by_tokens(body: &str) -> Vec<TokenChunk> {
    chunk_by_tokens_with(body, EMBED_CHUNK_TOKENS, EMBED_CHUNK_OVERLAP)
}

pub fn chunk_by_tokens_with(body: &str, max_tokens: usize, overlap: usize) -> Vec<TokenChunk> {
    if body.trim().is_empty() {
        return Vec::new();
    }

    // Lines with their byte offsets, newline included in the slice so
    // offsets stay exact.
    let mut lines: Vec<(usize, &str)> = Vec::new();
    let mut offset = 0usize;
    for line in body.split_inclusive('\n') {
        lines.push((offset, line));
        offset += line.len();
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < lines.len() {
        let mut tokens = 0usize;
        let mut end = start;
        while end < lines.len() {
            let t = approx_token_count(lines[end].1);
            if tokens > 0 && tokens + t > max_tokens {
                break;
            }
            tokens += t;
            end += 1;
        }

        let chunk_start = lines[start].0;
        let chunk_end = if end < lines.len() {
            lines[end].0
        } else {
            body.len()
        };
        let text = body[chunk_start..chunk_end].trim_end_matches('\n');
        if !text.trim().is_empty() {
            chunks.push(TokenChunk {
                text: text.to_string(),
                pos: chunk_start,
                tokens,
            });
        }

        if end >= lines.len() {
            break;
        }

        // Back up so the next chunk repeats ~`overlap` tokens, while always
        // making forward progress.
        let mut back = end;
        let mut back_tokens = 0usize;
        while back > start + 1 {
            let t = approx_token_count(lines[back - 1].1);
            if back_tokens + t > overlap {
                break;
            }
            back_tokens += t;
            back -= 1;
        }
        start = back.max(start + 1);
    }

    chunks
}
