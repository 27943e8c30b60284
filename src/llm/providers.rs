//! Provider catalog: capabilities, endpoints, and typed response shapes.
//!
//! A provider is enabled by its API key being present in the environment.
//! Each provider kind is a tagged variant with its own request builder and
//! response struct; parsers return `Result` so shape drift surfaces as a
//! typed provider error instead of a panic.

use serde::Deserialize;

use crate::error::{QmdError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Siliconflow,
    OpenAiCompat,
    Gemini,
    Dashscope,
}

/// A resolved, usable provider.
#[derive(Debug, Clone)]
pub struct Provider {
    pub kind: ProviderKind,
    pub name: &'static str,
    pub base_url: String,
    pub api_key: String,
    pub embed_model: String,
    pub chat_model: String,
    pub rerank_model: String,
}

impl Provider {
    /// Resolve every provider whose API key is present, in routing
    /// preference order.
    pub fn resolve_all() -> Vec<Provider> {
        let mut out = Vec::new();

        if let Ok(key) = std::env::var("SILICONFLOW_API_KEY") {
            out.push(Provider {
                kind: ProviderKind::Siliconflow,
                name: "siliconflow",
                base_url: env_or("QMD_SILICONFLOW_BASE_URL", "https://api.siliconflow.com/v1"),
                api_key: key,
                embed_model: env_or("QMD_EMBED_MODEL", "BAAI/bge-m3"),
                chat_model: env_or("QMD_CHAT_MODEL", "Qwen/Qwen2.5-7B-Instruct"),
                rerank_model: env_or("QMD_RERANK_MODEL", "BAAI/bge-reranker-v2-m3"),
            });
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            out.push(Provider {
                kind: ProviderKind::OpenAiCompat,
                name: "openai-compat",
                base_url: env_or("QMD_OPENAI_BASE_URL", "https://api.openai.com/v1"),
                api_key: key,
                embed_model: env_or("QMD_EMBED_MODEL", "text-embedding-3-small"),
                chat_model: env_or("QMD_CHAT_MODEL", "gpt-4o-mini"),
                rerank_model: String::new(),
            });
        }
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            out.push(Provider {
                kind: ProviderKind::Gemini,
                name: "gemini",
                base_url: env_or(
                    "QMD_GEMINI_BASE_URL",
                    "https://generativelanguage.googleapis.com/v1beta",
                ),
                api_key: key,
                embed_model: String::new(),
                chat_model: env_or("QMD_CHAT_MODEL", "gemini-2.0-flash"),
                rerank_model: String::new(),
            });
        }
        if let Ok(key) = std::env::var("DASHSCOPE_API_KEY") {
            out.push(Provider {
                kind: ProviderKind::Dashscope,
                name: "dashscope",
                base_url: env_or(
                    "QMD_DASHSCOPE_BASE_URL",
                    "https://dashscope.aliyuncs.com/api/v1",
                ),
                api_key: key,
                embed_model: String::new(),
                chat_model: String::new(),
                rerank_model: env_or("QMD_RERANK_MODEL", "gte-rerank-v2"),
            });
        }
        out
    }

    pub fn can_embed(&self) -> bool {
        matches!(self.kind, ProviderKind::Siliconflow | ProviderKind::OpenAiCompat)
    }

    /// Query expansion runs over the chat surface.
    pub fn can_expand(&self) -> bool {
        self.can_chat()
    }

    pub fn can_chat(&self) -> bool {
        matches!(
            self.kind,
            ProviderKind::Siliconflow | ProviderKind::OpenAiCompat | ProviderKind::Gemini
        )
    }

    pub fn can_rerank_dedicated(&self) -> bool {
        matches!(self.kind, ProviderKind::Siliconflow | ProviderKind::Dashscope)
    }

    fn bearer(&self) -> Vec<(String, String)> {
        vec![(
            "Authorization".to_string(),
            format!("Bearer {}", self.api_key),
        )]
    }

    // ============ Request builders ============

    /// `(url, headers, body)` for a batch embedding request.
    pub fn embed_request(&self, texts: &[String]) -> (String, Vec<(String, String)>, serde_json::Value) {
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.embed_model,
            "input": texts,
        });
        (url, self.bearer(), body)
    }

    /// `(url, headers, body)` for a system+user chat request.
    pub fn chat_request(
        &self,
        system: &str,
        user: &str,
    ) -> (String, Vec<(String, String)>, serde_json::Value) {
        match self.kind {
            ProviderKind::Gemini => {
                let url = format!(
                    "{}/models/{}:generateContent?key={}",
                    self.base_url, self.chat_model, self.api_key
                );
                let body = serde_json::json!({
                    "systemInstruction": { "parts": [{ "text": system }] },
                    "contents": [{ "role": "user", "parts": [{ "text": user }] }],
                    "generationConfig": { "temperature": 0.0 },
                });
                (url, Vec::new(), body)
            }
            _ => {
                let url = format!("{}/chat/completions", self.base_url);
                let body = serde_json::json!({
                    "model": self.chat_model,
                    "messages": [
                        { "role": "system", "content": system },
                        { "role": "user", "content": user },
                    ],
                    "temperature": 0.0,
                });
                (url, self.bearer(), body)
            }
        }
    }

    /// `(url, headers, body)` for a dedicated rerank request. `top_n` is
    /// always the number of candidates, never a constant.
    pub fn rerank_request(
        &self,
        query: &str,
        documents: &[String],
    ) -> (String, Vec<(String, String)>, serde_json::Value) {
        match self.kind {
            ProviderKind::Dashscope => {
                let url = format!(
                    "{}/services/rerank/text-rerank/text-rerank",
                    self.base_url
                );
                let body = serde_json::json!({
                    "model": self.rerank_model,
                    "input": { "query": query, "documents": documents },
                    "parameters": { "top_n": documents.len(), "return_documents": false },
                });
                (url, self.bearer(), body)
            }
            _ => {
                let url = format!("{}/rerank", self.base_url);
                let body = serde_json::json!({
                    "model": self.rerank_model,
                    "query": query,
                    "documents": documents,
                    "top_n": documents.len(),
                });
                (url, self.bearer(), body)
            }
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

// ============ Response shapes ============

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankItem>,
}

#[derive(Debug, Deserialize)]
struct RerankItem {
    index: usize,
    relevance_score: f64,
}

#[derive(Debug, Deserialize)]
struct DashscopeRerankResponse {
    output: RerankResponse,
}

fn shape_error(provider: &Provider, op: &'static str, what: &str) -> QmdError {
    QmdError::Provider {
        provider: provider.name.to_string(),
        op,
        status: None,
        message: format!("unexpected response shape: {what}"),
    }
}

/// Decode a batch embedding response, preserving input order. Slots the
/// provider skipped come back as `None` rather than failing the batch.
pub fn parse_embeddings(
    provider: &Provider,
    value: serde_json::Value,
    expected: usize,
) -> Result<Vec<Option<Vec<f32>>>> {
    let resp: EmbeddingsResponse = serde_json::from_value(value)
        .map_err(|e| shape_error(provider, "embed", &e.to_string()))?;

    let mut out: Vec<Option<Vec<f32>>> = vec![None; expected];
    for item in resp.data {
        if item.index < expected && !item.embedding.is_empty() {
            out[item.index] = Some(item.embedding);
        }
    }
    Ok(out)
}

/// Decode a chat response into its text content.
pub fn parse_chat(provider: &Provider, value: serde_json::Value) -> Result<String> {
    match provider.kind {
        ProviderKind::Gemini => {
            let resp: GeminiResponse = serde_json::from_value(value)
                .map_err(|e| shape_error(provider, "generate", &e.to_string()))?;
            let text = resp
                .candidates
                .into_iter()
                .next()
                .map(|c| {
                    c.content
                        .parts
                        .into_iter()
                        .map(|p| p.text)
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default();
            if text.is_empty() {
                return Err(shape_error(provider, "generate", "no candidates"));
            }
            Ok(text)
        }
        _ => {
            let resp: ChatResponse = serde_json::from_value(value)
                .map_err(|e| shape_error(provider, "generate", &e.to_string()))?;
            resp.choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .ok_or_else(|| shape_error(provider, "generate", "no choices"))
        }
    }
}

/// Decode a dedicated rerank response into `(index, score)` pairs,
/// out-of-range indices dropped.
pub fn parse_rerank(
    provider: &Provider,
    value: serde_json::Value,
    candidate_count: usize,
) -> Result<Vec<(usize, f64)>> {
    let results = match provider.kind {
        ProviderKind::Dashscope => {
            let resp: DashscopeRerankResponse = serde_json::from_value(value)
                .map_err(|e| shape_error(provider, "rerank", &e.to_string()))?;
            resp.output.results
        }
        _ => {
            let resp: RerankResponse = serde_json::from_value(value)
                .map_err(|e| shape_error(provider, "rerank", &e.to_string()))?;
            resp.results
        }
    };
    Ok(results
        .into_iter()
        .filter(|r| r.index < candidate_count)
        .map(|r| (r.index, r.relevance_score))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(kind: ProviderKind) -> Provider {
        Provider {
            kind,
            name: "test",
            base_url: "https://api.example.com/v1".into(),
            api_key: "k".into(),
            embed_model: "embed-model".into(),
            chat_model: "chat-model".into(),
            rerank_model: "rerank-model".into(),
        }
    }

    #[test]
    fn embed_request_shape() {
        let p = provider(ProviderKind::Siliconflow);
        let (url, headers, body) = p.embed_request(&["a".into(), "b".into()]);
        assert_eq!(url, "https://api.example.com/v1/embeddings");
        assert_eq!(headers[0].1, "Bearer k");
        assert_eq!(body["input"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn rerank_top_n_tracks_candidate_count() {
        let p = provider(ProviderKind::Siliconflow);
        let docs: Vec<String> = (0..7).map(|i| format!("d{i}")).collect();
        let (_, _, body) = p.rerank_request("q", &docs);
        assert_eq!(body["top_n"], 7);

        let p = provider(ProviderKind::Dashscope);
        let (url, _, body) = p.rerank_request("q", &docs);
        assert!(url.ends_with("/services/rerank/text-rerank/text-rerank"));
        assert_eq!(body["parameters"]["top_n"], 7);
    }

    #[test]
    fn gemini_chat_request_embeds_key_in_url() {
        let p = provider(ProviderKind::Gemini);
        let (url, headers, body) = p.chat_request("sys", "user");
        assert!(url.contains(":generateContent?key=k"));
        assert!(headers.is_empty());
        assert_eq!(body["contents"][0]["parts"][0]["text"], "user");
    }

    #[test]
    fn embeddings_parse_preserves_order_with_null_slots() {
        let p = provider(ProviderKind::OpenAiCompat);
        let value = serde_json::json!({
            "data": [
                { "index": 2, "embedding": [0.3] },
                { "index": 0, "embedding": [0.1] },
            ]
        });
        let out = parse_embeddings(&p, value, 3).unwrap();
        assert_eq!(out[0].as_deref(), Some(&[0.1f32][..]));
        assert!(out[1].is_none(), "missing slot maps to None");
        assert_eq!(out[2].as_deref(), Some(&[0.3f32][..]));
    }

    #[test]
    fn embeddings_parse_rejects_garbage() {
        let p = provider(ProviderKind::OpenAiCompat);
        let err = parse_embeddings(&p, serde_json::json!({"nope": 1}), 1).unwrap_err();
        assert!(matches!(err, QmdError::Provider { .. }));
    }

    #[test]
    fn chat_parse_openai_and_gemini() {
        let p = provider(ProviderKind::OpenAiCompat);
        let value = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "hello" } }]
        });
        assert_eq!(parse_chat(&p, value).unwrap(), "hello");

        let p = provider(ProviderKind::Gemini);
        let value = serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "hi " }, { "text": "there" }] } }]
        });
        assert_eq!(parse_chat(&p, value).unwrap(), "hi there");
    }

    #[test]
    fn rerank_parse_filters_out_of_range() {
        let p = provider(ProviderKind::Siliconflow);
        let value = serde_json::json!({
            "results": [
                { "index": 0, "relevance_score": 0.9 },
                { "index": 5, "relevance_score": 0.8 },
            ]
        });
        let out = parse_rerank(&p, value, 2).unwrap();
        assert_eq!(out, vec![(0, 0.9)]);
    }

    #[test]
    fn dashscope_rerank_parse() {
        let p = provider(ProviderKind::Dashscope);
        let value = serde_json::json!({
            "output": { "results": [{ "index": 1, "relevance_score": 0.7 }] }
        });
        let out = parse_rerank(&p, value, 2).unwrap();
        assert_eq!(out, vec![(1, 0.7)]);
    }
}
