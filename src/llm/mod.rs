//! Remote LLM gateway: provider-agnostic access to embedding, query
//! expansion, and reranking.
//!
//! The gateway owns the HTTP clients and per-provider health state; nothing
//! else in the crate talks to the network. Operations are routed to at most
//! one provider each, resolved once at construction:
//!
//! | op | forced by | auto-route order |
//! |---|---|---|
//! | embed | `QMD_EMBED_PROVIDER` | siliconflow → openai-compat |
//! | expand | `QMD_QUERY_EXPANSION_PROVIDER` | siliconflow → openai-compat → gemini |
//! | rerank (`llm`) | `QMD_RERANK_PROVIDER` | siliconflow → openai-compat → gemini |
//! | rerank (`rerank`) | `QMD_RERANK_PROVIDER` | siliconflow → dashscope |
//!
//! Best-effort operations (expansion) degrade to a deterministic fallback
//! when the provider fails or its circuit is open; required operations
//! (embed, rerank) surface the error.

mod breaker;
mod http;
mod prompts;
mod providers;

pub use breaker::{CircuitBreaker, FAILURE_THRESHOLD};
pub use prompts::{
    cache_key, fallback_expansion, parse_expansion, parse_llm_rerank, render_rerank_prompt,
    LlmRerankHit, QueryKind, Queryable, DEFAULT_RERANK_PROMPT, EXPANSION_PROMPT,
};
pub use providers::{Provider, ProviderKind};

use std::time::Duration;

use crate::config::{Config, RerankMode};
use crate::error::{QmdError, Result};

/// Expansion cache entries live for a week.
pub const EXPANSION_CACHE_TTL_SECS: i64 = 7 * 24 * 3600;

/// A candidate sent to the reranker.
#[derive(Debug, Clone)]
pub struct RerankDoc {
    /// Caller identifier, e.g. `qmd://notes/pasta.md::0`.
    pub key: String,
    pub text: String,
}

/// A reranked candidate, re-keyed to the caller's identifier.
#[derive(Debug, Clone)]
pub struct RerankScore {
    pub key: String,
    pub score: f64,
    /// Present only in LLM-as-reranker mode when the model extracted text.
    pub extract: Option<String>,
}

struct Routes {
    embed: Option<usize>,
    expand: Option<usize>,
    rerank: Option<usize>,
}

pub struct Gateway {
    providers: Vec<Provider>,
    clients: Vec<reqwest::Client>,
    routes: Routes,
    breaker: CircuitBreaker,
    rerank_mode: RerankMode,
    rerank_prompt: String,
    timeout_override: Option<Duration>,
}

impl Gateway {
    pub fn new(config: &Config) -> Self {
        let providers = Provider::resolve_all();
        Self::with_providers(config, providers)
    }

    /// Construction seam: tests inject a provider list pointing at stubs.
    pub fn with_providers(config: &Config, providers: Vec<Provider>) -> Self {
        let rerank_capable: fn(&Provider) -> bool = match config.rerank_mode {
            RerankMode::Llm => Provider::can_chat,
            RerankMode::Rerank => Provider::can_rerank_dedicated,
        };
        let routes = Routes {
            embed: route(
                &providers,
                std::env::var("QMD_EMBED_PROVIDER").ok().as_deref(),
                |p| p.can_embed(),
            ),
            expand: route(
                &providers,
                std::env::var("QMD_QUERY_EXPANSION_PROVIDER").ok().as_deref(),
                |p| p.can_expand(),
            ),
            rerank: route(
                &providers,
                std::env::var("QMD_RERANK_PROVIDER").ok().as_deref(),
                rerank_capable,
            ),
        };

        let clients = providers
            .iter()
            .map(|_| reqwest::Client::new())
            .collect();

        let rerank_prompt = std::fs::read_to_string(config.rerank_prompt_path())
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_RERANK_PROMPT.to_string());

        Self {
            providers,
            clients,
            routes,
            breaker: CircuitBreaker::new(Duration::from_millis(config.breaker_cooldown_ms)),
            rerank_mode: config.rerank_mode,
            rerank_prompt,
            timeout_override: config.timeout_ms.map(Duration::from_millis),
        }
    }

    fn op_timeout(&self, op: &'static str) -> Duration {
        if let Some(t) = self.timeout_override {
            return t;
        }
        match op {
            "embed" => Duration::from_secs(30),
            "rerank" => Duration::from_secs(15),
            _ => Duration::from_secs(60),
        }
    }

    fn routed(&self, idx: Option<usize>) -> Option<(&Provider, &reqwest::Client)> {
        idx.map(|i| (&self.providers[i], &self.clients[i]))
    }

    pub fn embed_provider(&self) -> Option<&Provider> {
        self.routed(self.routes.embed).map(|(p, _)| p)
    }

    pub fn expand_provider(&self) -> Option<&Provider> {
        self.routed(self.routes.expand).map(|(p, _)| p)
    }

    pub fn rerank_provider(&self) -> Option<&Provider> {
        self.routed(self.routes.rerank).map(|(p, _)| p)
    }

    /// `(operation, provider name)` pairs for `doctor` output.
    pub fn describe_routes(&self) -> Vec<(&'static str, Option<&'static str>)> {
        vec![
            ("embed", self.embed_provider().map(|p| p.name)),
            ("query-expansion", self.expand_provider().map(|p| p.name)),
            ("rerank", self.rerank_provider().map(|p| p.name)),
        ]
    }

    // ============ Embedding ============

    /// Embed one batch of texts, preserving order. Individual failures map
    /// to `None` slots rather than failing the batch.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let (provider, client) = self.routed(self.routes.embed).ok_or_else(|| {
            QmdError::Config("no embedding provider configured (set SILICONFLOW_API_KEY or OPENAI_API_KEY)".into())
        })?;
        self.breaker.check(provider.name)?;

        let (url, headers, body) = provider.embed_request(texts);
        let result = http::post_json(
            client,
            provider.name,
            "embed",
            &url,
            &headers,
            &body,
            self.op_timeout("embed"),
        )
        .await;

        match result {
            Ok(value) => {
                self.breaker.record_success(provider.name);
                providers::parse_embeddings(provider, value, texts.len())
            }
            Err(err) => {
                self.breaker.record_failure(provider.name);
                Err(err)
            }
        }
    }

    /// Embed a single query string.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let texts = [text.to_string()];
        let mut out = self.embed_batch(&texts).await?;
        out.pop().flatten().ok_or_else(|| QmdError::Provider {
            provider: self
                .embed_provider()
                .map(|p| p.name.to_string())
                .unwrap_or_default(),
            op: "embed",
            status: None,
            message: "empty embedding response".into(),
        })
    }

    // ============ Query expansion ============

    /// Stable cache key for an expansion call, if a provider is routed.
    pub fn expand_cache_key(&self, query: &str, context: Option<&str>) -> Option<String> {
        let provider = self.expand_provider()?;
        Some(cache_key(
            "expand",
            provider.name,
            &provider.chat_model,
            &[query, context.unwrap_or("")],
        ))
    }

    /// Raw expansion round-trip (uncached). Fails when no provider is
    /// routed, the circuit is open, or the call itself fails.
    pub async fn expand_query_raw(&self, query: &str, context: Option<&str>) -> Result<String> {
        let (provider, client) = self.routed(self.routes.expand).ok_or_else(|| {
            QmdError::Config("no query-expansion provider configured".into())
        })?;
        self.breaker.check(provider.name)?;

        let user = prompts::render_expansion_input(query, context);
        let (url, headers, body) = provider.chat_request(EXPANSION_PROMPT, &user);
        let result = http::post_json(
            client,
            provider.name,
            "generate",
            &url,
            &headers,
            &body,
            self.op_timeout("generate"),
        )
        .await;

        match result {
            Ok(value) => {
                self.breaker.record_success(provider.name);
                providers::parse_chat(provider, value)
            }
            Err(err) => {
                self.breaker.record_failure(provider.name);
                Err(err)
            }
        }
    }

    /// Expand a query, degrading to the deterministic fallback on any
    /// failure. Never errors.
    pub async fn expand_query(
        &self,
        query: &str,
        include_lexical: bool,
        context: Option<&str>,
    ) -> Vec<Queryable> {
        match self.expand_query_raw(query, context).await {
            Ok(raw) => {
                let parsed = parse_expansion(&raw);
                if parsed.is_empty() {
                    tracing::debug!("expansion reply unparseable, using fallback");
                    fallback_expansion(query, include_lexical)
                } else {
                    parsed
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "expansion degraded to fallback");
                fallback_expansion(query, include_lexical)
            }
        }
    }

    // ============ Rerank ============

    /// Rerank candidates, re-keyed to the caller's identifiers. Required
    /// operation: circuit-open and provider failures surface to the caller,
    /// which degrades to fused scores.
    pub async fn rerank(&self, query: &str, docs: &[RerankDoc]) -> Result<Vec<RerankScore>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let (provider, client) = self
            .routed(self.routes.rerank)
            .ok_or_else(|| QmdError::Config("no rerank provider configured".into()))?;
        self.breaker.check(provider.name)?;

        let texts: Vec<String> = docs.iter().map(|d| d.text.clone()).collect();
        let result = match self.rerank_mode {
            RerankMode::Rerank => {
                let (url, headers, body) = provider.rerank_request(query, &texts);
                match http::post_json(
                    client,
                    provider.name,
                    "rerank",
                    &url,
                    &headers,
                    &body,
                    self.op_timeout("rerank"),
                )
                .await
                {
                    Ok(value) => providers::parse_rerank(provider, value, docs.len()).map(|pairs| {
                        pairs
                            .into_iter()
                            .map(|(index, score)| RerankScore {
                                key: docs[index].key.clone(),
                                score,
                                extract: None,
                            })
                            .collect()
                    }),
                    Err(err) => Err(err),
                }
            }
            RerankMode::Llm => {
                let user = render_rerank_prompt(&self.rerank_prompt, query, &texts);
                let system = "Follow the task instructions exactly. Plain text only.";
                let (url, headers, body) = provider.chat_request(system, &user);
                match http::post_json(
                    client,
                    provider.name,
                    "rerank",
                    &url,
                    &headers,
                    &body,
                    self.op_timeout("rerank"),
                )
                .await
                {
                    Ok(value) => providers::parse_chat(provider, value).map(|text| {
                        parse_llm_rerank(&text, docs.len())
                            .into_iter()
                            .map(|hit| RerankScore {
                                key: docs[hit.index].key.clone(),
                                score: hit.score,
                                extract: hit.extract,
                            })
                            .collect()
                    }),
                    Err(err) => Err(err),
                }
            }
        };

        match result {
            Ok(scores) => {
                self.breaker.record_success(provider.name);
                Ok(scores)
            }
            Err(err) => {
                self.breaker.record_failure(provider.name);
                Err(err)
            }
        }
    }

    /// Breaker handle for status output.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

fn route(
    providers: &[Provider],
    forced: Option<&str>,
    capable: impl Fn(&Provider) -> bool,
) -> Option<usize> {
    if let Some(name) = forced {
        match providers.iter().position(|p| p.name == name) {
            Some(i) if capable(&providers[i]) => return Some(i),
            Some(_) => {
                tracing::warn!(provider = name, "forced provider lacks this capability");
                return None;
            }
            None => {
                tracing::warn!(provider = name, "forced provider has no API key, ignoring");
            }
        }
    }
    providers.iter().position(|p| capable(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(kind: ProviderKind, name: &'static str) -> Provider {
        Provider {
            kind,
            name,
            base_url: "https://api.example.com/v1".into(),
            api_key: "k".into(),
            embed_model: "e".into(),
            chat_model: "c".into(),
            rerank_model: "r".into(),
        }
    }

    #[test]
    fn auto_route_prefers_earlier_providers() {
        let providers = vec![
            provider(ProviderKind::Siliconflow, "siliconflow"),
            provider(ProviderKind::OpenAiCompat, "openai-compat"),
            provider(ProviderKind::Dashscope, "dashscope"),
        ];
        assert_eq!(route(&providers, None, |p| p.can_embed()), Some(0));
        assert_eq!(route(&providers, None, |p| p.can_rerank_dedicated()), Some(0));
        assert_eq!(
            route(&providers, Some("openai-compat"), |p| p.can_embed()),
            Some(1)
        );
    }

    #[test]
    fn forced_provider_without_capability_is_rejected() {
        let providers = vec![
            provider(ProviderKind::Dashscope, "dashscope"),
            provider(ProviderKind::Gemini, "gemini"),
        ];
        // dashscope cannot chat; forcing it for expansion yields no route.
        assert_eq!(route(&providers, Some("dashscope"), |p| p.can_expand()), None);
        // An unknown forced name falls back to auto-routing.
        assert_eq!(route(&providers, Some("ghost"), |p| p.can_expand()), Some(1));
    }
}
