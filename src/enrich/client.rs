//! AI client: provider abstraction + daily call limit.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ai::EnrichmentConfig;

/// One chat-style request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    /// Ask the provider for a JSON object response.
    pub json: bool,
}

/// Trait object used by the enricher and tests.
pub trait AiClient: Send + Sync {
    /// Raw completion text, or `None` on any failure/limit.
    fn complete<'a>(
        &'a self,
        prompt: &'a Prompt,
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>>;
    fn provider_name(&self) -> &'static str;
}

pub type DynAiClient = Arc<dyn AiClient>;

/// Build a client for the configured provider.
///
/// * `enabled = false` or provider `disabled` -> [`DisabledClient`]
/// * `mock` -> deterministic [`MockProvider`] behind the daily limit
/// * `openai` -> [`OpenAiProvider`] behind the daily limit
pub fn build_client(cfg: &EnrichmentConfig) -> anyhow::Result<DynAiClient> {
    if !cfg.enabled {
        return Ok(Arc::new(DisabledClient));
    }
    match cfg.provider.as_str() {
        "openai" => {
            let provider = OpenAiProvider::new(&cfg.api_key, &cfg.model, &cfg.api_base)?;
            Ok(Arc::new(DailyLimited::new(provider, cfg.daily_limit)))
        }
        "mock" => Ok(Arc::new(DailyLimited::new(
            MockProvider::default(),
            cfg.daily_limit,
        ))),
        _ => Ok(Arc::new(DisabledClient)),
    }
}

// ------------------------------------------------------------
// Provider abstraction + concrete providers
// ------------------------------------------------------------

/// Low-level provider doing the real remote call.
pub trait Provider: Send + Sync + 'static {
    fn fetch<'a>(
        &'a self,
        prompt: &'a Prompt,
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>>;
    fn name(&self) -> &'static str;
}

/// OpenAI Chat Completions.
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAiProvider {
    pub fn new(api_key: &str, model: &str, api_base: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("news-relay/0.1")
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(45))
            .build()
            .context("building enrichment http client")?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
            endpoint: format!("{}/chat/completions", api_base.trim_end_matches('/')),
        })
    }
}

impl Provider for OpenAiProvider {
    fn fetch<'a>(
        &'a self,
        prompt: &'a Prompt,
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>> {
        Box::pin(async move {
            if self.api_key.is_empty() {
                return None;
            }

            #[derive(Serialize)]
            struct Msg<'a> {
                role: &'a str,
                content: &'a str,
            }
            #[derive(Serialize)]
            struct ResponseFormat {
                #[serde(rename = "type")]
                kind: &'static str,
            }
            #[derive(Serialize)]
            struct Req<'a> {
                model: &'a str,
                messages: Vec<Msg<'a>>,
                temperature: f32,
                max_tokens: u32,
                #[serde(skip_serializing_if = "Option::is_none")]
                response_format: Option<ResponseFormat>,
            }
            #[derive(Deserialize)]
            struct Resp {
                choices: Vec<Choice>,
            }
            #[derive(Deserialize)]
            struct Choice {
                message: ChoiceMsg,
            }
            #[derive(Deserialize)]
            struct ChoiceMsg {
                content: Option<String>,
            }

            let req = Req {
                model: &self.model,
                messages: vec![
                    Msg {
                        role: "system",
                        content: &prompt.system,
                    },
                    Msg {
                        role: "user",
                        content: &prompt.user,
                    },
                ],
                temperature: 0.4,
                max_tokens: prompt.max_tokens,
                response_format: prompt.json.then_some(ResponseFormat {
                    kind: "json_object",
                }),
            };

            let resp = match self
                .http
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&req)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(target: "enrich", error = %e, "openai request failed");
                    return None;
                }
            };
            if !resp.status().is_success() {
                tracing::warn!(target: "enrich", status = %resp.status(), "openai returned an error");
                return None;
            }
            let body: Resp = resp.json().await.ok()?;
            body.choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Returns `None` always; used when enrichment is disabled.
pub struct DisabledClient;

impl AiClient for DisabledClient {
    fn complete<'a>(
        &'a self,
        _prompt: &'a Prompt,
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>> {
        Box::pin(async { None })
    }
    fn provider_name(&self) -> &'static str {
        "disabled"
    }
}

/// Deterministic provider for local runs: echoes a fixed response, or a
/// generic JSON document built from the prompt when none is set.
#[derive(Clone, Default)]
pub struct MockProvider {
    pub fixed: Option<String>,
}

impl Provider for MockProvider {
    fn fetch<'a>(
        &'a self,
        prompt: &'a Prompt,
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>> {
        let out = match &self.fixed {
            Some(s) => s.clone(),
            None if prompt.json => serde_json::json!({
                "telegram_summary": "Mock summary.",
                "website_title": "Mock title",
                "website_content": "<p>Mock content.</p>",
                "seo_keywords": ["mock", "news"],
                "title": "Mock title",
                "content": "<p>Mock content.</p>",
                "keywords": ["mock", "news"],
            })
            .to_string(),
            None => "Mock summary.".to_string(),
        };
        Box::pin(async move { Some(out) })
    }
    fn name(&self) -> &'static str {
        "mock"
    }
}

// ------------------------------------------------------------
// Daily limit wrapper
// ------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct DailyCounter {
    day: NaiveDate,
    count: u32,
}

impl DailyCounter {
    fn today() -> Self {
        Self {
            day: Utc::now().date_naive(),
            count: 0,
        }
    }
}

/// Counts successful provider calls per UTC day and refuses calls beyond the limit.
pub struct DailyLimited<P: Provider> {
    inner: P,
    limit: u32,
    counter: Mutex<DailyCounter>,
}

impl<P: Provider> DailyLimited<P> {
    pub fn new(inner: P, limit: u32) -> Self {
        Self {
            inner,
            limit,
            counter: Mutex::new(DailyCounter::today()),
        }
    }

    fn with_counter<T>(&self, f: impl FnOnce(&mut DailyCounter) -> T) -> T {
        let mut g = match self.counter.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        };
        if g.day != Utc::now().date_naive() {
            *g = DailyCounter::today();
        }
        f(&mut g)
    }

    async fn complete_impl(&self, prompt: &Prompt) -> Option<String> {
        if self.with_counter(|c| c.count >= self.limit) {
            tracing::warn!(target: "enrich", limit = self.limit, "daily enrichment limit reached");
            metrics::counter!("enrich_limited_total").increment(1);
            return None;
        }
        let out = self.inner.fetch(prompt).await?;
        self.with_counter(|c| c.count = c.count.saturating_add(1));
        metrics::counter!("enrich_calls_total", "provider" => self.inner.name()).increment(1);
        Some(out)
    }
}

impl<P: Provider> AiClient for DailyLimited<P> {
    fn complete<'a>(
        &'a self,
        prompt: &'a Prompt,
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>> {
        Box::pin(self.complete_impl(prompt))
    }
    fn provider_name(&self) -> &'static str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt() -> Prompt {
        Prompt {
            system: "s".into(),
            user: "u".into(),
            max_tokens: 10,
            json: false,
        }
    }

    #[tokio::test]
    async fn limit_stops_calls_for_the_day() {
        let client = DailyLimited::new(
            MockProvider {
                fixed: Some("ok".into()),
            },
            2,
        );
        let p = prompt();
        assert_eq!(client.complete(&p).await.as_deref(), Some("ok"));
        assert_eq!(client.complete(&p).await.as_deref(), Some("ok"));
        assert_eq!(client.complete(&p).await, None);
    }

    #[tokio::test]
    async fn disabled_config_builds_disabled_client() {
        let cfg = EnrichmentConfig::default();
        let client = build_client(&cfg).unwrap();
        assert_eq!(client.provider_name(), "disabled");
        assert_eq!(client.complete(&prompt()).await, None);
    }
}
