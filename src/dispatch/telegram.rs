//! Messaging-channel sink (Telegram Bot API).

use std::path::Path;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::{Destination, PublishPayload, Sink};
use crate::error::{PipelineError, PipelineResult};
use crate::ingest::normalize_text;

pub const CAPTION_LIMIT: usize = 1024;
pub const MESSAGE_LIMIT: usize = 4096;
pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";
/// Upper bound on any single wait between attempts.
pub const MAX_RETRY_WAIT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct TelegramSink {
    client: Client,
    api_base: String,
    bot_token: String,
    channel_id: String,
    timeout: Duration,
    max_retries: u8,
    backoff: Duration,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    result: Option<ApiMessage>,
    description: Option<String>,
    parameters: Option<ApiParameters>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct ApiParameters {
    retry_after: Option<u64>,
}

/// One failed request, with whether it is worth repeating.
struct Failure {
    error: PipelineError,
    retryable: bool,
    retry_after: Option<Duration>,
}

enum Request<'a> {
    Json(serde_json::Value),
    Photo {
        bytes: Vec<u8>,
        file_name: String,
        caption: &'a str,
    },
}

impl TelegramSink {
    pub fn new(client: Client, bot_token: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            client,
            api_base: DEFAULT_API_BASE.to_string(),
            bot_token: bot_token.into(),
            channel_id: channel_id.into(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff: Duration::from_millis(500),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    fn fail(&self, error: impl Into<String>, retryable: bool) -> Failure {
        Failure {
            error: PipelineError::publish(Destination::Telegram, error),
            retryable,
            retry_after: None,
        }
    }

    async fn send_once(&self, method: &str, req: &Request<'_>) -> Result<i64, Failure> {
        let builder = self.client.post(self.endpoint(method)).timeout(self.timeout);
        let builder = match req {
            Request::Json(body) => builder.json(body),
            Request::Photo {
                bytes,
                file_name,
                caption,
            } => {
                let part = Part::bytes(bytes.clone()).file_name(file_name.clone());
                let form = Form::new()
                    .text("chat_id", self.channel_id.clone())
                    .text("caption", caption.to_string())
                    .text("parse_mode", "HTML")
                    .part("photo", part);
                builder.multipart(form)
            }
        };

        let rsp = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                return Err(Failure {
                    error: PipelineError::Network(e.to_string()),
                    retryable: true,
                    retry_after: None,
                })
            }
        };
        let status = rsp.status();
        let body: Option<ApiResponse> = rsp.json().await.ok();

        match body {
            Some(ApiResponse {
                ok: true,
                result: Some(m),
                ..
            }) if status.is_success() => Ok(m.message_id),
            other => {
                let description = other
                    .as_ref()
                    .and_then(|b| b.description.clone())
                    .unwrap_or_else(|| format!("HTTP {status}"));
                let retry_after = other
                    .as_ref()
                    .and_then(|b| b.parameters.as_ref())
                    .and_then(|p| p.retry_after)
                    .map(Duration::from_secs);
                let retryable =
                    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                let mut f = self.fail(description, retryable);
                f.retry_after = retry_after;
                Err(f)
            }
        }
    }

    /// Bounded retry on 429/5xx/network errors with exponential backoff,
    /// honouring `retry_after` when the API sends it.
    async fn call(&self, method: &str, req: Request<'_>) -> PipelineResult<i64> {
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            match self.send_once(method, &req).await {
                Ok(id) => return Ok(id),
                Err(f) if f.retryable && attempt < self.max_retries => {
                    let wait = retry_wait(self.backoff, attempt, f.retry_after);
                    tracing::warn!(target: "dispatch", method, attempt, error = %f.error, wait_ms = wait.as_millis() as u64, "telegram call failed; retrying");
                    tokio::time::sleep(wait).await;
                }
                Err(f) => return Err(f.error),
            }
        }
    }

    async fn send_message(&self, text: &str) -> PipelineResult<i64> {
        self.call(
            "sendMessage",
            Request::Json(json!({
                "chat_id": self.channel_id,
                "text": text,
                "parse_mode": "HTML",
                "disable_web_page_preview": false,
            })),
        )
        .await
    }

    async fn send_photo(&self, path: &Path, caption: &str) -> PipelineResult<i64> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| PipelineError::MediaProcessing(format!("{}: {e}", path.display())))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image.jpg")
            .to_string();
        self.call(
            "sendPhoto",
            Request::Photo {
                bytes,
                file_name,
                caption,
            },
        )
        .await
    }

    async fn send_video(&self, url: &str, caption: &str) -> PipelineResult<i64> {
        self.call(
            "sendVideo",
            Request::Json(json!({
                "chat_id": self.channel_id,
                "video": url,
                "caption": caption,
                "parse_mode": "HTML",
                "supports_streaming": true,
            })),
        )
        .await
    }
}

fn hashtag(word: &str) -> Option<String> {
    let tag: String = word
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() || c == '-' { '_' } else { c })
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    let tag = tag.trim_matches('_');
    (!tag.is_empty()).then(|| format!("#{tag}"))
}

/// Category first, then up to three keywords.
pub fn hashtags(category: &str, keywords: &[String]) -> String {
    let mut tags: Vec<String> = Vec::new();
    for t in std::iter::once(category)
        .chain(keywords.iter().map(String::as_str))
        .filter_map(hashtag)
    {
        if !tags.contains(&t) {
            tags.push(t);
        }
        if tags.len() == 4 {
            break;
        }
    }
    tags.join(" ")
}

/// Escape `plain` char by char until `budget` chars of output are used.
fn escape_within(plain: &str, budget: usize) -> String {
    let mut out = String::new();
    let mut used = 0;
    for ch in plain.chars() {
        let piece: std::borrow::Cow<'_, str> = match ch {
            '&' => "&amp;".into(),
            '<' => "&lt;".into(),
            '>' => "&gt;".into(),
            c => c.to_string().into(),
        };
        let n = piece.chars().count();
        if used + n > budget {
            break;
        }
        out.push_str(&piece);
        used += n;
    }
    out
}

/// `<b>title</b>`, body, hashtags; the body is shortened (as plain text)
/// when the whole thing does not fit in `limit` chars.
pub fn compose(payload: &PublishPayload<'_>, limit: usize) -> String {
    let head = format!("<b>{}</b>", html_escape::encode_text(&payload.draft.title));
    let tail = hashtags(&payload.item.category, &payload.draft.keywords);
    let body = payload.draft.text.trim();

    let join = |body: &str| {
        [head.as_str(), body, tail.as_str()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    let full = join(body);
    if full.chars().count() <= limit {
        return full;
    }

    let fixed = join("").chars().count() + 2 + 1;
    let budget = limit.saturating_sub(fixed);
    let short = escape_within(&normalize_text(body), budget);
    let out = if short.is_empty() {
        join("")
    } else {
        join(&format!("{short}…"))
    };
    if out.chars().count() <= limit {
        out
    } else {
        crate::ingest::truncate_chars(&normalize_text(&out), limit)
    }
}

#[async_trait::async_trait]
impl Sink for TelegramSink {
    fn destination(&self) -> Destination {
        Destination::Telegram
    }

    async fn publish(&self, payload: &PublishPayload<'_>) -> PipelineResult<String> {
        let media_attempt = if let Some(video) = payload.video_url {
            Some(self.send_video(video, &compose(payload, CAPTION_LIMIT)).await)
        } else if let Some(path) = payload.image_path {
            Some(self.send_photo(path, &compose(payload, CAPTION_LIMIT)).await)
        } else {
            None
        };

        let id = match media_attempt {
            Some(Ok(id)) => id,
            Some(Err(e)) => {
                tracing::warn!(target: "dispatch", error = %e, link = %payload.item.link, "media post failed; sending text only");
                self.send_message(&compose(payload, MESSAGE_LIMIT)).await?
            }
            None => self.send_message(&compose(payload, MESSAGE_LIMIT)).await?,
        };
        Ok(id.to_string())
    }
}

/// Wait before the next attempt: the server's `retry_after` when given,
/// otherwise `backoff` doubled per failed attempt. Capped at [`MAX_RETRY_WAIT`].
fn retry_wait(backoff: Duration, attempt: u8, retry_after: Option<Duration>) -> Duration {
    let wait = retry_after.unwrap_or_else(|| {
        let factor = 1u32
            .checked_shl(u32::from(attempt.saturating_sub(1)))
            .unwrap_or(u32::MAX);
        backoff.saturating_mul(factor)
    });
    wait.min(MAX_RETRY_WAIT)
}
