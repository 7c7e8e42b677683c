//! Content-store sink: creates a published post over the store's HTTP API.

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;

use super::{Destination, PublishPayload, Sink};
use crate::error::{PipelineError, PipelineResult};
use crate::ingest::{normalize_text, truncate_chars};

pub const EXCERPT_CHARS: usize = 200;
const SLUG_MAX_CHARS: usize = 80;

#[derive(Clone)]
pub struct ContentStoreSink {
    client: Client,
    base_url: String,
    api_token: String,
    /// Public site URL; processed images are referenced relative to it.
    site_url: Option<String>,
    /// Local media root, stripped from image paths to build public paths.
    media_root: Option<std::path::PathBuf>,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct NewPost<'a> {
    title: &'a str,
    slug: String,
    content: &'a str,
    excerpt: String,
    keywords: &'a [String],
    category: &'a str,
    image: Option<String>,
    video_url: Option<&'a str>,
    source_url: &'a str,
    status: &'static str,
    published_at: Option<String>,
}

impl ContentStoreSink {
    pub fn new(client: Client, base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: api_token.into(),
            site_url: None,
            media_root: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_site_url(mut self, site_url: impl Into<String>) -> Self {
        self.site_url = Some(site_url.into().trim_end_matches('/').to_string());
        self
    }

    pub fn with_media_root(mut self, root: impl Into<std::path::PathBuf>) -> Self {
        self.media_root = Some(root.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    /// `/images/unified/x.jpg` style path (or absolute URL when a site URL is set).
    fn public_image(&self, path: &std::path::Path) -> String {
        let rel = self
            .media_root
            .as_deref()
            .and_then(|root| path.strip_prefix(root).ok())
            .unwrap_or(path);
        let rel = rel.to_string_lossy().replace('\\', "/");
        let rel = format!("/{}", rel.trim_start_matches('/'));
        match &self.site_url {
            Some(site) => format!("{site}{rel}"),
            None => rel,
        }
    }

    fn fail(&self, msg: impl Into<String>) -> PipelineError {
        PipelineError::publish(Destination::Website, msg)
    }
}

/// Lowercase, letters/digits kept (any script), everything else folded to `-`.
pub fn slugify(title: &str) -> String {
    let mut out = String::new();
    let mut dash = false;
    for ch in title.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    let out = truncate_chars(out.trim_end_matches('-'), SLUG_MAX_CHARS);
    out.trim_end_matches('-').to_string()
}

/// Plain-text excerpt of at most [`EXCERPT_CHARS`] chars.
pub fn excerpt(html: &str) -> String {
    let text = normalize_text(html);
    if text.chars().count() <= EXCERPT_CHARS {
        text
    } else {
        format!("{}…", truncate_chars(&text, EXCERPT_CHARS - 1).trim_end())
    }
}

fn id_from(v: &serde_json::Value) -> Option<String> {
    let id = v.get("id").or_else(|| v.pointer("/data/id"))?;
    match id {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait::async_trait]
impl Sink for ContentStoreSink {
    fn destination(&self) -> Destination {
        Destination::Website
    }

    async fn publish(&self, payload: &PublishPayload<'_>) -> PipelineResult<String> {
        let draft = payload.draft;
        let post = NewPost {
            title: &draft.title,
            slug: slugify(&draft.title),
            content: &draft.text,
            excerpt: excerpt(&draft.text),
            keywords: &draft.keywords,
            category: &payload.item.category,
            image: payload.image_path.map(|p| self.public_image(p)),
            video_url: payload.video_url,
            source_url: &payload.item.link,
            status: "published",
            published_at: payload.item.published_at.map(|t| t.to_rfc3339()),
        };

        let rsp = self
            .client
            .post(format!("{}/api/posts", self.base_url))
            .bearer_auth(&self.api_token)
            .timeout(self.timeout)
            .json(&post)
            .send()
            .await?;
        let status = rsp.status();
        let body: serde_json::Value = rsp.json().await.unwrap_or(serde_json::Value::Null);

        if !status.is_success() {
            let msg = body
                .get("error")
                .or_else(|| body.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(self.fail(msg));
        }
        id_from(&body).ok_or_else(|| self.fail("response carried no post id"))
    }
}
