//! AI enrichment: summaries, titles, SEO keywords and HTML cleaning.
//!
//! Every entry point returns `Option`; `None` means "use the raw text".

pub mod client;

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

pub use client::{build_client, AiClient, DisabledClient, DynAiClient, MockProvider, Prompt};

use crate::dispatch::{Destination, DestinationSet};
use crate::ingest::truncate_chars;
use crate::ingest::types::CanonicalItem;

/// Body chars sent to the model.
const PROMPT_BODY_CHARS: usize = 4000;
const RAW_TELEGRAM_CHARS: usize = 700;
const FALLBACK_KEYWORDS: usize = 5;

/// Destination-ready text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    /// Plain-text title.
    pub title: String,
    /// HTML cleaned for the destination.
    pub text: String,
    pub keywords: Vec<String>,
    /// Produced by the model rather than the raw item.
    pub enriched: bool,
}

impl Draft {
    /// Fallback built from the item itself.
    pub fn raw(d: Destination, item: &CanonicalItem) -> Self {
        let text = match d {
            Destination::Telegram => {
                if let Some(summary) = item.summary.as_deref().filter(|s| !s.trim().is_empty()) {
                    clean_telegram_html(summary)
                } else if item.body == item.title {
                    String::new()
                } else {
                    html_escape::encode_text(&truncate_chars(&item.body, RAW_TELEGRAM_CHARS))
                        .into_owned()
                }
            }
            Destination::Website => paragraphs_html(&item.body),
        };
        let keywords = if item.keywords.is_empty() {
            fallback_keywords(&item.title, &item.body)
        } else {
            item.keywords.clone()
        };
        Self {
            title: item.title.clone(),
            text,
            keywords,
            enriched: false,
        }
    }
}

/// Output of a single combined enrichment call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CombinedDraft {
    #[serde(default)]
    pub telegram_summary: String,
    #[serde(default)]
    pub website_title: String,
    #[serde(default)]
    pub website_content: String,
    #[serde(default, deserialize_with = "keywords_de")]
    pub seo_keywords: Vec<String>,
}

impl CombinedDraft {
    /// Split into per-destination drafts; empty parts are left out so the
    /// caller falls back to the raw item for them.
    pub fn into_drafts(
        self,
        pending: DestinationSet,
        item: &CanonicalItem,
    ) -> HashMap<Destination, Draft> {
        let keywords = if self.seo_keywords.is_empty() {
            fallback_keywords(&item.title, &item.body)
        } else {
            self.seo_keywords
        };
        let mut out = HashMap::new();
        if pending.telegram && !self.telegram_summary.trim().is_empty() {
            out.insert(
                Destination::Telegram,
                Draft {
                    title: item.title.clone(),
                    text: clean_telegram_html(&self.telegram_summary),
                    keywords: keywords.clone(),
                    enriched: true,
                },
            );
        }
        if pending.website && !self.website_content.trim().is_empty() {
            let title = crate::ingest::normalize_text(&self.website_title);
            out.insert(
                Destination::Website,
                Draft {
                    title: if title.is_empty() { item.title.clone() } else { title },
                    text: clean_website_html(&self.website_content),
                    keywords,
                    enriched: true,
                },
            );
        }
        out
    }
}

/// Accepts `["a","b"]` or `"a, b"`.
fn keywords_de<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Kw {
        List(Vec<String>),
        Csv(String),
    }
    let raw = match Option::<Kw>::deserialize(d)? {
        Some(Kw::List(v)) => v,
        Some(Kw::Csv(s)) => s.split([',', '،']).map(str::to_string).collect(),
        None => Vec::new(),
    };
    Ok(raw
        .into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect())
}

#[derive(Debug, Deserialize)]
struct WebsiteJson {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default, deserialize_with = "keywords_de")]
    keywords: Vec<String>,
}

pub struct Enricher {
    client: DynAiClient,
}

impl Enricher {
    pub fn new(client: DynAiClient) -> Self {
        Self { client }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(DisabledClient))
    }

    pub fn provider_name(&self) -> &'static str {
        self.client.provider_name()
    }

    /// One call producing text for every destination.
    pub async fn combined(&self, item: &CanonicalItem) -> Option<CombinedDraft> {
        let prompt = Prompt {
            system: "You are a news editor. Reply with a single JSON object only.".into(),
            user: format!(
                "Rewrite the news item below for two outlets, in the language of the article.\n\
                 Return JSON with keys:\n\
                 - telegram_summary: 2-4 sentence summary, may use <b> and <i>\n\
                 - website_title: engaging headline, plain text\n\
                 - website_content: full article in HTML using <p>, <h2>, <ul>, <li>, <strong>\n\
                 - seo_keywords: array of 5 keywords\n\n\
                 Category: {}\nTitle: {}\n\n{}",
                item.category,
                item.title,
                truncate_chars(&item.body, PROMPT_BODY_CHARS)
            ),
            max_tokens: 1800,
            json: true,
        };
        let raw = self.client.complete(&prompt).await?;
        let parsed: Option<CombinedDraft> =
            extract_json(&raw).and_then(|v| serde_json::from_value(v).ok());
        if parsed.is_none() {
            tracing::warn!(target: "enrich", provider = self.provider_name(), "combined response was not usable JSON");
        }
        parsed
    }

    /// One call for a single destination.
    pub async fn for_destination(&self, d: Destination, item: &CanonicalItem) -> Option<Draft> {
        let body = truncate_chars(&item.body, PROMPT_BODY_CHARS);
        match d {
            Destination::Telegram => {
                let prompt = Prompt {
                    system: "You are a news editor writing for a Telegram channel.".into(),
                    user: format!(
                        "Summarize the news below in 2-4 short sentences, in the language of the article. \
                         You may use <b> and <i>. Reply with the summary only.\n\nTitle: {}\n\n{}",
                        item.title, body
                    ),
                    max_tokens: 400,
                    json: false,
                };
                let raw = self.client.complete(&prompt).await?;
                let text = clean_telegram_html(&raw);
                (!text.is_empty()).then(|| Draft {
                    title: item.title.clone(),
                    text,
                    keywords: fallback_keywords(&item.title, &item.body),
                    enriched: true,
                })
            }
            Destination::Website => {
                let prompt = Prompt {
                    system: "You are a news editor. Reply with a single JSON object only.".into(),
                    user: format!(
                        "Rewrite the news below as a website article in the language of the article. \
                         Return JSON with keys title (plain text), content (HTML using <p>, <h2>, <ul>, <li>, <strong>) \
                         and keywords (array of 5).\n\nCategory: {}\nTitle: {}\n\n{}",
                        item.category, item.title, body
                    ),
                    max_tokens: 1500,
                    json: true,
                };
                let raw = self.client.complete(&prompt).await?;
                let parsed: WebsiteJson =
                    serde_json::from_value(extract_json(&raw)?).ok()?;
                let text = clean_website_html(&parsed.content);
                if text.is_empty() {
                    return None;
                }
                let title = crate::ingest::normalize_text(&parsed.title);
                Some(Draft {
                    title: if title.is_empty() { item.title.clone() } else { title },
                    text,
                    keywords: if parsed.keywords.is_empty() {
                        fallback_keywords(&item.title, &item.body)
                    } else {
                        parsed.keywords
                    },
                    enriched: true,
                })
            }
        }
    }
}

// ------------------------------------------------------------
// JSON + text helpers
// ------------------------------------------------------------

/// Direct parse, then fenced block, then first `{` .. last `}`.
pub fn extract_json(s: &str) -> Option<serde_json::Value> {
    let s = s.trim();
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(s) {
        return v.is_object().then_some(v);
    }
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(&s[start..=end])
        .ok()
        .filter(|v| v.is_object())
}

/// First distinct words of at least three characters.
pub fn fallback_keywords(title: &str, body: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for word in format!("{title} {body}").split(|c: char| !c.is_alphanumeric()) {
        if word.chars().count() < 3 {
            continue;
        }
        let w = word.to_lowercase();
        if !out.contains(&w) {
            out.push(w);
        }
        if out.len() == FALLBACK_KEYWORDS {
            break;
        }
    }
    out
}

fn paragraphs_html(body: &str) -> String {
    body.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{}</p>", html_escape::encode_text(p)))
        .collect::<Vec<_>>()
        .join("\n")
}

static RE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)<(/?)([a-zA-Z][a-zA-Z0-9]*)([^>]*)>"#).unwrap());
static RE_SCRIPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style|iframe)[^>]*>.*?</(script|style|iframe)>").unwrap());
static RE_HREF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)href\s*=\s*["']([^"']+)["']"#).unwrap());
static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn clean_with(html: &str, allowed: &[&str], map: impl Fn(&str, bool) -> Option<&'static str>) -> String {
    let no_scripts = RE_SCRIPT.replace_all(html, "");
    let out = RE_TAG.replace_all(&no_scripts, |caps: &regex::Captures<'_>| {
        let closing = !caps[1].is_empty();
        let name = caps[2].to_ascii_lowercase();
        if let Some(rep) = map(&name, closing) {
            return rep.to_string();
        }
        if !allowed.contains(&name.as_str()) {
            return String::new();
        }
        if name == "a" && !closing {
            return match RE_HREF.captures(&caps[3]) {
                Some(h) if h[1].starts_with("http") => format!("<a href=\"{}\">", &h[1]),
                _ => "<a>".to_string(),
            };
        }
        format!("<{}{}>", if closing { "/" } else { "" }, name)
    });
    RE_BLANK_LINES.replace_all(out.trim(), "\n\n").into_owned()
}

/// Reduce to the tag subset the messaging API renders in HTML mode.
pub fn clean_telegram_html(html: &str) -> String {
    const ALLOWED: &[&str] = &["b", "strong", "i", "em", "u", "s", "a", "code", "pre"];
    clean_with(html, ALLOWED, |name, closing| match (name, closing) {
        ("br", _) => Some("\n"),
        ("p", true) | ("div", true) => Some("\n\n"),
        ("li", false) => Some("• "),
        ("li", true) => Some("\n"),
        _ => None,
    })
}

/// Allow-list for content-store HTML.
pub fn clean_website_html(html: &str) -> String {
    const ALLOWED: &[&str] = &[
        "p", "h2", "h3", "h4", "ul", "ol", "li", "strong", "em", "b", "i", "a", "blockquote", "br",
    ];
    clean_with(html, ALLOWED, |_, _| None)
}
