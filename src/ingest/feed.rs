//! Feed Fetcher: RSS 2.0 / Atom over HTTP, optionally enriched by scraping
//! each article page.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use once_cell::sync::Lazy;
use quick_xml::de::from_str;
use regex::Regex;
use serde::Deserialize;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::OffsetDateTime;

use crate::error::{PipelineError, PipelineResult};
use crate::ingest::page::PageScraper;
use crate::ingest::types::{FeedProvider, FeedSource, FetchMode, RawItem};

pub const FEED_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_SCRAPE_DELAY: Duration = Duration::from_secs(2);

const USER_AGENT: &str = "Mozilla/5.0 (compatible; news-relay/0.1; +https://github.com/lumlich/news-relay)";

// ------------------------------------------------------------
// RSS 2.0
// ------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    /// `<content:encoded>`: the full article body, when the feed publishes one.
    /// Element names are matched without their prefix.
    #[serde(rename = "encoded")]
    content: Option<String>,
    enclosure: Option<Enclosure>,
}

#[derive(Debug, Deserialize)]
struct Enclosure {
    #[serde(rename = "@url")]
    url: Option<String>,
    #[serde(rename = "@type")]
    kind: Option<String>,
}

impl Enclosure {
    fn image_url(&self) -> Option<String> {
        let url = self.url.as_deref()?.trim();
        let by_type = self
            .kind
            .as_deref()
            .is_some_and(|t| t.to_ascii_lowercase().starts_with("image/"));
        if by_type || has_image_extension(url) {
            Some(url.to_string())
        } else {
            None
        }
    }
}

// ------------------------------------------------------------
// Atom
// ------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entry: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    title: Option<String>,
    #[serde(rename = "link", default)]
    link: Vec<AtomLink>,
    published: Option<String>,
    updated: Option<String>,
    summary: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
    #[serde(rename = "@type")]
    kind: Option<String>,
}

fn has_image_extension(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    [".jpg", ".jpeg", ".png", ".webp", ".gif"]
        .iter()
        .any(|ext| path.ends_with(ext))
}

fn parse_date(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    let odt = OffsetDateTime::parse(ts, &Rfc2822)
        .or_else(|_| OffsetDateTime::parse(ts, &Rfc3339))
        .ok()?;
    DateTime::from_timestamp(odt.unix_timestamp(), 0)
}

/// Parse an RSS or Atom document. Items keep document order.
pub fn parse_feed(body: &str) -> PipelineResult<Vec<RawItem>> {
    let t0 = std::time::Instant::now();
    let xml = decode_html_entities_for_xml(body);
    let head: String = xml.chars().take(2048).collect::<String>().to_ascii_lowercase();

    let items = if head.contains("<rss") || head.contains("<channel") {
        let rss: Rss = from_str(&xml)
            .map_err(|e| PipelineError::UpstreamFormat(format!("rss: {e}")))?;
        rss.channel
            .item
            .into_iter()
            .map(|it| RawItem {
                image_url: it.enclosure.as_ref().and_then(Enclosure::image_url),
                title: it.title,
                link: it.link.map(|l| l.trim().to_string()),
                published_at: it.pub_date.as_deref().and_then(parse_date),
                description: it.description,
                content: it.content.filter(|c| !c.trim().is_empty()),
                video_url: None,
            })
            .collect()
    } else if head.contains("<feed") {
        let feed: AtomFeed = from_str(&xml)
            .map_err(|e| PipelineError::UpstreamFormat(format!("atom: {e}")))?;
        feed.entry
            .into_iter()
            .map(|e| {
                let link = e
                    .link
                    .iter()
                    .find(|l| l.rel.as_deref().map_or(true, |r| r == "alternate"))
                    .or_else(|| e.link.first())
                    .and_then(|l| l.href.clone());
                let image_url = e
                    .link
                    .iter()
                    .find(|l| {
                        l.rel.as_deref() == Some("enclosure")
                            && l.kind.as_deref().is_some_and(|t| t.starts_with("image/"))
                    })
                    .and_then(|l| l.href.clone());
                RawItem {
                    title: e.title,
                    link,
                    published_at: e
                        .published
                        .as_deref()
                        .or(e.updated.as_deref())
                        .and_then(parse_date),
                    description: e.summary,
                    content: e.content,
                    image_url,
                    video_url: None,
                }
            })
            .collect()
    } else {
        return Err(PipelineError::UpstreamFormat(
            "document is neither RSS nor Atom".into(),
        ));
    };

    histogram!("ingest_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
    Ok(items)
}

/// Most recent first; undated items sort last, keeping their relative order.
pub fn newest_first(mut items: Vec<RawItem>, max_items: usize) -> Vec<RawItem> {
    items.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    items.truncate(max_items);
    items
}

static RE_ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&([A-Za-z][A-Za-z0-9]{1,31});").unwrap());

/// Feeds routinely carry HTML named entities (`&hellip;`, `&nbsp;`) that XML
/// does not define. Decode them to text; keep the five XML entities as they
/// are and turn names HTML does not know into literal text.
fn decode_html_entities_for_xml(s: &str) -> Cow<'_, str> {
    RE_ENTITY.replace_all(s, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        if matches!(name, "amp" | "lt" | "gt" | "quot" | "apos") {
            return caps[0].to_string();
        }
        let decoded = html_escape::decode_html_entities(&caps[0]);
        if decoded == caps[0] {
            format!("&amp;{name};")
        } else {
            html_escape::encode_text(&decoded).into_owned()
        }
    })
}

// ------------------------------------------------------------
// Providers
// ------------------------------------------------------------

/// Live HTTP feed provider.
pub struct HttpFeedProvider {
    client: reqwest::Client,
    timeout: Duration,
    scraper: PageScraper,
    scrape_delay: Duration,
}

impl HttpFeedProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            scraper: PageScraper::new(client.clone()),
            client,
            timeout: FEED_TIMEOUT,
            scrape_delay: DEFAULT_SCRAPE_DELAY,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.scraper = self.scraper.with_timeout(timeout);
        self
    }

    pub fn with_scrape_delay(mut self, delay: Duration) -> Self {
        self.scrape_delay = delay;
        self
    }

    async fn fetch_body(&self, url: &str) -> PipelineResult<String> {
        let rsp = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(
                reqwest::header::ACCEPT,
                "application/rss+xml, application/atom+xml, application/xml;q=0.9, */*;q=0.8",
            )
            .timeout(self.timeout)
            .send()
            .await?;
        if !rsp.status().is_success() {
            return Err(PipelineError::Network(format!("HTTP {}", rsp.status())));
        }
        Ok(rsp.text().await?)
    }

    async fn try_fetch(&self, source: &FeedSource, max_items: usize) -> PipelineResult<Vec<RawItem>> {
        let body = self.fetch_body(&source.url).await?;
        let mut items = newest_first(parse_feed(&body)?, max_items);

        if source.mode == FetchMode::Scrape {
            for (i, item) in items.iter_mut().enumerate() {
                let Some(link) = item.link.clone() else { continue };
                if i > 0 {
                    tokio::time::sleep(self.scrape_delay).await;
                }
                match self.scraper.fetch_article(&link).await {
                    Ok(page) => page.merge_into(item),
                    Err(e) => {
                        tracing::warn!(target: "ingest", error = %e, url = %link, "article scrape failed");
                    }
                }
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl FeedProvider for HttpFeedProvider {
    async fn fetch_latest(&self, source: &FeedSource, max_items: usize) -> Vec<RawItem> {
        crate::ingest::ensure_metrics_described();
        match self.try_fetch(source, max_items).await {
            Ok(items) => {
                counter!("ingest_items_total").increment(items.len() as u64);
                tracing::debug!(target: "ingest", url = %source.url, count = items.len(), "feed fetched");
                items
            }
            Err(e) => {
                tracing::warn!(target: "ingest", error = %e, url = %source.url, "source temporarily unavailable");
                counter!("ingest_source_unavailable_total").increment(1);
                Vec::new()
            }
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Serves a fixed document for every source. Used by tests and the demo binary.
pub struct FixtureFeedProvider {
    body: String,
}

impl FixtureFeedProvider {
    pub fn from_fixture(s: &str) -> Self {
        Self { body: s.to_string() }
    }
}

#[async_trait]
impl FeedProvider for FixtureFeedProvider {
    async fn fetch_latest(&self, source: &FeedSource, max_items: usize) -> Vec<RawItem> {
        match parse_feed(&self.body) {
            Ok(items) => newest_first(items, max_items),
            Err(e) => {
                tracing::warn!(target: "ingest", error = %e, url = %source.url, "fixture feed malformed");
                Vec::new()
            }
        }
    }

    fn name(&self) -> &'static str {
        "fixture"
    }
}
