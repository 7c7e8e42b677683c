//! Article page scraping: body, hero image and video via ordered heuristics.

use std::time::Duration;

use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::{PipelineError, PipelineResult};
use crate::ingest::normalize_text;
use crate::ingest::types::RawItem;

pub const PAGE_TIMEOUT: Duration = Duration::from_secs(20);

fn sel(s: &str) -> Selector {
    Selector::parse(s).unwrap()
}

static SCRIPT: Lazy<Selector> = Lazy::new(|| sel("script"));
static VIDEO_SOURCE: Lazy<Selector> = Lazy::new(|| sel("video source[src], video[src]"));
static IFRAME: Lazy<Selector> = Lazy::new(|| sel("iframe[src]"));
static OG_IMAGE: Lazy<Selector> =
    Lazy::new(|| sel(r#"meta[property="og:image"], meta[name="og:image"]"#));
static TWITTER_IMAGE: Lazy<Selector> =
    Lazy::new(|| sel(r#"meta[name="twitter:image"], meta[property="twitter:image"]"#));
static LEAD_IMAGE: Lazy<Selector> = Lazy::new(|| {
    sel(".lead img, .lead-image img, .featured-image img, .post-thumbnail img, article figure img, figure.image img")
});
static ANY_IMG: Lazy<Selector> = Lazy::new(|| sel("img[src]"));
static OG_TITLE: Lazy<Selector> = Lazy::new(|| sel(r#"meta[property="og:title"]"#));
static H1: Lazy<Selector> = Lazy::new(|| sel("h1"));
static TITLE: Lazy<Selector> = Lazy::new(|| sel("title"));
static CONTENT: Lazy<Vec<Selector>> = Lazy::new(|| {
    [
        ".entry-content",
        ".post-content",
        ".article-content",
        "article .content",
        ".news-body",
        "article",
    ]
    .iter()
    .map(|s| sel(s))
    .collect()
});
static PARAGRAPH: Lazy<Selector> = Lazy::new(|| sel("p"));

/// Markers of a video player being initialised inside an inline script.
const PLAYER_MARKERS: &[&str] = &[
    "jwplayer",
    "videojs",
    "player.setup",
    "new plyr",
    "flowplayer",
    "hls.loadsource",
    "tavoos_init_player",
    "player_init",
];

static RE_STREAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^"'\s<>]+?\.m3u8(?:\?[^"'\s<>]*)?"#).unwrap());
static RE_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^"'\s<>]+?\.mp4(?:\?[^"'\s<>]*)?"#).unwrap());

/// What could be pulled out of one article page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArticlePage {
    pub title: Option<String>,
    pub body: Option<String>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
}

impl ArticlePage {
    /// Fill gaps in a feed item: page video always wins, image only when the
    /// feed had none, body when the page text is longer.
    pub fn merge_into(self, item: &mut RawItem) {
        if self.video_url.is_some() {
            item.video_url = self.video_url;
        }
        if item.image_url.is_none() {
            item.image_url = self.image_url;
        }
        if let Some(body) = self.body {
            let current = item
                .content
                .as_deref()
                .or(item.description.as_deref())
                .map(normalize_text)
                .unwrap_or_default();
            if body.chars().count() > current.chars().count() {
                item.content = Some(body);
            }
        }
        if item.title.as_deref().map_or(true, |t| t.trim().is_empty()) {
            item.title = self.title;
        }
    }
}

type Strategy = fn(&Html, &Url) -> Option<String>;

/// Ordered video strategies; first hit wins.
const VIDEO_STRATEGIES: &[(&str, Strategy)] = &[
    ("player_script", video_from_player_script),
    ("video_source", video_from_video_tag),
    ("iframe", video_from_iframe),
];

/// Ordered image strategies; first hit wins. The feed enclosure precedes all
/// of these and is handled by the feed parser.
const IMAGE_STRATEGIES: &[(&str, Strategy)] = &[
    ("og_image", image_from_og),
    ("twitter_image", image_from_twitter),
    ("lead_image", image_from_lead),
    ("first_img", first_non_logo_img),
];

fn resolve(base: &Url, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with("data:") {
        return None;
    }
    let u = base.join(raw).ok()?;
    matches!(u.scheme(), "http" | "https").then(|| u.to_string())
}

fn video_from_player_script(doc: &Html, base: &Url) -> Option<String> {
    for script in doc.select(&SCRIPT) {
        let text: String = script.text().collect();
        let lower = text.to_ascii_lowercase();
        if !PLAYER_MARKERS.iter().any(|m| lower.contains(m)) {
            continue;
        }
        if let Some(m) = RE_STREAM.find(&text).or_else(|| RE_FILE.find(&text)) {
            return resolve(base, m.as_str());
        }
    }
    None
}

fn video_from_video_tag(doc: &Html, base: &Url) -> Option<String> {
    doc.select(&VIDEO_SOURCE)
        .filter_map(|el| el.value().attr("src"))
        .find_map(|src| resolve(base, src))
}

fn video_from_iframe(doc: &Html, base: &Url) -> Option<String> {
    doc.select(&IFRAME)
        .filter_map(|el| el.value().attr("src"))
        .filter(|src| {
            let s = src.to_ascii_lowercase();
            s.contains("video") || s.contains("player") || s.contains("embed")
        })
        .find_map(|src| resolve(base, src))
}

fn image_from_og(doc: &Html, base: &Url) -> Option<String> {
    meta_content(doc, &OG_IMAGE, base)
}

fn image_from_twitter(doc: &Html, base: &Url) -> Option<String> {
    meta_content(doc, &TWITTER_IMAGE, base)
}

fn image_from_lead(doc: &Html, base: &Url) -> Option<String> {
    first_img(doc, &LEAD_IMAGE, base)
}

fn meta_content(doc: &Html, selector: &Selector, base: &Url) -> Option<String> {
    doc.select(selector)
        .filter_map(|el| el.value().attr("content"))
        .find_map(|c| resolve(base, c))
}

fn img_src(el: ElementRef<'_>) -> Option<&str> {
    let v = el.value();
    v.attr("data-src")
        .or_else(|| v.attr("data-lazy-src"))
        .or_else(|| v.attr("src"))
}

fn first_img(doc: &Html, selector: &Selector, base: &Url) -> Option<String> {
    doc.select(selector)
        .filter_map(img_src)
        .find_map(|src| resolve(base, src))
}

fn first_non_logo_img(doc: &Html, base: &Url) -> Option<String> {
    doc.select(&ANY_IMG)
        .filter(|el| {
            let v = el.value();
            let hay = format!(
                "{} {} {}",
                v.attr("src").unwrap_or_default(),
                v.attr("class").unwrap_or_default(),
                v.attr("alt").unwrap_or_default()
            )
            .to_ascii_lowercase();
            !["logo", "icon", "avatar", "banner", "/ads/"]
                .iter()
                .any(|bad| hay.contains(bad))
        })
        .filter_map(img_src)
        .find_map(|src| resolve(base, src))
}

fn extract_body(doc: &Html) -> Option<String> {
    let mut best: Option<String> = None;
    for selector in CONTENT.iter() {
        for el in doc.select(selector) {
            let paragraphs: Vec<String> = el
                .select(&PARAGRAPH)
                .map(|p| normalize_text(&p.text().collect::<String>()))
                .filter(|p| !p.is_empty())
                .collect();
            let text = if paragraphs.is_empty() {
                normalize_text(&el.text().collect::<String>())
            } else {
                paragraphs.join("\n\n")
            };
            if best
                .as_ref()
                .map_or(true, |b| text.chars().count() > b.chars().count())
            {
                best = Some(text);
            }
        }
    }
    best.filter(|b| !b.is_empty())
}

fn extract_title(doc: &Html) -> Option<String> {
    doc.select(&OG_TITLE)
        .filter_map(|el| el.value().attr("content"))
        .map(normalize_text)
        .chain(doc.select(&H1).map(|el| normalize_text(&el.text().collect::<String>())))
        .chain(doc.select(&TITLE).map(|el| normalize_text(&el.text().collect::<String>())))
        .find(|t| !t.is_empty())
}

fn first_hit(doc: &Html, base: &Url, strategies: &[(&str, Strategy)], what: &str) -> Option<String> {
    strategies.iter().find_map(|(name, f)| {
        let hit = f(doc, base)?;
        tracing::debug!(target: "ingest", strategy = *name, kind = what, url = %hit, "extracted");
        Some(hit)
    })
}

/// Extract everything from an already-fetched page.
pub fn parse_article(html: &str, page_url: &str) -> PipelineResult<ArticlePage> {
    let base = Url::parse(page_url)
        .map_err(|e| PipelineError::UpstreamFormat(format!("bad page url {page_url}: {e}")))?;
    let doc = Html::parse_document(html);
    Ok(ArticlePage {
        title: extract_title(&doc),
        body: extract_body(&doc),
        image_url: first_hit(&doc, &base, IMAGE_STRATEGIES, "image"),
        video_url: first_hit(&doc, &base, VIDEO_STRATEGIES, "video"),
    })
}

#[derive(Clone)]
pub struct PageScraper {
    client: reqwest::Client,
    timeout: Duration,
}

impl PageScraper {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: PAGE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn fetch_article(&self, url: &str) -> PipelineResult<ArticlePage> {
        let rsp = self
            .client
            .get(url)
            .header(
                reqwest::header::USER_AGENT,
                "Mozilla/5.0 (compatible; news-relay/0.1)",
            )
            .header(reqwest::header::ACCEPT, "text/html,application/xhtml+xml")
            .timeout(self.timeout)
            .send()
            .await?;
        if !rsp.status().is_success() {
            return Err(PipelineError::Network(format!("HTTP {} for {url}", rsp.status())));
        }
        let final_url = rsp.url().to_string();
        let html = rsp.text().await?;
        counter!("ingest_pages_scraped_total").increment(1);
        // Html is !Send; parse outside of any await point.
        parse_article(&html, &final_url)
    }
}
