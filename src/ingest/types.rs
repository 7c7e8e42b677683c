use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatch::{Destination, DestinationSet};

/// Which destinations a feed source is routed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Routing {
    Telegram,
    Website,
    #[default]
    Both,
}

impl Routing {
    pub fn destinations(self) -> DestinationSet {
        match self {
            Routing::Telegram => DestinationSet::only(Destination::Telegram),
            Routing::Website => DestinationSet::only(Destination::Website),
            Routing::Both => DestinationSet::both(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Use only what the feed carries.
    #[default]
    Feed,
    /// Also fetch every article page for body, image and video.
    Scrape,
}

fn default_true() -> bool {
    true
}

/// Operator-managed feed definition. Read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSource {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    pub category: String,
    #[serde(default)]
    pub routing: Routing,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub mode: FetchMode,
}

impl FeedSource {
    pub fn new(url: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
            category: category.into(),
            routing: Routing::Both,
            priority: 0,
            active: true,
            mode: FetchMode::Feed,
        }
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }
}

/// One entry as it came out of a feed (optionally merged with its scraped page).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawItem {
    pub title: Option<String>,
    pub link: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
}

/// Normalized item, transient within one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalItem {
    pub title: String,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
    pub body: String,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub source_url: String,
    pub category: String,
    /// Pre-existing metadata; enrichment is skipped when both are present.
    pub summary: Option<String>,
    pub keywords: Vec<String>,
}

impl CanonicalItem {
    pub fn has_metadata(&self) -> bool {
        self.summary.as_deref().is_some_and(|s| !s.trim().is_empty()) && !self.keywords.is_empty()
    }
}

#[async_trait::async_trait]
pub trait FeedProvider: Send + Sync {
    /// Most recent items first, at most `max_items`. An unreachable or
    /// malformed source yields an empty vec.
    async fn fetch_latest(&self, source: &FeedSource, max_items: usize) -> Vec<RawItem>;
    fn name(&self) -> &'static str;
}
