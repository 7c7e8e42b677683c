// src/config/mod.rs
//! Runtime settings: one file (TOML or JSON), secrets optionally taken from
//! the environment, validated before anything touches the network.

pub mod ai;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::dispatch::{DestinationSet, ProcessingMode};
use crate::error::PipelineError;
use crate::ingest::types::FeedSource;
use crate::media::{Anchor, MediaOptions};
pub use ai::EnrichmentConfig;

pub const ENV_SETTINGS_PATH: &str = "NEWS_RELAY_SETTINGS";
pub const DEFAULT_SETTINGS_TOML: &str = "config/settings.toml";
pub const DEFAULT_SETTINGS_JSON: &str = "config/settings.json";

/// `"ENV"` (any case) means: read the value from `env_name`.
pub fn resolve_secret(value: &str, env_name: &str) -> Result<String> {
    if value.trim().eq_ignore_ascii_case("env") {
        std::env::var(env_name).map_err(|_| anyhow!("Missing {env_name} env var"))
    } else {
        Ok(value.to_string())
    }
}

fn default_true() -> bool {
    true
}
fn default_check_interval() -> u64 {
    600
}
fn default_publish_interval() -> u64 {
    5
}
fn default_scrape_delay() -> u64 {
    2000
}
fn default_max_items() -> usize {
    10
}
fn default_media_dir() -> PathBuf {
    PathBuf::from("public/images")
}
fn default_log_path() -> PathBuf {
    PathBuf::from("state/processed_log.json")
}
fn default_opacity() -> f32 {
    1.0
}
fn default_quality() -> u8 {
    85
}
fn default_max_dim() -> Option<u32> {
    Some(1280)
}
fn default_telegram_api() -> String {
    crate::dispatch::telegram::DEFAULT_API_BASE.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    /// "ENV" means: read from TELEGRAM_BOT_TOKEN
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            channel_id: String::new(),
            api_base: default_telegram_api(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebsiteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: String,
    /// "ENV" means: read from CONTENT_STORE_TOKEN
    #[serde(default)]
    pub api_token: String,
    #[serde(default)]
    pub site_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub logo_path: Option<PathBuf>,
    #[serde(default)]
    pub anchor: Anchor,
    #[serde(default = "default_opacity")]
    pub opacity: f32,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            logo_path: None,
            anchor: Anchor::TopLeft,
            opacity: default_opacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_max_dim")]
    pub max_width: Option<u32>,
    #[serde(default = "default_max_dim")]
    pub max_height: Option<u32>,
    #[serde(default = "default_quality")]
    pub quality: u8,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_width: default_max_dim(),
            max_height: default_max_dim(),
            quality: default_quality(),
        }
    }
}

fn default_primary_prices() -> Option<String> {
    Some("https://donya-e-eqtesad.com/".to_string())
}
fn default_price_api() -> Option<String> {
    Some("https://api.tgju.org/v1".to_string())
}
fn default_ticker_prices() -> Option<String> {
    Some("https://www.tgju.org/".to_string())
}

/// Price chain endpoints, in fallback order. `None` drops that step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricesConfig {
    #[serde(default = "default_primary_prices")]
    pub primary_url: Option<String>,
    #[serde(default = "default_price_api")]
    pub api_base: Option<String>,
    #[serde(default = "default_ticker_prices")]
    pub ticker_url: Option<String>,
}

impl Default for PricesConfig {
    fn default() -> Self {
        Self {
            primary_url: default_primary_prices(),
            api_base: default_price_api(),
            ticker_url: default_ticker_prices(),
        }
    }
}

/// Destination toggles for one category. Missing categories allow both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRouting {
    #[serde(default = "default_true")]
    pub telegram: bool,
    #[serde(default = "default_true")]
    pub website: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Seconds between scheduled batches.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Seconds between items within a batch.
    #[serde(default = "default_publish_interval")]
    pub publish_interval_secs: u64,
    /// Milliseconds between article page fetches.
    #[serde(default = "default_scrape_delay")]
    pub scrape_delay_ms: u64,
    #[serde(default = "default_max_items")]
    pub max_items_per_feed: usize,
    #[serde(default)]
    pub mode: ProcessingMode,
    /// Opt-in title similarity on top of exact link matching.
    #[serde(default)]
    pub fuzzy_duplicates: bool,
    /// Start the recurring scheduler on boot.
    #[serde(default)]
    pub scheduler_enabled: bool,
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub website: WebsiteConfig,
    #[serde(default)]
    pub watermark: WatermarkConfig,
    #[serde(default)]
    pub images: ImageConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub prices: PricesConfig,
    #[serde(default)]
    pub categories: HashMap<String, CategoryRouting>,
    #[serde(default)]
    pub sources: Vec<FeedSource>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            publish_interval_secs: default_publish_interval(),
            scrape_delay_ms: default_scrape_delay(),
            max_items_per_feed: default_max_items(),
            mode: ProcessingMode::Combined,
            fuzzy_duplicates: false,
            scheduler_enabled: false,
            media_dir: default_media_dir(),
            log_path: default_log_path(),
            telegram: TelegramConfig::default(),
            website: WebsiteConfig::default(),
            watermark: WatermarkConfig::default(),
            images: ImageConfig::default(),
            enrichment: EnrichmentConfig::default(),
            prices: PricesConfig::default(),
            categories: HashMap::new(),
            sources: Vec::new(),
        }
    }
}

impl Settings {
    /// Load from an explicit path. Format by extension (`.toml` / `.json`).
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let mut cfg = Self::parse(&data, &ext)
            .with_context(|| format!("parsing settings {}", path.display()))?;
        cfg.resolve_secrets()?;
        Ok(cfg)
    }

    /// Load using env var + fallbacks:
    /// 1) $NEWS_RELAY_SETTINGS
    /// 2) config/settings.toml
    /// 3) config/settings.json
    /// 4) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_SETTINGS_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                bail!("{ENV_SETTINGS_PATH} points to non-existent path {}", pb.display());
            }
            return Self::load_from_file(&pb);
        }
        for p in [DEFAULT_SETTINGS_TOML, DEFAULT_SETTINGS_JSON] {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from_file(&pb);
            }
        }
        tracing::warn!("no settings file found; using defaults");
        Ok(Self::default())
    }

    fn parse(s: &str, ext: &str) -> Result<Self> {
        match ext {
            "toml" => Ok(toml::from_str(s)?),
            "json" => Ok(serde_json::from_str(s)?),
            _ => serde_json::from_str(s)
                .or_else(|_| toml::from_str(s))
                .map_err(|_| anyhow!("unsupported settings format")),
        }
    }

    /// Resolve "ENV" placeholders for every enabled secret.
    pub fn resolve_secrets(&mut self) -> Result<()> {
        if self.telegram.enabled {
            self.telegram.bot_token = resolve_secret(&self.telegram.bot_token, "TELEGRAM_BOT_TOKEN")?;
        }
        if self.website.enabled {
            self.website.api_token = resolve_secret(&self.website.api_token, "CONTENT_STORE_TOKEN")?;
        }
        if self.enrichment.enabled {
            self.enrichment.resolve()?;
        }
        Ok(())
    }

    /// Every problem at once, as one operator-readable error.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut problems = Vec::new();

        if self.telegram.enabled {
            if self.telegram.bot_token.trim().is_empty() {
                problems.push("telegram.bot_token is required when telegram is enabled".to_string());
            }
            if self.telegram.channel_id.trim().is_empty() {
                problems.push("telegram.channel_id is required when telegram is enabled".to_string());
            }
        }
        if self.website.enabled {
            if url::Url::parse(&self.website.base_url).is_err() {
                problems.push(format!(
                    "website.base_url must be an absolute URL (got {:?})",
                    self.website.base_url
                ));
            }
            if self.website.api_token.trim().is_empty() {
                problems.push("website.api_token is required when website is enabled".to_string());
            }
        }
        if self.watermark.enabled && self.watermark.logo_path.is_none() {
            problems.push("watermark.logo_path is required when watermarking is enabled".to_string());
        }
        if !(0.0..=1.0).contains(&self.watermark.opacity) {
            problems.push("watermark.opacity must be within 0.0..=1.0".to_string());
        }
        if !(1..=100).contains(&self.images.quality) {
            problems.push("images.quality must be within 1..=100".to_string());
        }
        if self.check_interval_secs == 0 {
            problems.push("check_interval_secs must be positive".to_string());
        }
        problems.extend(self.enrichment.problems());
        for s in &self.sources {
            if url::Url::parse(&s.url).is_err() {
                problems.push(format!("source url is not valid: {:?}", s.url));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Configuration(problems.join("; ")))
        }
    }

    /// Globally enabled destinations.
    pub fn enabled_destinations(&self) -> DestinationSet {
        DestinationSet {
            telegram: self.telegram.enabled,
            website: self.website.enabled,
        }
    }

    /// Source routing ∩ category toggles ∩ enabled destinations.
    pub fn destinations_for(&self, source: &FeedSource) -> DestinationSet {
        let category = self
            .categories
            .get(&source.category)
            .map(|c| DestinationSet {
                telegram: c.telegram,
                website: c.website,
            })
            .unwrap_or(DestinationSet::both());
        source
            .routing
            .destinations()
            .intersect(category)
            .intersect(self.enabled_destinations())
    }

    pub fn media_options(&self) -> MediaOptions {
        MediaOptions {
            enable_watermark: self.watermark.enabled,
            watermark_path: self.watermark.logo_path.clone(),
            anchor: self.watermark.anchor,
            opacity: self.watermark.opacity,
            max_width: self.images.max_width,
            max_height: self.images.max_height,
            quality: self.images.quality,
            ..MediaOptions::default()
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs)
    }

    pub fn scrape_delay(&self) -> Duration {
        Duration::from_millis(self.scrape_delay_ms)
    }

    /// Active sources, highest priority first.
    pub fn active_sources(&self) -> Vec<FeedSource> {
        let mut v: Vec<FeedSource> = self.sources.iter().filter(|s| s.active).cloned().collect();
        v.sort_by(|a, b| b.priority.cmp(&a.priority));
        v
    }
}
