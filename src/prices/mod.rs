//! Market-price snapshots behind a single-flight, stale-while-revalidate cache.
//!
//! Reads never wait on a refresh that someone else is running: they get the
//! stale snapshot, or the static fallback when nothing was cached yet.

pub mod sources;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use sources::{AggregatedApiSource, ScrapeLayout, ScrapeSource, StaticPriceSource};

pub const PRICE_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Plus,
    Minus,
    Equal,
}

impl Trend {
    /// Sign of the change decides the trend.
    pub fn from_change(change: f64) -> Self {
        if change > 0.0 {
            Trend::Plus
        } else if change < 0.0 {
            Trend::Minus
        } else {
            Trend::Equal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceItem {
    pub title: String,
    /// Already formatted for display.
    pub price: String,
    pub change: f64,
    pub change_percent: f64,
    #[serde(rename = "type")]
    pub trend: Trend,
}

impl PriceItem {
    pub fn new(title: impl Into<String>, price: f64, change: f64, change_percent: f64) -> Self {
        Self {
            title: title.into(),
            price: format_price(price),
            change,
            change_percent,
            trend: Trend::from_change(change),
        }
    }
}

/// Replaced wholesale on each successful refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSnapshot {
    pub items: Vec<PriceItem>,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

/// What a read returns: the snapshot plus whether it came from the cache.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceRead {
    #[serde(flatten)]
    pub snapshot: PriceSnapshot,
    pub cached: bool,
    pub stale: bool,
}

#[async_trait::async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` (or an empty list) means "try the next source".
    async fn fetch(&self) -> Option<Vec<PriceItem>>;
}

struct Cached {
    snapshot: PriceSnapshot,
    at: Instant,
}

pub struct PriceCache {
    chain: Vec<Arc<dyn PriceSource>>,
    fallback: StaticPriceSource,
    ttl: Duration,
    state: RwLock<Option<Cached>>,
    refreshing: Mutex<()>,
}

impl PriceCache {
    /// `chain` is tried in order; the static fallback always comes last.
    pub fn new(chain: Vec<Arc<dyn PriceSource>>) -> Self {
        Self {
            chain,
            fallback: StaticPriceSource::default(),
            ttl: PRICE_CACHE_TTL,
            state: RwLock::new(None),
            refreshing: Mutex::new(()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_fallback(mut self, fallback: StaticPriceSource) -> Self {
        self.fallback = fallback;
        self
    }

    async fn fresh(&self) -> Option<PriceSnapshot> {
        let guard = self.state.read().await;
        guard
            .as_ref()
            .filter(|c| c.at.elapsed() < self.ttl)
            .map(|c| c.snapshot.clone())
    }

    async fn stale_or_fallback(&self) -> PriceRead {
        match self.state.read().await.as_ref() {
            Some(c) => PriceRead {
                snapshot: c.snapshot.clone(),
                cached: true,
                stale: true,
            },
            None => PriceRead {
                snapshot: self.fallback.snapshot(),
                cached: false,
                stale: false,
            },
        }
    }

    pub async fn get(&self) -> PriceRead {
        if let Some(snapshot) = self.fresh().await {
            debug!(target: "prices", "serving market prices from cache");
            return PriceRead {
                snapshot,
                cached: true,
                stale: false,
            };
        }

        let Ok(_refresh) = self.refreshing.try_lock() else {
            debug!(target: "prices", "refresh in progress; serving stale or fallback");
            return self.stale_or_fallback().await;
        };

        // Someone may have finished a refresh between the check and the lock.
        if let Some(snapshot) = self.fresh().await {
            return PriceRead {
                snapshot,
                cached: true,
                stale: false,
            };
        }

        let snapshot = self.run_chain().await;
        *self.state.write().await = Some(Cached {
            snapshot: snapshot.clone(),
            at: Instant::now(),
        });
        PriceRead {
            snapshot,
            cached: false,
            stale: false,
        }
    }

    async fn run_chain(&self) -> PriceSnapshot {
        for source in &self.chain {
            match source.fetch().await {
                Some(items) if !items.is_empty() => {
                    info!(target: "prices", source = source.name(), items = items.len(), "price refresh succeeded");
                    counter!("price_refresh_total", "source" => source.name()).increment(1);
                    return PriceSnapshot {
                        items,
                        source: source.name().to_string(),
                        fetched_at: Utc::now(),
                    };
                }
                _ => {
                    warn!(target: "prices", source = source.name(), "price source returned nothing; trying next");
                }
            }
        }
        counter!("price_refresh_total", "source" => self.fallback.name()).increment(1);
        self.fallback.snapshot()
    }
}

/// Accepts Persian/Arabic-Indic digits, thousands separators and a trailing `%`.
pub fn parse_number(raw: &str) -> Option<f64> {
    let mut out = String::new();
    for ch in raw.trim().chars() {
        let c = match ch {
            '۰'..='۹' => char::from_digit(ch as u32 - '۰' as u32, 10)?,
            '٠'..='٩' => char::from_digit(ch as u32 - '٠' as u32, 10)?,
            '٫' | '.' => '.',
            '−' | '-' => '-',
            '+' => '+',
            '0'..='9' => ch,
            _ => continue,
        };
        out.push(c);
    }
    if out.is_empty() {
        return None;
    }
    out.parse().ok()
}

/// `1234567.891` → `1,234,567.89`; whole numbers carry no decimals.
pub fn format_price(value: f64) -> String {
    let rounded = (value * 100.0).round() / 100.0;
    let negative = rounded < 0.0;
    let abs = rounded.abs();
    let whole = abs.trunc() as u64;
    let cents = ((abs - abs.trunc()) * 100.0).round() as u64;

    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if negative { "-" } else { "" };
    if cents == 0 {
        format!("{sign}{grouped}")
    } else {
        format!("{sign}{grouped}.{cents:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_in_any_digit_script() {
        assert_eq!(parse_number("۱۲۰,۸۰۰"), Some(120800.0));
        assert_eq!(parse_number("-3.60 %"), Some(-3.6));
        assert_eq!(parse_number("٠٫٤٩"), Some(0.49));
        assert_eq!(parse_number("n/a"), None);
    }

    #[test]
    fn prices_get_thousands_separators() {
        assert_eq!(format_price(120800.0), "120,800");
        assert_eq!(format_price(12360681.0), "12,360,681");
        assert_eq!(format_price(88719.456), "88,719.46");
        assert_eq!(format_price(999.0), "999");
        assert_eq!(format_price(-1500.5), "-1,500.50");
    }

    #[test]
    fn trend_follows_sign() {
        assert_eq!(PriceItem::new("x", 1.0, 0.2, 0.1).trend, Trend::Plus);
        assert_eq!(PriceItem::new("x", 1.0, -0.2, -0.1).trend, Trend::Minus);
        assert_eq!(PriceItem::new("x", 1.0, 0.0, 0.0).trend, Trend::Equal);
    }
}
