//! Concrete price sources, from heaviest to cheapest.

use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::warn;

use super::{parse_number, PriceItem, PriceSnapshot, PriceSource, Trend};

pub const SCRAPE_TIMEOUT: Duration = Duration::from_secs(20);
pub const API_TIMEOUT: Duration = Duration::from_secs(5);

/// CSS selectors describing one ticker layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeLayout {
    pub item: String,
    pub title: String,
    pub price: String,
    pub percent: String,
}

impl ScrapeLayout {
    /// Full-page header carousel (`li.plus|minus|equal` entries).
    pub fn carousel() -> Self {
        Self {
            item: "#carousel_header li.plus, #carousel_header li.minus, #carousel_header li.equal"
                .into(),
            title: ".title a".into(),
            price: ".price span".into(),
            percent: ".price-percentage .wrapper span".into(),
        }
    }

    /// Compact info-bar ticker.
    pub fn ticker() -> Self {
        Self {
            item: "ul.info-bar li".into(),
            title: "h3".into(),
            price: "span.info-price".into(),
            percent: "span.info-change".into(),
        }
    }
}

fn trend_from_class(el: &scraper::ElementRef<'_>) -> Option<Trend> {
    let classes: Vec<&str> = el.value().classes().collect();
    if classes.contains(&"plus") || classes.contains(&"high") {
        Some(Trend::Plus)
    } else if classes.contains(&"minus") || classes.contains(&"low") {
        Some(Trend::Minus)
    } else if classes.contains(&"equal") {
        Some(Trend::Equal)
    } else {
        None
    }
}

fn text_of(el: &scraper::ElementRef<'_>, sel: &Selector) -> Option<String> {
    el.select(sel)
        .next()
        .map(|e| e.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Items in page order, deduplicated by title. Invalid selectors yield nothing.
pub fn parse_layout(html: &str, layout: &ScrapeLayout) -> Vec<PriceItem> {
    let (Ok(item), Ok(title), Ok(price), Ok(percent)) = (
        Selector::parse(&layout.item),
        Selector::parse(&layout.title),
        Selector::parse(&layout.price),
        Selector::parse(&layout.percent),
    ) else {
        warn!(target: "prices", "invalid scrape layout selectors");
        return Vec::new();
    };

    let doc = Html::parse_document(html);
    let mut out: Vec<PriceItem> = Vec::new();
    for el in doc.select(&item) {
        let (Some(t), Some(p)) = (text_of(&el, &title), text_of(&el, &price)) else {
            continue;
        };
        if out.iter().any(|i| i.title == t) {
            continue;
        }
        let Some(value) = parse_number(&p) else {
            continue;
        };
        let mut pct = text_of(&el, &percent)
            .and_then(|s| parse_number(&s))
            .unwrap_or(0.0);
        let trend = trend_from_class(&el).unwrap_or(Trend::from_change(pct));
        // Some layouts print the percentage unsigned and carry the sign in the class.
        if trend == Trend::Minus && pct > 0.0 {
            pct = -pct;
        }
        out.push(PriceItem {
            title: t,
            price: p,
            change: value * pct / 100.0,
            change_percent: pct,
            trend,
        });
    }
    out
}

/// Scrapes one HTML page with a fixed layout.
pub struct ScrapeSource {
    name: &'static str,
    client: reqwest::Client,
    url: String,
    layout: ScrapeLayout,
    timeout: Duration,
}

impl ScrapeSource {
    pub fn new(
        name: &'static str,
        client: reqwest::Client,
        url: impl Into<String>,
        layout: ScrapeLayout,
    ) -> Self {
        Self {
            name,
            client,
            url: url.into(),
            layout,
            timeout: SCRAPE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn page(&self) -> Result<String, reqwest::Error> {
        self.client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

#[async_trait::async_trait]
impl PriceSource for ScrapeSource {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn fetch(&self) -> Option<Vec<PriceItem>> {
        match self.page().await {
            Ok(html) => Some(parse_layout(&html, &self.layout)),
            Err(e) => {
                warn!(target: "prices", source = self.name, error = %e, "price page fetch failed");
                None
            }
        }
    }
}

/// One JSON endpoint per instrument, queried concurrently.
pub struct AggregatedApiSource {
    client: reqwest::Client,
    base: String,
    /// (symbol, display title)
    symbols: Vec<(String, String)>,
    timeout: Duration,
}

impl AggregatedApiSource {
    pub fn new(client: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
            symbols: default_symbols(),
            timeout: API_TIMEOUT,
        }
    }

    pub fn with_symbols(mut self, symbols: Vec<(String, String)>) -> Self {
        self.symbols = symbols;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn one(&self, symbol: &str) -> Option<Value> {
        let url = format!("{}/data/{}", self.base, symbol);
        let rsp = self
            .client
            .get(&url)
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .timeout(self.timeout)
            .send()
            .await
            .ok()?;
        if !rsp.status().is_success() {
            return None;
        }
        rsp.json::<Value>().await.ok()
    }
}

fn default_symbols() -> Vec<(String, String)> {
    [
        ("index_tse", "شاخص کل بورس"),
        ("price_dollar_rl", "دلار بازار"),
        ("price_geram18", "گرم طلا ۱۸ عیار"),
        ("price_sekee", "سکه امامی"),
        ("price_eur", "یورو"),
        ("price_btc", "بیت کوین"),
    ]
    .into_iter()
    .map(|(s, t)| (s.to_string(), t.to_string()))
    .collect()
}

fn field(v: &Value, long: &str, short: &str) -> f64 {
    let raw = v.get(long).or_else(|| v.get(short));
    match raw {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => parse_number(s).unwrap_or(0.0),
        _ => 0.0,
    }
}

/// `{"current": {...}}` or the bare object; price under `price`/`p`.
pub fn api_item(title: &str, body: &Value) -> Option<PriceItem> {
    let cur = body.get("current").unwrap_or(body);
    if !cur.is_object() {
        return None;
    }
    let price = field(cur, "price", "p");
    if price == 0.0 {
        return None;
    }
    Some(PriceItem::new(
        title,
        price,
        field(cur, "change", "c"),
        field(cur, "changePercent", "cp"),
    ))
}

#[async_trait::async_trait]
impl PriceSource for AggregatedApiSource {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn fetch(&self) -> Option<Vec<PriceItem>> {
        let bodies = join_all(self.symbols.iter().map(|(s, _)| self.one(s))).await;
        let items: Vec<PriceItem> = self
            .symbols
            .iter()
            .zip(bodies)
            .filter_map(|((_, title), body)| api_item(title, &body?))
            .collect();
        (!items.is_empty()).then_some(items)
    }
}

/// Last resort. Never empty.
#[derive(Debug, Clone)]
pub struct StaticPriceSource {
    items: Vec<PriceItem>,
}

impl StaticPriceSource {
    pub fn new(items: Vec<PriceItem>) -> Self {
        if items.is_empty() {
            return Self::default();
        }
        Self { items }
    }

    pub fn snapshot(&self) -> PriceSnapshot {
        PriceSnapshot {
            items: self.items.clone(),
            source: "static".to_string(),
            fetched_at: Utc::now(),
        }
    }
}

impl Default for StaticPriceSource {
    fn default() -> Self {
        Self {
            items: vec![
                PriceItem::new("دلار بازار", 120_800.0, 0.49, 0.49),
                PriceItem::new("گرم طلا ۱۸ عیار", 12_360_681.0, 0.46, 0.46),
                PriceItem::new("سکه امامی", 128_000_000.0, 0.0, 0.0),
                PriceItem::new("یورو", 140_700.0, 0.35, 0.35),
                PriceItem::new("بیت کوین", 88_719.0, -3.60, -3.60),
            ],
        }
    }
}

#[async_trait::async_trait]
impl PriceSource for StaticPriceSource {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn fetch(&self) -> Option<Vec<PriceItem>> {
        Some(self.items.clone())
    }
}
