// src/bootstrap.rs
//! Wires every service from a validated [`Settings`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use crate::config::Settings;
use crate::dispatch::{ContentStoreSink, Orchestrator, TelegramSink};
use crate::enrich::{build_client, Enricher};
use crate::ingest::feed::HttpFeedProvider;
use crate::ingest::types::{CanonicalItem, FeedProvider};
use crate::media::{HttpMediaFetcher, MediaProcessor};
use crate::pipeline::Pipeline;
use crate::prices::{AggregatedApiSource, PriceCache, PriceSource, ScrapeLayout, ScrapeSource};
use crate::progress::ProgressTracker;
use crate::store::{FileLogStore, LogStore};

const USER_AGENT: &str = concat!("news-relay/", env!("CARGO_PKG_VERSION"));

/// Every long-lived service, explicitly constructed.
pub struct Runtime {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn LogStore>,
    pub enricher: Arc<Enricher>,
    pub tracker: ProgressTracker,
    pub pipeline: Arc<Pipeline>,
    pub prices: Arc<PriceCache>,
}

impl Runtime {
    pub async fn from_settings(settings: Settings) -> anyhow::Result<Self> {
        settings.validate()?;
        let settings = Arc::new(settings);

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("building HTTP client")?;

        let store: Arc<dyn LogStore> = Arc::new(
            FileLogStore::open(&settings.log_path)
                .await
                .with_context(|| format!("opening log {}", settings.log_path.display()))?,
        );

        let media = Arc::new(MediaProcessor::new(
            Arc::new(HttpMediaFetcher::new(client.clone())),
            settings.media_dir.clone(),
        ));

        let enricher = Arc::new(Enricher::new(build_client(&settings.enrichment)?));
        info!(
            provider = enricher.provider_name(),
            enabled = settings.enrichment.enabled,
            key_len = settings.enrichment.api_key.len(),
            "enrichment configured"
        );

        let mut orchestrator = Orchestrator::new(
            store.clone(),
            media,
            settings.media_options(),
            enricher.clone(),
        )
        .with_fuzzy_duplicates(settings.fuzzy_duplicates);

        if settings.telegram.enabled {
            let sink = TelegramSink::new(
                client.clone(),
                settings.telegram.bot_token.clone(),
                settings.telegram.channel_id.clone(),
            )
            .with_api_base(settings.telegram.api_base.clone());
            orchestrator = orchestrator.with_sink(Arc::new(sink));
        }
        if settings.website.enabled {
            let mut sink = ContentStoreSink::new(
                client.clone(),
                settings.website.base_url.clone(),
                settings.website.api_token.clone(),
            )
            .with_media_root(settings.media_dir.clone());
            if let Some(site) = &settings.website.site_url {
                sink = sink.with_site_url(site.clone());
            }
            orchestrator = orchestrator.with_sink(Arc::new(sink));
        }

        let feeds: Arc<dyn FeedProvider> =
            Arc::new(HttpFeedProvider::new(client.clone()).with_scrape_delay(settings.scrape_delay()));
        let tracker = ProgressTracker::new();
        let pipeline = Arc::new(Pipeline::new(
            settings.clone(),
            feeds,
            Arc::new(orchestrator),
            tracker.clone(),
        ));

        let prices = Arc::new(PriceCache::new(price_chain(&settings, &client)));

        Ok(Self {
            settings,
            store,
            enricher,
            tracker,
            pipeline,
            prices,
        })
    }

    /// One enrichment call on a canned item; logs the result, never fails.
    pub async fn enrichment_probe(&self) {
        if !self.settings.enrichment.enabled {
            warn!("enrichment probe skipped: enrichment is disabled");
            return;
        }
        let sample = CanonicalItem {
            title: "Central bank holds rates steady".into(),
            body: "The central bank kept its benchmark rate unchanged on Tuesday, \
                   citing easing inflation and a stable currency market."
                .into(),
            category: "economy".into(),
            ..CanonicalItem::default()
        };
        let out = self.enricher.combined(&sample).await;
        info!(provider = self.enricher.provider_name(), ok = out.is_some(), "enrichment probe finished");
    }
}

/// primary scrape → aggregated API → lightweight scrape (static fallback is built in).
fn price_chain(settings: &Settings, client: &reqwest::Client) -> Vec<Arc<dyn PriceSource>> {
    let mut chain: Vec<Arc<dyn PriceSource>> = Vec::new();
    if let Some(url) = &settings.prices.primary_url {
        chain.push(Arc::new(ScrapeSource::new(
            "primary",
            client.clone(),
            url.clone(),
            ScrapeLayout::carousel(),
        )));
    }
    if let Some(base) = &settings.prices.api_base {
        chain.push(Arc::new(AggregatedApiSource::new(client.clone(), base.clone())));
    }
    if let Some(url) = &settings.prices.ticker_url {
        chain.push(Arc::new(ScrapeSource::new(
            "ticker",
            client.clone(),
            url.clone(),
            ScrapeLayout::ticker(),
        )));
    }
    chain
}
