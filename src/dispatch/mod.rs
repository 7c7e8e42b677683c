//! Multi-destination dispatch.
//!
//! One item fans out to at most two sinks. Each destination keeps its own
//! duplicate classification and log slot; a failure at one destination never
//! aborts another.

pub mod telegram;
pub mod website;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dedup::DuplicateChecker;
use crate::enrich::{Draft, Enricher};
use crate::error::{PipelineError, PipelineResult};
use crate::ingest::types::{CanonicalItem, FeedSource};
use crate::media::{MediaOptions, MediaProcessor};
use crate::store::{DestinationStatus, LogStore, NewLogEntry, ProcessedLogEntry};

pub use telegram::TelegramSink;
pub use website::ContentStoreSink;

/// Bodies shorter than this are replaced by the title before publishing.
pub const MIN_BODY_CHARS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Telegram,
    Website,
}

impl Destination {
    pub const ALL: [Destination; 2] = [Destination::Telegram, Destination::Website];

    pub fn as_str(self) -> &'static str {
        match self {
            Destination::Telegram => "telegram",
            Destination::Website => "website",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subset of {telegram, website}.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationSet {
    pub telegram: bool,
    pub website: bool,
}

impl DestinationSet {
    pub const fn none() -> Self {
        Self {
            telegram: false,
            website: false,
        }
    }

    pub const fn both() -> Self {
        Self {
            telegram: true,
            website: true,
        }
    }

    pub fn only(d: Destination) -> Self {
        let mut s = Self::none();
        s.insert(d);
        s
    }

    pub fn contains(&self, d: Destination) -> bool {
        match d {
            Destination::Telegram => self.telegram,
            Destination::Website => self.website,
        }
    }

    pub fn insert(&mut self, d: Destination) {
        match d {
            Destination::Telegram => self.telegram = true,
            Destination::Website => self.website = true,
        }
    }

    pub fn remove(&mut self, d: Destination) {
        match d {
            Destination::Telegram => self.telegram = false,
            Destination::Website => self.website = false,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.telegram && !self.website
    }

    pub fn intersect(self, other: Self) -> Self {
        Self {
            telegram: self.telegram && other.telegram,
            website: self.website && other.website,
        }
    }

    pub fn minus(self, other: Self) -> Self {
        Self {
            telegram: self.telegram && !other.telegram,
            website: self.website && !other.website,
        }
    }

    pub fn iter(self) -> impl Iterator<Item = Destination> {
        Destination::ALL.into_iter().filter(move |d| self.contains(*d))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }
}

/// Selects one of two enrichment pipeline shapes; both end in the same
/// per-destination dispatch step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    /// One enrichment call produces text for every pending destination.
    #[default]
    Combined,
    /// One enrichment call per pending destination.
    Separate,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchRequest {
    pub destinations: DestinationSet,
    pub mode: ProcessingMode,
    /// Operator override: republish even if the log already has the link.
    pub skip_duplicate_check: bool,
}

impl DispatchRequest {
    pub fn new(destinations: DestinationSet, mode: ProcessingMode) -> Self {
        Self {
            destinations,
            mode,
            skip_duplicate_check: false,
        }
    }
}

/// Uniform result shape returned for every destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkOutcome {
    pub attempted: bool,
    pub success: bool,
    pub external_id: Option<String>,
    pub error: Option<String>,
}

impl SinkOutcome {
    pub fn ok(external_id: impl Into<String>) -> Self {
        Self {
            attempted: true,
            success: true,
            external_id: Some(external_id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            attempted: true,
            success: false,
            external_id: None,
            error: Some(error.into()),
        }
    }

    /// Not sent because of a precondition (e.g. destination not configured).
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            attempted: false,
            success: false,
            external_id: None,
            error: Some(reason.into()),
        }
    }

    fn status_label(&self) -> &'static str {
        match (self.attempted, self.success) {
            (_, true) => "success",
            (true, false) => "error",
            (false, false) => "skipped",
        }
    }
}

impl From<PipelineResult<String>> for SinkOutcome {
    fn from(r: PipelineResult<String>) -> Self {
        match r {
            Ok(id) => SinkOutcome::ok(id),
            Err(e) => SinkOutcome::failed(e.to_string()),
        }
    }
}

/// Everything a sink needs to publish one item.
#[derive(Debug, Clone)]
pub struct PublishPayload<'a> {
    pub item: &'a CanonicalItem,
    pub draft: &'a Draft,
    /// Locally processed image, if any.
    pub image_path: Option<&'a std::path::Path>,
    pub video_url: Option<&'a str>,
}

#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    fn destination(&self) -> Destination;
    /// Returns the external id (message id / content id) on success.
    async fn publish(&self, payload: &PublishPayload<'_>) -> PipelineResult<String>;
}

/// Terminal classification of one item.
#[derive(Debug, Clone)]
pub enum ItemOutcome {
    /// Every requested destination already had the link.
    DuplicateSkip {
        link: String,
        satisfied: DestinationSet,
    },
    Processed {
        entry: ProcessedLogEntry,
        outcomes: HashMap<Destination, SinkOutcome>,
        /// Requested destinations skipped because they were already satisfied.
        skipped_duplicates: DestinationSet,
    },
    /// Item-level failure before any destination was attempted.
    Failed { link: String, error: String },
}

impl ItemOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, ItemOutcome::DuplicateSkip { .. })
    }

    pub fn outcome(&self, d: Destination) -> Option<&SinkOutcome> {
        match self {
            ItemOutcome::Processed { outcomes, .. } => outcomes.get(&d),
            _ => None,
        }
    }
}

/// Coordinates duplicate checks, media, enrichment and sinks for each item.
pub struct Orchestrator {
    store: Arc<dyn LogStore>,
    checker: DuplicateChecker,
    media: Arc<MediaProcessor>,
    media_options: MediaOptions,
    enricher: Arc<Enricher>,
    sinks: HashMap<Destination, Arc<dyn Sink>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn LogStore>,
        media: Arc<MediaProcessor>,
        media_options: MediaOptions,
        enricher: Arc<Enricher>,
    ) -> Self {
        Self {
            checker: DuplicateChecker::new(store.clone()),
            store,
            media,
            media_options,
            enricher,
            sinks: HashMap::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.insert(sink.destination(), sink);
        self
    }

    pub fn with_fuzzy_duplicates(mut self, enabled: bool) -> Self {
        self.checker = self.checker.with_fuzzy(enabled);
        self
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    /// Log an item that could not be normalized, so it is visible to the
    /// operator and retried on the next run.
    pub async fn record_failure(
        &self,
        link: &str,
        source: &FeedSource,
        requested: DestinationSet,
        error: &PipelineError,
    ) -> ItemOutcome {
        let begun = self
            .store
            .begin(NewLogEntry {
                link: link.to_string(),
                title: String::new(),
                source_url: source.url.clone(),
                category: source.category.clone(),
            })
            .await;
        match begun {
            Ok(entry) => {
                let outcome = SinkOutcome::skipped(error.to_string());
                for d in requested.iter() {
                    if entry.record(d).status == DestinationStatus::Success {
                        continue;
                    }
                    if let Err(e) = self.store.record_outcome(entry.id, d, &outcome).await {
                        warn!(target: "dispatch", error = ?e, "could not record item failure");
                    }
                }
                if let Err(e) = self.store.finish(entry.id).await {
                    warn!(target: "dispatch", error = ?e, link, "could not finalize failed entry");
                }
            }
            Err(e) => warn!(target: "dispatch", error = ?e, link, "could not open log entry"),
        }
        counter!("dispatch_items_failed_total").increment(1);
        ItemOutcome::Failed {
            link: link.to_string(),
            error: error.to_string(),
        }
    }

    /// Process one item for the requested destinations.
    pub async fn dispatch(&self, item: &CanonicalItem, req: &DispatchRequest) -> ItemOutcome {
        let requested = req.destinations;

        let classification = if req.skip_duplicate_check {
            Default::default()
        } else {
            match self
                .checker
                .classify(&item.link, &item.title, &item.source_url)
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    warn!(target: "dispatch", error = ?e, link = %item.link, "duplicate check failed; item skipped");
                    counter!("dispatch_items_failed_total").increment(1);
                    return ItemOutcome::Failed {
                        link: item.link.clone(),
                        error: format!("duplicate check failed: {e:#}"),
                    };
                }
            }
        };

        let skipped_duplicates = requested.intersect(classification.satisfied);
        let pending = requested.minus(classification.satisfied);

        if pending.is_empty() {
            if let Some(existing) = &classification.existing {
                if let Err(e) = self.store.record_duplicate(existing.id).await {
                    warn!(target: "dispatch", error = ?e, "could not record duplicate hit");
                }
            }
            counter!("dispatch_duplicates_total").increment(1);
            debug!(target: "dispatch", link = %item.link, "duplicate for all requested destinations");
            return ItemOutcome::DuplicateSkip {
                link: item.link.clone(),
                satisfied: classification.satisfied,
            };
        }

        let entry = match self
            .store
            .begin(NewLogEntry {
                link: item.link.clone(),
                title: item.title.clone(),
                source_url: item.source_url.clone(),
                category: item.category.clone(),
            })
            .await
        {
            Ok(e) => e,
            Err(e) => {
                warn!(target: "dispatch", error = ?e, link = %item.link, "could not open log entry");
                return ItemOutcome::Failed {
                    link: item.link.clone(),
                    error: format!("log store unavailable: {e:#}"),
                };
            }
        };

        let item = with_usable_body(item);

        // Media is resolved once per item and shared by every destination.
        let image_path = match item.image_url.as_deref() {
            Some(url) => self.media.process(url, &self.media_options).await,
            None => None,
        };

        let drafts = self.plan_drafts(req.mode, pending, &item).await;

        let mut outcomes = HashMap::new();
        for d in pending.iter() {
            let outcome = match (self.sinks.get(&d), drafts.get(&d)) {
                (Some(sink), Some(draft)) => {
                    let payload = PublishPayload {
                        item: &item,
                        draft,
                        image_path: image_path.as_deref(),
                        video_url: item.video_url.as_deref(),
                    };
                    SinkOutcome::from(sink.publish(&payload).await)
                }
                _ => SinkOutcome::skipped(
                    PipelineError::Configuration(format!("{d} sink is not configured"))
                        .to_string(),
                ),
            };

            counter!("dispatch_outcomes_total", "destination" => d.as_str(), "status" => outcome.status_label())
                .increment(1);
            if let Some(err) = &outcome.error {
                warn!(target: "dispatch", destination = %d, link = %item.link, error = %err, "destination failed");
            } else {
                info!(target: "dispatch", destination = %d, link = %item.link, id = ?outcome.external_id, "published");
            }

            if let Err(e) = self.store.record_outcome(entry.id, d, &outcome).await {
                warn!(target: "dispatch", error = ?e, destination = %d, "could not record outcome");
            }
            outcomes.insert(d, outcome);
        }

        let entry = match self.store.finish(entry.id).await {
            Ok(Some(e)) => e,
            Ok(None) => entry,
            Err(e) => {
                warn!(target: "dispatch", error = ?e, "could not finalize log entry");
                entry
            }
        };

        ItemOutcome::Processed {
            entry,
            outcomes,
            skipped_duplicates,
        }
    }

    /// Produce one draft per pending destination, using the enrichment shape
    /// selected by `mode`. Destinations whose enrichment fails fall back to
    /// the raw title/body.
    async fn plan_drafts(
        &self,
        mode: ProcessingMode,
        pending: DestinationSet,
        item: &CanonicalItem,
    ) -> HashMap<Destination, Draft> {
        let mut drafts = match mode {
            ProcessingMode::Combined => self.combined_shape(pending, item).await,
            ProcessingMode::Separate => self.separate_shape(pending, item).await,
        };
        for d in pending.iter() {
            drafts.entry(d).or_insert_with(|| Draft::raw(d, item));
        }
        drafts
    }

    async fn combined_shape(
        &self,
        pending: DestinationSet,
        item: &CanonicalItem,
    ) -> HashMap<Destination, Draft> {
        if item.has_metadata() || pending.len() < 2 {
            return self.separate_shape(pending, item).await;
        }
        match self.enricher.combined(item).await {
            Some(c) => c.into_drafts(pending, item),
            None => HashMap::new(),
        }
    }

    async fn separate_shape(
        &self,
        pending: DestinationSet,
        item: &CanonicalItem,
    ) -> HashMap<Destination, Draft> {
        let mut out = HashMap::new();
        if item.has_metadata() {
            return out;
        }
        for d in pending.iter() {
            if let Some(draft) = self.enricher.for_destination(d, item).await {
                out.insert(d, draft);
            }
        }
        out
    }
}

/// Replace a too-short body with the title.
fn with_usable_body(item: &CanonicalItem) -> CanonicalItem {
    let mut item = item.clone();
    if item.body.trim().chars().count() < MIN_BODY_CHARS {
        item.body = item.title.clone();
    }
    item
}
